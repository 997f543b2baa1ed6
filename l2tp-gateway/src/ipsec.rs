// IPsec SA metadata lookup

//! Cross-references the L2TP tunnel behind a PPP device with the kernel's
//! IPsec SA table to find the outer endpoint, SPI pair, encapsulation mode
//! and which pre-shared key the IKE daemon used. Missing data degrades to
//! [`IpsecInfo::default`] instead of failing the connection.

use crate::exec::{run_checked, CommandSpec, Executor};
use crate::status::{EncapsulationMode, DEFAULT_SPI};
use crate::types::{L2TP_PEER_PORT, NATT_PORT};
use anyhow::{Context, Result};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// L2TP daemon control client
pub const OPENL2TPCONFIG: &str = "/usr/bin/openl2tpconfig";
/// IPsec SA database tool
pub const SETKEY: &str = "/usr/sbin/setkey";

/// IKE/IPsec facts recorded on a PppDevice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsecInfo {
    /// Index of the pre-shared key the peer authenticated with
    pub psk_index: u32,
    /// Whether ESP travels inside UDP
    pub encapsulation: EncapsulationMode,
    /// Public address of the remote endpoint
    pub outer_address: Ipv4Addr,
    /// Public source port of the remote endpoint
    pub outer_port: u16,
    /// Inbound SPI, hex
    pub spi_rx: String,
    /// Outbound SPI, hex
    pub spi_tx: String,
}

impl Default for IpsecInfo {
    fn default() -> Self {
        Self {
            psk_index: 0,
            encapsulation: EncapsulationMode::EspOverUdp,
            outer_address: Ipv4Addr::UNSPECIFIED,
            outer_port: 0,
            spi_rx: DEFAULT_SPI.to_string(),
            spi_tx: DEFAULT_SPI.to_string(),
        }
    }
}

/// L2TP tunnel id from a device name of the form `l2tp<tunnel>-<session>`
pub fn tunnel_id_from_device(device: &str) -> Option<u32> {
    let rest = device.strip_prefix("l2tp")?;
    let (tunnel, session) = rest.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(tunnel) || !digits(session) {
        return None;
    }
    tunnel.parse().ok()
}

/// Peer address and UDP port from `openl2tpconfig tunnel show` output
pub fn parse_tunnel_endpoint(output: &str) -> Option<(Ipv4Addr, u16)> {
    let mut peer_addr = None;
    let mut peer_port = None;
    for line in output.lines() {
        // "Tunnel 123, from 203.0.113.10 to 198.51.100.7:"
        if let Some(rest) = line.strip_prefix("Tunnel ") {
            if let Some((_, to)) = rest.split_once(" to ") {
                let addr: String = to
                    .trim_start()
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == '.')
                    .collect();
                peer_addr = addr.parse().ok();
            }
            continue;
        }
        // "  UDP ports: local 1701, peer 4500"
        let trimmed = line.trim();
        if line.starts_with(char::is_whitespace) {
            if let Some(ports) = trimmed.strip_prefix("UDP ports:") {
                if let Some((_, peer)) = ports.split_once("peer") {
                    peer_port = peer.trim().parse().ok();
                }
            }
        }
    }
    Some((peer_addr?, peer_port?))
}

/// SPI pair and encapsulation of the SAs for one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaMatch {
    /// Hex digits without `0x`
    pub spi_rx: String,
    /// Outbound SPI, hex
    pub spi_tx: String,
    /// ESP is UDP encapsulated (NAT traversal)
    pub udp_encaps: bool,
}

fn parse_sa_endpoint(token: &str) -> Option<(Ipv4Addr, Option<u16>)> {
    match token.split_once('[') {
        Some((addr, port)) => {
            let port = port.strip_suffix(']')?.parse().ok()?;
            Some((addr.parse().ok()?, Some(port)))
        }
        None => Some((token.parse().ok()?, None)),
    }
}

fn parse_spi(line: &str) -> Option<String> {
    let start = line.find("spi=")? + 4;
    let rest = &line[start..];
    let open = rest.find("(0x")?;
    if !rest[..open].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hex = &rest[open + 3..];
    let close = hex.find(')')?;
    Some(hex[..close].to_string())
}

/// Find the first inbound and outbound SA for `remote`/`port` in `setkey -D` output
pub fn parse_sa_table(output: &str, remote: Ipv4Addr, port: u16) -> Result<Option<SaMatch>> {
    let mut match_rx = false;
    let mut match_tx = false;
    let mut spi_rx: Option<String> = None;
    let mut spi_tx: Option<String> = None;
    let mut udp_encaps = false;

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let header = match tokens.as_slice() {
            [src, dst] => parse_sa_endpoint(src).zip(parse_sa_endpoint(dst)),
            _ => None,
        };

        if let Some(((tx_ip, tx_port), (rx_ip, rx_port))) = header {
            match_rx = false;
            match_tx = false;
            match (tx_port, rx_port) {
                (Some(tp), Some(rp)) => {
                    udp_encaps = true;
                    if tx_ip == remote && tp == port {
                        match_rx = true;
                    } else if rx_ip == remote && rp == port {
                        match_tx = true;
                    }
                }
                (None, None) => {
                    udp_encaps = false;
                    if port == L2TP_PEER_PORT {
                        match_rx = tx_ip == remote;
                        match_tx = !match_rx && rx_ip == remote;
                    }
                }
                _ => anyhow::bail!("cannot parse setkey line: {}", line.trim()),
            }
        }

        if match_rx && spi_rx.is_none() {
            spi_rx = parse_spi(line);
        } else if match_tx && spi_tx.is_none() {
            spi_tx = parse_spi(line);
        }

        if let (Some(rx), Some(tx)) = (&spi_rx, &spi_tx) {
            return Ok(Some(SaMatch {
                spi_rx: rx.clone(),
                spi_tx: tx.clone(),
                udp_encaps,
            }));
        }
    }
    Ok(None)
}

/// `preshared secret index: N` from an SA info file
pub fn parse_psk_index(contents: &str) -> Option<u32> {
    contents
        .lines()
        .filter_map(|l| l.trim().strip_prefix("preshared secret index:"))
        .filter_map(|v| v.trim().parse().ok())
        .last()
}

async fn lookup(
    exec: &dyn Executor,
    sainfo_dir: &Path,
    device: &str,
    site_to_site_client: bool,
) -> Result<IpsecInfo> {
    let tunnel_id = tunnel_id_from_device(device)
        .with_context(|| format!("cannot determine tunnel id from device name {}", device))?;

    let show = CommandSpec::new(OPENL2TPCONFIG).stdin(format!("tunnel show tunnel_id={}\nquit\n", tunnel_id));
    let out = run_checked(exec, show).await?;
    let (addr, mut port) = parse_tunnel_endpoint(&out.stdout)
        .with_context(|| format!("cannot determine endpoint for tunnel id {}", tunnel_id))?;

    if site_to_site_client {
        log::debug!("forcing site-to-site client remote port to {}", NATT_PORT);
        port = NATT_PORT;
    }

    let out = run_checked(exec, CommandSpec::new(SETKEY).arg("-D")).await?;
    let sa = parse_sa_table(&out.stdout, addr, port)?
        .with_context(|| format!("no SA found for {}:{}", addr, port))?;

    let path = sainfo_dir.join(format!("sainfo_{}", sa.spi_rx));
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let psk_index = parse_psk_index(&contents)
        .with_context(|| format!("no psk index in {}", path.display()))?;

    Ok(IpsecInfo {
        psk_index,
        encapsulation: if sa.udp_encaps {
            EncapsulationMode::EspOverUdp
        } else {
            EncapsulationMode::EspPlain
        },
        outer_address: addr,
        outer_port: port,
        spi_rx: format!("0x{}", sa.spi_rx),
        spi_tx: format!("0x{}", sa.spi_tx),
    })
}

/// Look up SA metadata for a PPP device, falling back to defaults
pub async fn lookup_or_default(
    exec: &dyn Executor,
    sainfo_dir: &Path,
    device: &str,
    site_to_site_client: bool,
) -> IpsecInfo {
    match lookup(exec, sainfo_dir, device, site_to_site_client).await {
        Ok(info) => info,
        Err(e) => {
            log::warn!("cannot determine psk index for {}, using defaults: {:#}", device, e);
            IpsecInfo::default()
        }
    }
}
