// Firewall rule generation and application

//! Per PPP device netfilter chains.
//!
//! Each device gets its own chains in the raw, nat, mangle and filter
//! tables, linked from the shared `<table>_<hook>_ppp` chains that the
//! runner installs at start. Rules are rendered as an `iptables-restore`
//! script and loaded with `-n` (no flush) while holding an exclusive lock
//! file, because creating and linking chains across tables is not atomic.

use crate::config::Ipv4Cidr;
use crate::exec::{run_checked, CommandSpec, Executor};
use crate::types::{
    FWMARK_IPSEC, FWMARK_LICENSE_RESTRICTED, FWMARK_LOCAL_L2TP, FWMARK_PPP, FWMARK_PPP_S2S, FWMARK_SKIPNAT,
    L2TP_CLIENT_PORT, L2TP_PEER_PORT,
};
use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IPTABLES: &str = "/sbin/iptables";
const IPTABLES_RESTORE: &str = "/sbin/iptables-restore";

/// Always allowed through a restricted connection (DNS)
const ALLOWED_TCP_PORTS: &[u16] = &[53];
/// DNS and WINS
const ALLOWED_UDP_PORTS: &[u16] = &[53, 137];

/// Short chain suffix per netfilter hook
fn hook_suffix(hook: &str) -> &'static str {
    match hook {
        "prerouting" => "prert",
        "postrouting" => "postrt",
        "input" => "input",
        "forward" => "forward",
        _ => "output",
    }
}

/// Hooks with per-device chains, per table
const TABLE_HOOKS: &[(&str, &[&str])] = &[
    ("raw", &["prerouting", "output"]),
    ("nat", &["prerouting", "output", "postrouting"]),
    ("mangle", &["prerouting", "input", "forward", "output", "postrouting"]),
    ("filter", &["input", "forward", "output"]),
];

/// Local target for forced HTTP/HTTPS traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebForward {
    /// Gateway address the traffic is sent to
    pub address: Ipv4Addr,
    /// Local port for plain HTTP
    pub http_port: u16,
    /// Local port for HTTPS
    pub https_port: u16,
}

/// Connection attributes the device rules are derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRules {
    /// PPP device, e.g. `ppp0`
    pub device: String,
    /// Address assigned to the client
    pub peer_address: Ipv4Addr,
    /// Gateway side address of the tunnel
    pub own_address: Ipv4Addr,
    /// Only DNS and WINS may pass, plus the web forward if any
    pub restricted: bool,
    /// Where forced HTTP/HTTPS traffic goes
    pub web_forward: Option<WebForward>,
    /// Drop packets whose source is not the peer address
    pub spoof_prevention: bool,
    /// Site-to-site tunnel; routed subnets are allowed through
    pub site_to_site: bool,
    /// Emit jumps to the `<table>_<hook>_ppp_cust` customization chains
    pub custom_chains: bool,
}

fn link_direction(hook: &str) -> &'static str {
    match hook {
        "prerouting" | "input" => "-i",
        _ => "-o",
    }
}

/// Render the restore script for one device
pub fn device_script(rules: &DeviceRules) -> String {
    let dev = rules.device.as_str();
    let mut out = String::new();

    for (table, hooks) in TABLE_HOOKS {
        let _ = writeln!(out, "*{}", table);
        for hook in *hooks {
            let _ = writeln!(out, ":ppp_{}_{} -", hook_suffix(hook), dev);
        }
        for hook in *hooks {
            let chain = format!("ppp_{}_{}", hook_suffix(hook), dev);
            let parent = format!("{}_{}_ppp", table, hook);
            if *hook == "forward" {
                // Forwarded traffic is matched in both directions
                let _ = writeln!(out, "-A {} -i {} -j {}", parent, dev, chain);
                let _ = writeln!(out, "-A {} -o {} -j {}", parent, dev, chain);
            } else {
                let _ = writeln!(out, "-A {} {} {} -j {}", parent, link_direction(hook), dev, chain);
            }
        }

        match *table {
            "raw" => {
                if rules.spoof_prevention {
                    let _ = writeln!(out, "-A ppp_prert_{} -s ! {} -j DROP", dev, rules.peer_address);
                }
            }
            "nat" => {
                if let Some(fwd) = &rules.web_forward {
                    for (port, target) in [(80, fwd.http_port), (443, fwd.https_port)] {
                        let _ = writeln!(
                            out,
                            "-A ppp_prert_{dev} ! -d {own} -p tcp --dport {port} -j DNAT --to-destination {addr}:{target}-{target}",
                            dev = dev,
                            own = rules.own_address,
                            port = port,
                            addr = fwd.address,
                            target = target,
                        );
                    }
                }
            }
            "mangle" => {
                if rules.restricted {
                    let _ = writeln!(
                        out,
                        "-A ppp_prert_{} -j MARK --set-mark {}",
                        dev, FWMARK_LICENSE_RESTRICTED
                    );
                }
                if rules.site_to_site {
                    let _ = writeln!(out, "-A ppp_prert_{} -j MARK --set-mark {}", dev, FWMARK_PPP_S2S);
                    let _ = writeln!(out, "-A ppp_postrt_{} -j MARK --set-mark {}", dev, FWMARK_PPP_S2S);
                }
            }
            _ => {
                if rules.restricted {
                    for port in ALLOWED_TCP_PORTS {
                        let _ = writeln!(out, "-A ppp_forward_{} -p tcp --dport {} -j ACCEPT", dev, port);
                    }
                    for port in ALLOWED_UDP_PORTS {
                        let _ = writeln!(out, "-A ppp_forward_{} -p udp --dport {} -j ACCEPT", dev, port);
                    }
                    let _ = writeln!(
                        out,
                        "-A ppp_forward_{} -j REJECT --reject-with icmp-port-unreachable",
                        dev
                    );
                }
                let _ = writeln!(out, "-A ppp_forward_{} -i {} -j filter_forward_ppp_firewall", dev, dev);
            }
        }

        if rules.custom_chains {
            for hook in *hooks {
                let _ = writeln!(
                    out,
                    "-A ppp_{}_{} -j {}_{}_ppp_cust",
                    hook_suffix(hook),
                    dev,
                    table,
                    hook
                );
            }
        }
        out.push_str("COMMIT\n");
    }
    out
}

/// Individual `iptables` invocations that undo [`device_script`]
pub fn teardown_commands(dev: &str) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    for (table, hooks) in TABLE_HOOKS {
        for hook in *hooks {
            let chain = format!("ppp_{}_{}", hook_suffix(hook), dev);
            let parent = format!("{}_{}_ppp", table, hook);
            let directions = if *hook == "forward" {
                vec!["-i", "-o"]
            } else {
                vec![link_direction(hook)]
            };
            for dir in directions {
                commands.push(vec![
                    "-t".to_string(),
                    table.to_string(),
                    "-D".to_string(),
                    parent.clone(),
                    dir.to_string(),
                    dev.to_string(),
                    "-j".to_string(),
                    chain.clone(),
                ]);
            }
        }
        for op in ["-F", "-X"] {
            for hook in *hooks {
                commands.push(vec![
                    "-t".to_string(),
                    table.to_string(),
                    op.to_string(),
                    format!("ppp_{}_{}", hook_suffix(hook), dev),
                ]);
            }
        }
    }
    commands
}

/// Gateway wide chains and rules installed once by the runner
#[derive(Debug, Clone)]
pub struct BaseRules {
    /// Uplink interface
    pub public_device: String,
    /// LAN interface, if configured
    pub private_device: Option<String>,
    /// Subnet the PPP clients are numbered from
    pub ppp_subnet: Ipv4Cidr,
}

/// Render the script that creates the shared chains
pub fn base_script(base: &BaseRules) -> String {
    let mut out = String::new();
    for (table, hooks) in TABLE_HOOKS {
        let _ = writeln!(out, "*{}", table);
        for hook in *hooks {
            let _ = writeln!(out, ":{}_{}_ppp - [0:0]", table, hook);
            let _ = writeln!(out, ":{}_{}_ppp_cust - [0:0]", table, hook);
        }
        if *table == "filter" {
            out.push_str(":filter_forward_ppp_firewall - [0:0]\n");
        }
        if *table == "mangle" {
            let _ = writeln!(out, "-A PREROUTING -p esp -j MARK --set-mark {}", FWMARK_IPSEC);
            let _ = writeln!(out, "-A PREROUTING -p udp --dport 4500 -j MARK --set-mark {}", FWMARK_IPSEC);
            let _ = writeln!(out, "-A PREROUTING -i l2tp+ -j MARK --set-mark {}", FWMARK_PPP);
            for port in [L2TP_PEER_PORT, L2TP_CLIENT_PORT] {
                let _ = writeln!(
                    out,
                    "-A OUTPUT -p udp --sport {} -j MARK --set-mark {}",
                    port, FWMARK_LOCAL_L2TP
                );
            }
        }
        for hook in *hooks {
            let _ = writeln!(out, "-A {} -j {}_{}_ppp", hook.to_uppercase(), table, hook);
        }
        if *table == "nat" {
            let subnet = base.ppp_subnet.subnet_string();
            let _ = writeln!(
                out,
                "-A POSTROUTING -m mark --mark {m}/{m} -j ACCEPT",
                m = FWMARK_SKIPNAT
            );
            let _ = writeln!(out, "-A POSTROUTING -s {} -o {} -j MASQUERADE", subnet, base.public_device);
            if let Some(private) = &base.private_device {
                let _ = writeln!(out, "-A POSTROUTING -s {} -o {} -j MASQUERADE", subnet, private);
            }
        }
        out.push_str("COMMIT\n");
    }
    out
}

/// Script that empties every table (used on stop)
pub fn flush_script() -> String {
    TABLE_HOOKS
        .iter()
        .map(|(table, _)| format!("*{}\nCOMMIT\n", table))
        .collect()
}

/// Whether scripts are loaded or only checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Load the rules into the kernel
    Apply,
    /// `iptables-restore --test`: parse and validate without committing
    ValidateOnly,
}

/// Serialized access to the kernel rule tables
#[derive(Clone)]
pub struct Firewall {
    exec: Arc<dyn Executor>,
    lock_path: PathBuf,
    mode: ApplyMode,
}

impl Firewall {
    /// Rule loader serialized through the lock file at `lock_path`
    pub fn new(exec: Arc<dyn Executor>, lock_path: impl Into<PathBuf>, mode: ApplyMode) -> Self {
        Self {
            exec,
            lock_path: lock_path.into(),
            mode,
        }
    }

    fn lock(&self) -> Result<Flock<fs::File>> {
        lock_file(&self.lock_path)
    }

    async fn restore(&self, script: &str, noflush: bool) -> Result<()> {
        let mut cmd = CommandSpec::new(IPTABLES_RESTORE);
        if noflush {
            cmd = cmd.arg("-n");
        }
        if self.mode == ApplyMode::ValidateOnly {
            cmd = cmd.arg("--test");
        }
        let _lock = self.lock()?;
        run_checked(self.exec.as_ref(), cmd.stdin(script)).await?;
        Ok(())
    }

    /// Install rules for one device; call [`Firewall::tear_down_device`] first
    pub async fn set_up_device(&self, rules: &DeviceRules) -> Result<()> {
        let script = device_script(rules);
        for (n, line) in script.lines().enumerate() {
            log::debug!("{}: {}", n + 1, line);
        }
        self.restore(&script, true)
            .await
            .with_context(|| format!("Failed to set up firewall for {}", rules.device))
    }

    /// Remove the device's chains; missing rules or chains are expected
    pub async fn tear_down_device(&self, dev: &str, silent: bool) -> Result<()> {
        log::info!("starting teardown firewall for device {}", dev);
        if self.mode == ApplyMode::ValidateOnly {
            return Ok(());
        }

        let _lock = self.lock()?;
        let commands = teardown_commands(dev);
        let attempts = commands.len();
        let mut errors = 0;
        for args in commands {
            let cmd = CommandSpec::new(IPTABLES).args(args);
            if let Err(e) = run_checked(self.exec.as_ref(), cmd).await {
                errors += 1;
                if !silent {
                    log::debug!("teardown command failed: {:#}", e);
                }
            }
        }

        if errors > 0 && !silent {
            log::warn!("{} errors ({} attempts) in firewall teardown of {}", errors, attempts, dev);
        } else {
            log::debug!("{} errors ({} attempts) in firewall teardown of {}", errors, attempts, dev);
        }
        Ok(())
    }

    /// Create the shared chains (flushes all tables)
    pub async fn up(&self, base: &BaseRules) -> Result<()> {
        self.restore(&base_script(base), false)
            .await
            .context("Failed to set up base firewall")
    }

    /// Flush all tables and delete every user chain
    pub async fn down(&self) -> Result<()> {
        self.restore(&flush_script(), false)
            .await
            .context("Failed to flush firewall")
    }
}

fn lock_file(path: &Path) -> Result<Flock<fs::File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create firewall lock directory")?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| errno)
        .with_context(|| format!("Failed to lock {}", path.display()))
}
