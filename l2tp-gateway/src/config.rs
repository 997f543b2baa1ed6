// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents, including CIDR parsing, the PPP address pool and the
//! consistency of site-to-site users and routes.

use crate::types::{Config, DynDnsAddressSource, RouteGateway, SiteToSiteRole};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

impl Config {
    /// Relocate the status store. The runner, the pppd hooks and the
    /// inspection commands must all be given the same override, or they
    /// end up reading different documents.
    pub fn with_status_file(mut self, status_file: Option<PathBuf>) -> Self {
        if let Some(path) = status_file {
            self.paths.status_file = path;
        }
        self
    }
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    if config.network.public.device.is_empty() {
        anyhow::bail!("network.public.device cannot be empty");
    }
    if let Some(private) = &config.network.private {
        if private.device.is_empty() || private.device == config.network.public.device {
            anyhow::bail!("network.private.device must be set and differ from the public device");
        }
    }

    // Pool must sit inside the PPP subnet and leave the server address out
    let ppp = &config.ppp;
    if ppp.range.first > ppp.range.last {
        anyhow::bail!("ppp.range is empty: {}", ppp.range);
    }
    if !ppp.subnet.contains(ppp.range.first) || !ppp.subnet.contains(ppp.range.last) {
        anyhow::bail!("ppp.range {} is outside ppp.subnet {}", ppp.range, ppp.subnet);
    }
    if ppp.range.contains(ppp.subnet.last_usable()) {
        anyhow::bail!(
            "ppp.range {} contains the server address {}",
            ppp.range,
            ppp.subnet.last_usable()
        );
    }

    let mut seen = HashSet::new();
    for user in &config.users {
        if user.username.is_empty() {
            anyhow::bail!("username cannot be empty");
        }
        if !seen.insert(user.username.as_str()) {
            anyhow::bail!("duplicate user: {}", user.username);
        }
        if let Some(ip) = user.fixed_ip {
            if ppp.range.contains(ip) {
                anyhow::bail!("fixed IP {} of user {} is inside ppp.range", ip, user.username);
            }
        }
        if let Some(s2s) = &user.site_to_site {
            if s2s.role == SiteToSiteRole::Client {
                anyhow::ensure!(
                    s2s.destination.as_deref().is_some_and(|d| !d.is_empty()),
                    "site-to-site client {} needs a destination",
                    user.username
                );
                anyhow::ensure!(
                    s2s.psk.is_some(),
                    "site-to-site client {} needs a psk",
                    user.username
                );
            }
        }
    }

    for route in config
        .network
        .gateway_routes
        .iter()
        .chain(&config.network.client_routes)
    {
        if let RouteGateway::SiteToSite { user } = &route.gateway {
            let found = config
                .find_user(user)
                .is_some_and(|u| u.site_to_site.is_some());
            if !found {
                anyhow::bail!(
                    "route {} refers to unknown site-to-site user {}",
                    route.subnet,
                    user
                );
            }
        }
    }

    if let Some(dyndns) = &config.dyndns {
        if dyndns.address == DynDnsAddressSource::Static && dyndns.static_address.is_none() {
            anyhow::bail!("dyndns.static_address is required with address = \"static\"");
        }
    }

    let license = &config.license;
    if !(0.0..1.0).contains(&license.connection_leeway) {
        anyhow::bail!("license.connection_leeway must be within [0, 1)");
    }

    let t = &config.timeouts;
    if t.dhcp_try_count == 0 || t.dhcp_poll_interval == 0 || t.mainloop_poll_interval == 0 {
        anyhow::bail!("timeouts must be > 0");
    }

    let m = &config.monitors;
    if m.router_warning_limit >= m.router_restart_limit {
        anyhow::bail!("monitors.router_warning_limit must be below router_restart_limit");
    }

    Ok(())
}

/// Split `X.X.X.X/N` into address and prefix length
fn parse_cidr_parts(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let parts: Vec<&str> = cidr.split('/').collect();
    if parts.len() != 2 {
        anyhow::bail!("Invalid CIDR format (expected X.X.X.X/N)");
    }

    let ip: Ipv4Addr = parts[0].parse().context("Invalid IP address")?;
    let prefix_len: u8 = parts[1].parse().context("Invalid prefix length")?;

    if prefix_len > 32 {
        anyhow::bail!("Prefix length must be <= 32");
    }
    Ok((ip, prefix_len))
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0u32
    } else {
        !0u32 << (32 - prefix_len)
    }
}

/// IPv4 address with prefix length, e.g. an interface address or a route subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Ipv4Cidr {
    /// Address as written (host bits preserved)
    pub addr: Ipv4Addr,
    /// Prefix length, 0 to 32
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Build from an address and prefix length
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Dotted netmask for the prefix
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix))
    }

    /// Network address with host bits cleared
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & prefix_mask(self.prefix))
    }

    /// Directed broadcast address
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !prefix_mask(self.prefix))
    }

    /// Highest usable host address; the PPP server address lives here
    pub fn last_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()).saturating_sub(1))
    }

    /// Whether `ip` falls inside the subnet
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// Subnet form (`network/prefix`) for route commands
    pub fn subnet_string(&self) -> String {
        format!("{}/{}", self.network(), self.prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = parse_cidr_parts(s).with_context(|| format!("Invalid CIDR: {}", s))?;
        Ok(Self { addr, prefix })
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Inclusive address range `first-last`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct AddressRange {
    /// First address of the range
    pub first: Ipv4Addr,
    /// Last address of the range, inclusive
    pub last: Ipv4Addr,
}

impl AddressRange {
    /// Whether `ip` lies within `first..=last`
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.first)..=u32::from(self.last)).contains(&u32::from(ip))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl FromStr for AddressRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (first, last) = s
            .split_once('-')
            .with_context(|| format!("Invalid range (expected A-B): {}", s))?;
        Ok(Self {
            first: first.trim().parse().context("Invalid range start")?,
            last: last.trim().parse().context("Invalid range end")?,
        })
    }
}

impl TryFrom<String> for AddressRange {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Interface address source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AddressConfig {
    /// Address obtained from dhclient
    Dhcp,
    /// Fixed address and prefix
    Static(Ipv4Cidr),
}

impl TryFrom<String> for AddressConfig {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        if s.eq_ignore_ascii_case("dhcp") {
            Ok(AddressConfig::Dhcp)
        } else {
            Ok(AddressConfig::Static(s.parse()?))
        }
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[general]
log_level = "debug"

[network]
dns_servers = ["203.0.113.53"]
proxy_arp = true

[network.public]
device = "eth0"
address = "203.0.113.10/24"
default_gateway = "203.0.113.1"

[network.private]
device = "eth1"
address = "10.0.0.2/24"

[[network.gateway_routes]]
subnet = "0.0.0.0/0"
gateway = { kind = "network-default" }

[[network.client_routes]]
subnet = "10.10.0.0/16"
gateway = { kind = "static", router = "10.0.0.1" }

[[network.client_routes]]
subnet = "172.16.5.0/24"
gateway = { kind = "site-to-site", user = "branch" }
metric = 10

[ppp]
subnet = "192.168.100.0/24"
range = "192.168.100.2-192.168.100.253"
dns_servers = ["192.168.100.254"]
wins_servers = ["10.0.0.20"]

[[users]]
username = "alice"

[[users]]
username = "bob"

[[users]]
username = "carol"
fixed_ip = "192.168.200.7"

[[users]]
username = "branch"
site_to_site = { role = "client", destination = "branch.example.com", psk = "s3cret" }

[[users]]
username = "hq"
site_to_site = { role = "server" }

[radius]
servers = ["10.0.0.30"]

[ipsec]
pre_shared_keys = ["primary-key", "old-key"]
"#;

/// Parsed and validated sample configuration shared by unit tests
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let config: Config = toml::from_str(SAMPLE_CONFIG).unwrap();
    validate_config(&config).unwrap();
    config
}
