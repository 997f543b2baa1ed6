// DHCP client hook

//! Handler for the events dhclient reports through its script hook.
//!
//! Received parameters are never configured on the host directly. The hook
//! writes them to the device's lease file and signals the runner, which
//! picks the lease up on its own schedule:
//!
//! - SIGUSR1 for a new lease (BOUND, REBOOT, or the first RENEW/REBIND)
//! - SIGHUP when RENEW/REBIND reports a different address
//! - SIGUSR2 when the lease is lost (EXPIRE, FAIL, TIMEOUT)

use crate::config::{AddressConfig, Ipv4Cidr};
use crate::exec::Executor;
use crate::network::DhcpLease;
use crate::types::Config;
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::fs;
use std::net::Ipv4Addr;

/// The dhclient `reason` values the hook acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpReason {
    /// Fresh lease
    Bound,
    /// Lease renewed with the same server
    Renew,
    /// Lease renewed with any server
    Rebind,
    /// Old lease confirmed after boot
    Reboot,
    /// Lease ran out
    Expire,
    /// Server refused us
    Fail,
    /// No server answered
    Timeout,
    /// MEDIUM, PREINIT, STOP, RELEASE, NBI and anything unknown
    Other,
}

impl DhcpReason {
    /// Map the `reason` token; unknown values become [`DhcpReason::Other`]
    pub fn parse(token: &str) -> Self {
        match token {
            "BOUND" => DhcpReason::Bound,
            "RENEW" => DhcpReason::Renew,
            "REBIND" => DhcpReason::Rebind,
            "REBOOT" => DhcpReason::Reboot,
            "EXPIRE" => DhcpReason::Expire,
            "FAIL" => DhcpReason::Fail,
            "TIMEOUT" => DhcpReason::Timeout,
            _ => DhcpReason::Other,
        }
    }
}

/// Parameters of one hook invocation, read from dhclient's environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpEvent {
    /// Parsed `reason`
    pub reason: DhcpReason,
    /// `reason` as dhclient passed it
    pub raw_reason: String,
    /// Interface the lease belongs to
    pub interface: String,
    /// `new_ip_address`
    pub new_address: Option<Ipv4Addr>,
    /// `new_subnet_mask`
    pub new_netmask: Option<Ipv4Addr>,
    /// `old_ip_address`
    pub old_address: Option<Ipv4Addr>,
    /// `new_routers`
    pub routers: Vec<Ipv4Addr>,
    /// `new_dhcp_server_identifier`
    pub server_identifier: Option<Ipv4Addr>,
    /// `new_domain_name_servers`
    pub dns_servers: Vec<Ipv4Addr>,
}

fn parse_list(value: Option<String>) -> Vec<Ipv4Addr> {
    value
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect()
}

impl DhcpEvent {
    /// Read the event from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the event through `env`, so tests need not touch the real environment
    pub fn from_lookup<F>(env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.is_empty());
        let addr = |key: &str| -> Result<Option<Ipv4Addr>> {
            var(key)
                .map(|v| v.parse().with_context(|| format!("Invalid {}: {}", key, v)))
                .transpose()
        };

        let raw_reason = var("reason").context("reason not set")?;
        Ok(Self {
            reason: DhcpReason::parse(&raw_reason),
            interface: var("interface").context("interface not set")?,
            new_address: addr("new_ip_address")?,
            new_netmask: addr("new_subnet_mask")?,
            old_address: addr("old_ip_address")?,
            routers: parse_list(var("new_routers")),
            // Some servers send garbage here, it is only a fallback
            server_identifier: var("new_dhcp_server_identifier").and_then(|v| v.parse().ok()),
            dns_servers: parse_list(var("new_domain_name_servers")),
            raw_reason,
        })
    }

    fn address_changed(&self) -> bool {
        matches!(self.old_address, Some(old) if Some(old) != self.new_address)
    }

    /// Lease to record for a bound address. Without a router option the
    /// DHCP server itself is assumed to be the router.
    fn lease(&self) -> Result<DhcpLease> {
        let address = self.new_address.context("new_ip_address not set")?;
        let netmask = self.new_netmask.context("new_subnet_mask not set")?;
        let prefix = netmask_to_prefix(netmask)?;

        let routers = if !self.routers.is_empty() {
            self.routers.clone()
        } else if let Some(server) = self.server_identifier {
            log::info!("no router from dhcp server, defaulting to server {} for {}", server, address);
            vec![server]
        } else {
            log::info!("cannot determine router for dhcp address {}", address);
            Vec::new()
        };

        Ok(DhcpLease {
            address: Ipv4Cidr::new(address, prefix),
            routers,
            dns_servers: self.dns_servers.clone(),
        })
    }
}

fn netmask_to_prefix(mask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    anyhow::ensure!(bits.checked_shl(prefix).unwrap_or(0) == 0, "Non-contiguous netmask {}", mask);
    Ok(prefix as u8)
}

/// Record the event and signal the runner. Returns the signal sent, if any.
pub fn handle_event(cfg: &Config, exec: &dyn Executor, event: &DhcpEvent) -> Result<Option<Signal>> {
    let known = cfg
        .interfaces()
        .any(|i| i.device == event.interface && i.address == AddressConfig::Dhcp);
    anyhow::ensure!(known, "{} is not a DHCP configured interface", event.interface);

    let signal = match event.reason {
        DhcpReason::Bound | DhcpReason::Renew | DhcpReason::Rebind | DhcpReason::Reboot => {
            if event.reason == DhcpReason::Reboot {
                log::warn!("unexpected DHCP REBOOT event, reporting it anyway");
            }
            let changed = event.address_changed();
            if changed {
                log::info!(
                    "address on {} changed: {:?} -> {:?}",
                    event.interface,
                    event.old_address,
                    event.new_address
                );
            }
            let fresh = event.old_address.is_none()
                || matches!(event.reason, DhcpReason::Bound | DhcpReason::Reboot);
            if !changed && !fresh {
                log::info!("ignoring {} on {}", event.raw_reason, event.interface);
                return Ok(None);
            }

            let lease = event.lease()?;
            log::info!("dhcp lease for {}: {}", event.interface, lease.render().replace('\n', " "));
            lease.write(&cfg.paths.dhcp_lease_file(&event.interface))?;
            if changed {
                Signal::SIGHUP
            } else {
                Signal::SIGUSR1
            }
        }
        DhcpReason::Expire | DhcpReason::Fail | DhcpReason::Timeout => Signal::SIGUSR2,
        DhcpReason::Other => {
            log::debug!("ignoring dhcp event {}", event.raw_reason);
            return Ok(None);
        }
    };

    let Some(pid) = runner_pid(cfg)? else {
        log::warn!("runner not running, {} not sent", signal);
        return Ok(None);
    };
    exec.signal(pid, signal)
        .with_context(|| format!("Failed to send {} to runner {}", signal, pid))?;
    log::debug!("sent {} to runner {}", signal, pid);
    Ok(Some(signal))
}

fn runner_pid(cfg: &Config) -> Result<Option<i32>> {
    let path = &cfg.paths.runner_pidfile;
    match fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid pid in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exec::mock::{MockExecutor, ProcBehavior};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;

    fn runner() -> Arc<MockExecutor> {
        let exec = MockExecutor::new();
        exec.spawn(4242, ProcBehavior::Normal);
        exec
    }

    fn dhcp_config(dir: &Path) -> Config {
        let mut cfg = test_config();
        cfg.network.public.address = AddressConfig::Dhcp;
        cfg.paths.runtime_dir = dir.join("run");
        cfg.paths.runner_pidfile = dir.join("runner.pid");
        fs::write(&cfg.paths.runner_pidfile, "4242\n").unwrap();
        cfg
    }

    fn event(vars: &[(&str, &str)]) -> DhcpEvent {
        let env: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DhcpEvent::from_lookup(|k| env.get(k).cloned()).unwrap()
    }

    const BOUND: &[(&str, &str)] = &[
        ("reason", "BOUND"),
        ("interface", "eth0"),
        ("new_ip_address", "198.51.100.7"),
        ("new_subnet_mask", "255.255.255.0"),
        ("new_routers", "198.51.100.1 198.51.100.2"),
        ("new_domain_name_servers", "192.0.2.53"),
    ];

    #[test]
    fn test_bound_writes_lease_and_sends_usr1() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dhcp_config(dir.path());
        let exec = runner();

        let sent = handle_event(&cfg, exec.as_ref(), &event(BOUND)).unwrap();
        assert_eq!(sent, Some(Signal::SIGUSR1));
        assert_eq!(exec.signals_to(4242), vec![Signal::SIGUSR1]);

        let lease = DhcpLease::read(&cfg.paths.dhcp_lease_file("eth0")).unwrap().unwrap();
        assert_eq!(lease.address, Ipv4Cidr::new(Ipv4Addr::new(198, 51, 100, 7), 24));
        assert_eq!(lease.routers.len(), 2);
        assert_eq!(lease.dns_servers, vec![Ipv4Addr::new(192, 0, 2, 53)]);
    }

    #[test]
    fn test_renew_with_new_address_sends_hup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dhcp_config(dir.path());
        let exec = runner();

        let mut vars = BOUND.to_vec();
        vars[0] = ("reason", "RENEW");
        vars.push(("old_ip_address", "198.51.100.6"));
        assert_eq!(handle_event(&cfg, exec.as_ref(), &event(&vars)).unwrap(), Some(Signal::SIGHUP));
    }

    #[test]
    fn test_renew_of_same_address_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dhcp_config(dir.path());
        let exec = runner();

        let mut vars = BOUND.to_vec();
        vars[0] = ("reason", "REBIND");
        vars.push(("old_ip_address", "198.51.100.7"));
        assert_eq!(handle_event(&cfg, exec.as_ref(), &event(&vars)).unwrap(), None);
        assert!(exec.signals_to(4242).is_empty());
        assert!(!cfg.paths.dhcp_lease_file("eth0").exists());
    }

    #[test]
    fn test_lost_lease_sends_usr2() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dhcp_config(dir.path());
        let exec = runner();

        for reason in ["EXPIRE", "FAIL", "TIMEOUT"] {
            let ev = event(&[("reason", reason), ("interface", "eth0")]);
            assert_eq!(handle_event(&cfg, exec.as_ref(), &ev).unwrap(), Some(Signal::SIGUSR2));
        }
        let ev = event(&[("reason", "PREINIT"), ("interface", "eth0")]);
        assert_eq!(handle_event(&cfg, exec.as_ref(), &ev).unwrap(), None);
        assert_eq!(exec.signals_to(4242).len(), 3);
    }

    #[test]
    fn test_server_identifier_stands_in_for_router() {
        let ev = event(&[
            ("reason", "BOUND"),
            ("interface", "eth0"),
            ("new_ip_address", "198.51.100.7"),
            ("new_subnet_mask", "255.255.255.128"),
            ("new_dhcp_server_identifier", "198.51.100.100"),
        ]);
        let lease = ev.lease().unwrap();
        assert_eq!(lease.address.prefix, 25);
        assert_eq!(lease.routers, vec![Ipv4Addr::new(198, 51, 100, 100)]);
    }

    #[test]
    fn test_static_interface_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dhcp_config(dir.path());
        let mut vars = BOUND.to_vec();
        vars[1] = ("interface", "eth1");
        assert!(handle_event(&cfg, MockExecutor::new().as_ref(), &event(&vars)).is_err());
    }

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)).unwrap(), 0);
        assert!(netmask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)).is_err());
    }
}
