// Site-to-site tunnel monitor

//! Liveness of every configured site-to-site tunnel.
//!
//! A tunnel is healthy when its user has an active PPP device and the peer
//! answers a ping sent out of that device. Failed client-role tunnels are
//! torn down, their endpoint is resolved again and they are reinitiated
//! under a new incarnation identifier. Server-role failures are reported
//! only; the remote side has to reconnect.

use crate::daemons::rewrite_psks;
use crate::monitor::{ping_check, Monitor, MonitorContext};
use crate::s2s_client::{self, ClientConnection};
use crate::status::SiteToSiteStatus;
use crate::types::SiteToSiteRole;
use anyhow::Result;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
struct ClientSide {
    destination: String,
    psk: String,
    password: String,
}

#[derive(Debug, Clone)]
struct Tunnel {
    username: String,
    /// 1-based position among the site-to-site users
    index: usize,
    /// Reinitiations so far; 0 means never started
    incarnation: u64,
    client: Option<ClientSide>,
}

impl Tunnel {
    fn identifier(&self) -> String {
        s2s_client::identifier(self.index, self.incarnation)
    }
}

/// Keeps the client role site-to-site tunnels connected
pub struct SiteToSiteMonitor {
    ctx: MonitorContext,
    tunnels: Vec<Tunnel>,
    /// Username to the endpoint address its client tunnel currently uses
    resolved: BTreeMap<String, Ipv4Addr>,
}

impl SiteToSiteMonitor {
    /// Monitor for every client role site-to-site user
    pub fn new(ctx: MonitorContext) -> Result<Self> {
        let tunnels: Vec<Tunnel> = ctx
            .cfg
            .site_to_site_users()
            .enumerate()
            .filter_map(|(i, user)| {
                let s2s = user.site_to_site.as_ref()?;
                let client = match s2s.role {
                    SiteToSiteRole::Client => Some(ClientSide {
                        destination: s2s.destination.clone().unwrap_or_default(),
                        psk: s2s.psk.clone().unwrap_or_default(),
                        password: user.password.clone(),
                    }),
                    SiteToSiteRole::Server => None,
                };
                Some(Tunnel {
                    username: user.username.clone(),
                    index: i + 1,
                    incarnation: 0,
                    client,
                })
            })
            .collect();
        log::info!(
            "site-to-site usernames to monitor: {}",
            tunnels.iter().map(|t| t.username.as_str()).collect::<Vec<_>>().join(", ")
        );

        ctx.store.transact(|status| {
            status.site_to_site_statuses = tunnels
                .iter()
                .map(|t| SiteToSiteStatus {
                    username: t.username.clone(),
                    healthy: None,
                    address_check_failure: false,
                    license_restricted_failure: false,
                    remote_address: None,
                })
                .collect();
            Ok(())
        })?;

        Ok(Self {
            ctx,
            tunnels,
            resolved: BTreeMap::new(),
        })
    }

    /// Ping the peer of the user's device; false when there is no device
    async fn tunnel_alive(&self, username: &str) -> Result<bool> {
        let status = self.ctx.store.snapshot()?;
        let Some(dev) = status.active_by_username(username) else {
            log::debug!("{}: no device", username);
            return Ok(false);
        };
        let Some(name) = dev.device_name.as_deref() else {
            return Ok(false);
        };
        Ok(ping_check(self.ctx.exec.as_ref(), dev.remote_address, Some(name)).await)
    }

    fn record(&self, username: &str, healthy: bool) -> Result<()> {
        self.ctx.store.transact(|status| {
            if let Some(st) = status.site_to_site_status_mut(username) {
                st.healthy = Some(healthy);
                if healthy {
                    st.address_check_failure = false;
                }
            }
            Ok(())
        })
    }

    /// Resolve the endpoint of a client tunnel from scratch. Returns false
    /// when the tunnel cannot safely be reinitiated this cycle.
    async fn update_dns_mapping(&mut self, tunnel: &Tunnel) -> Result<bool> {
        let Some(client) = &tunnel.client else {
            return Ok(false);
        };
        self.set_remote_address(&tunnel.username, None)?;
        if let Some(old) = self.resolved.remove(&tunnel.username) {
            log::debug!("removing old mapping {} -> {}", tunnel.username, old);
        }

        let addrs = self.ctx.exec.resolve(&client.destination).await;
        let Some(addr) = addrs.first().copied() else {
            log::warn!("site-to-site endpoint {} cannot be resolved, skipping", client.destination);
            return Ok(false);
        };
        log::debug!("using endpoint {} for site-to-site destination {}", addr, client.destination);
        self.set_remote_address(&tunnel.username, Some(addr))?;

        if let Some((other, _)) = self.resolved.iter().find(|(_, a)| **a == addr) {
            log::error!(
                "site-to-site: {} -> {} conflicts with the endpoint of {}, skipping",
                client.destination,
                addr,
                other
            );
            return Ok(false);
        }
        if self.ctx.net.own_addresses().contains(&addr) {
            log::warn!(
                "site-to-site client {} resolves to our own address {}, skipping",
                tunnel.username,
                addr
            );
            return Ok(false);
        }

        self.resolved.insert(tunnel.username.clone(), addr);
        Ok(true)
    }

    fn set_remote_address(&self, username: &str, addr: Option<Ipv4Addr>) -> Result<()> {
        self.ctx.store.transact(|status| {
            if let Some(st) = status.site_to_site_status_mut(username) {
                st.remote_address = addr;
            }
            Ok(())
        })
    }

    /// Pluto secrets with one address specific key per resolved client tunnel
    async fn rewrite_pluto_psks(&self) -> Result<()> {
        let specific: Vec<(Ipv4Addr, String)> = self
            .tunnels
            .iter()
            .filter_map(|t| {
                let client = t.client.as_ref()?;
                let addr = self.resolved.get(&t.username)?;
                Some((*addr, client.psk.clone()))
            })
            .collect();
        log::debug!("extra psks for {:?}", specific.iter().map(|(a, _)| a).collect::<Vec<_>>());
        rewrite_psks(
            self.ctx.exec.as_ref(),
            &self.ctx.cfg.paths.ipsec_secrets,
            &specific,
            &self.ctx.cfg.ipsec.pre_shared_keys,
        )
        .await
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let mut success = Vec::new();
        let mut failure = Vec::new();
        let mut reinit = Vec::new();

        for (i, tunnel) in self.tunnels.iter().enumerate() {
            log::debug!("site-to-site aliveness check for {}", tunnel.username);
            let alive = self.tunnel_alive(&tunnel.username).await?;
            self.record(&tunnel.username, alive)?;
            if alive {
                success.push(tunnel.username.clone());
            } else {
                failure.push(tunnel.username.clone());
                if tunnel.client.is_some() {
                    reinit.push(i);
                }
            }
        }

        for &i in &reinit {
            let tunnel = &self.tunnels[i];
            if tunnel.incarnation > 0 {
                s2s_client::stop(self.ctx.exec.as_ref(), &tunnel.identifier()).await;
            } else {
                log::debug!("tunnel {} has no previous incarnation", tunnel.username);
            }
        }

        let mut ready = Vec::new();
        for i in reinit {
            let tunnel = self.tunnels[i].clone();
            if self.update_dns_mapping(&tunnel).await? {
                ready.push(i);
            } else {
                log::debug!("not reinitiating {}: unresolved or conflicting", tunnel.username);
            }
        }

        if !ready.is_empty() {
            self.rewrite_pluto_psks().await?;
        }

        let own_address = self.ctx.net.public.address.addr;
        for i in ready {
            self.tunnels[i].incarnation += 1;
            let tunnel = &self.tunnels[i];
            let (Some(client), Some(remote)) = (&tunnel.client, self.resolved.get(&tunnel.username)) else {
                continue;
            };
            let conn = ClientConnection {
                identifier: tunnel.identifier(),
                username: tunnel.username.clone(),
                password: client.password.clone(),
                own_address,
                remote_address: *remote,
            };
            log::info!("reinitiating site-to-site tunnel {} to {}", conn.identifier, remote);
            if let Err(e) = s2s_client::start(self.ctx.exec.as_ref(), &conn).await {
                log::warn!("site-to-site start {} failed: {:#}", conn.identifier, e);
            }
        }

        let healthy = failure.is_empty();
        self.ctx.store.transact(|status| {
            status.site_to_site_health_check = Some(healthy);
            Ok(())
        })?;
        if healthy {
            log::debug!("all site-to-site connections pass checks");
        } else {
            log::warn!(
                "site-to-site failures; success={}, failure={}",
                success.join(", "),
                failure.join(", ")
            );
        }
        Ok(Some(healthy))
    }
}

impl Monitor for SiteToSiteMonitor {
    fn name(&self) -> &'static str {
        "SiteToSiteTunnelMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exec::mock::MockExecutor;
    use crate::exec::CommandOutput;
    use crate::monitor::tests::context;
    use crate::status::{ConnectionType, PppDevice};
    use crate::types::{SiteToSiteConfig, UserConfig};
    use chrono::Utc;
    use std::fs;

    fn monitor(exec: std::sync::Arc<MockExecutor>) -> (SiteToSiteMonitor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.paths.ipsec_secrets = dir.path().join("ipsec.secrets");
        let ctx = context(cfg, exec);
        (SiteToSiteMonitor::new(ctx).unwrap(), dir)
    }

    fn whack_adds(exec: &MockExecutor) -> Vec<String> {
        exec.commands()
            .into_iter()
            .filter(|c| c.starts_with("/usr/sbin/ipsec whack --name"))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_client_tunnel_is_initiated() {
        let exec = MockExecutor::new();
        exec.set_dns("branch.example.com", &[Ipv4Addr::new(198, 51, 100, 20)]);
        let (mut mon, dir) = monitor(exec.clone());

        assert_eq!(mon.run().await.unwrap(), Some(false));

        // Never started before, so nothing is torn down
        assert!(!exec.commands().iter().any(|c| c.contains("--delete")));
        let adds = whack_adds(&exec);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].contains("s2s-1-1"));
        assert!(adds[0].contains("--to --host 198.51.100.20"));

        let secrets = fs::read_to_string(dir.path().join("ipsec.secrets")).unwrap();
        assert!(secrets.starts_with("198.51.100.20 : PSK 0x"));

        let status = mon.ctx.store.snapshot().unwrap();
        let branch = &status.site_to_site_statuses[0];
        assert_eq!(branch.healthy, Some(false));
        assert_eq!(branch.remote_address, Some(Ipv4Addr::new(198, 51, 100, 20)));
        assert_eq!(status.site_to_site_health_check, Some(false));

        // Second failure stops incarnation 1 and starts incarnation 2
        exec.clear_calls();
        mon.run().await.unwrap();
        assert!(exec
            .commands()
            .contains(&"/usr/sbin/ipsec whack --delete --name s2s-1-1".to_string()));
        assert!(whack_adds(&exec)[0].contains("s2s-1-2"));
    }

    #[tokio::test]
    async fn test_server_tunnel_is_not_reinitiated() {
        let exec = MockExecutor::new();
        let (mut mon, _dir) = monitor(exec.clone());
        // branch resolves nowhere, hq is server role
        assert_eq!(mon.run().await.unwrap(), Some(false));
        assert!(whack_adds(&exec).is_empty());
        assert_eq!(mon.tunnels[1].incarnation, 0);
    }

    #[tokio::test]
    async fn test_live_tunnel_is_pinged_through_its_device() {
        let exec = MockExecutor::new();
        let (mut mon, _dir) = monitor(exec.clone());
        mon.ctx
            .store
            .transact(|s| {
                for (id, user, remote) in [(1, "branch", 20), (2, "hq", 21)] {
                    let mut dev = PppDevice::new(id, 100 + id as i32, &format!("l2tp{}-{}", id, id), Utc::now());
                    dev.username = Some(user.to_string());
                    dev.connection_type = ConnectionType::SiteToSiteClient;
                    dev.remote_address = Ipv4Addr::new(192, 168, 100, remote);
                    s.ppp_devices.push(dev);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(mon.run().await.unwrap(), Some(true));
        assert!(exec
            .commands()
            .contains(&"/bin/ping -i 1.0 -c 1 -w 5 -I l2tp1-1 192.168.100.20".to_string()));

        exec.respond("/bin/ping -i 1.0 -c 1 -w 5 -I l2tp2-2", CommandOutput::failed(1, ""));
        assert_eq!(mon.run().await.unwrap(), Some(false));
        let status = mon.ctx.store.snapshot().unwrap();
        assert_eq!(status.site_to_site_statuses[0].healthy, Some(true));
        assert_eq!(status.site_to_site_statuses[1].healthy, Some(false));
    }

    #[tokio::test]
    async fn test_resolution_to_own_address_is_rejected() {
        let exec = MockExecutor::new();
        exec.set_dns("branch.example.com", &[Ipv4Addr::new(203, 0, 113, 10)]);
        let (mut mon, _dir) = monitor(exec.clone());

        mon.run().await.unwrap();
        assert!(whack_adds(&exec).is_empty());
        assert!(mon.resolved.is_empty());
    }

    #[tokio::test]
    async fn test_colliding_resolution_is_rejected() {
        let exec = MockExecutor::new();
        let shared = Ipv4Addr::new(198, 51, 100, 20);
        exec.set_dns("branch.example.com", &[shared]);
        exec.set_dns("branch2.example.com", &[shared]);

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.paths.ipsec_secrets = dir.path().join("ipsec.secrets");
        cfg.users.push(UserConfig {
            username: "branch2".to_string(),
            password: String::new(),
            fixed_ip: None,
            force_web_redirect: false,
            force_non_primary_psk_web_redirect: false,
            site_to_site: Some(SiteToSiteConfig {
                role: SiteToSiteRole::Client,
                destination: Some("branch2.example.com".to_string()),
                psk: Some("other".to_string()),
            }),
        });
        let mut mon = SiteToSiteMonitor::new(context(cfg, exec.clone())).unwrap();

        mon.run().await.unwrap();
        let adds = whack_adds(&exec);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].contains("s2s-1-1"));
        assert_eq!(mon.resolved.len(), 1);
        assert_eq!(mon.tunnels[2].incarnation, 0);
    }
}
