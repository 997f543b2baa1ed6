// Router reachability monitor

//! ARP probes of every configured router.
//!
//! Routers are grouped by the interface that reaches them. For the public
//! and the private interface separately, the monitor remembers when any of
//! its routers last answered. A link that has been silent longer than the
//! restart limit is treated as dead and ends the runner incarnation, since
//! only reinitialising the interfaces can recover it.

use crate::error::RunnerError;
use crate::monitor::{Monitor, MonitorContext};
use crate::network::{arp_probe, Network};
use crate::status::RouterStatus;
use anyhow::Result;
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Public,
    Private,
}

#[derive(Debug, Clone)]
struct Router {
    address: Ipv4Addr,
    device: String,
    source: Ipv4Addr,
    side: Side,
}

/// Pings the routers and enforces the warning and restart limits
pub struct RouterMonitor {
    ctx: MonitorContext,
    network: Network,
    routers: Vec<Router>,
    restart_limit: Duration,
    warning_limit: Duration,
    last_success_public: Instant,
    last_success_private: Instant,
}

impl RouterMonitor {
    /// Enumerate the distinct routers and create their status records.
    /// Both sides count as successful at `now`.
    pub fn new(ctx: MonitorContext, now: Instant) -> Result<Self> {
        let mut routers = Vec::new();
        for (device, addrs) in ctx.net.routers() {
            let side = if device == ctx.net.public.device {
                Side::Public
            } else {
                Side::Private
            };
            let Some(iface) = ctx.net.interfaces().find(|i| i.device == device) else {
                log::error!("cannot check routers on unknown device {}", device);
                continue;
            };
            for address in addrs {
                // Same router on two devices: the first one wins
                if routers.iter().any(|r: &Router| r.address == address) {
                    continue;
                }
                routers.push(Router {
                    address,
                    device: device.clone(),
                    source: iface.address.addr,
                    side,
                });
            }
        }
        log::debug!("routers: {:?}", routers);

        ctx.store.transact(|status| {
            status.router_statuses = routers
                .iter()
                .map(|r| RouterStatus {
                    address: r.address,
                    device: r.device.clone(),
                    healthy: None,
                    last_success: None,
                })
                .collect();
            Ok(())
        })?;

        let m = &ctx.cfg.monitors;
        let restart_limit = Duration::from_secs(m.router_restart_limit);
        let warning_limit = Duration::from_secs(m.router_warning_limit);
        Ok(Self {
            network: Network::new(ctx.cfg.clone(), ctx.exec.clone()),
            ctx,
            routers,
            restart_limit,
            warning_limit,
            last_success_public: now,
            last_success_private: now,
        })
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let now = Instant::now();
        let mut results = Vec::with_capacity(self.routers.len());
        for r in &self.routers {
            let ok = arp_probe(self.ctx.exec.as_ref(), &r.device, r.source, r.address).await;
            results.push((r.address, r.side, ok));
        }

        // A side without routers counts as responding
        let silent = |side: Side| {
            let mut on_side = results.iter().filter(|(_, s, _)| *s == side).peekable();
            on_side.peek().is_some() && !on_side.any(|(_, _, ok)| *ok)
        };
        let no_public = silent(Side::Public);
        let no_private = silent(Side::Private);

        if no_public {
            log::warn!("no successful arpings for any routers on the public interface");
        } else {
            self.last_success_public = now;
        }
        if no_private {
            log::warn!("no successful arpings for any routers on the private interface");
        } else {
            self.last_success_private = now;
        }

        let failed: Vec<String> = results
            .iter()
            .filter(|(_, _, ok)| !ok)
            .map(|(a, _, _)| a.to_string())
            .collect();
        let healthy = failed.is_empty();
        let stamp = Utc::now();
        self.ctx.store.transact(|status| {
            for (addr, _, ok) in &results {
                if let Some(st) = status.router_statuses.iter_mut().find(|s| s.address == *addr) {
                    st.healthy = Some(*ok);
                    if *ok {
                        st.last_success = Some(stamp);
                    }
                }
            }
            status.router_health_check = Some(healthy);
            Ok(())
        })?;

        if no_public || no_private {
            for iface in self.ctx.net.interfaces() {
                self.network.promisc_flip(&iface.device).await;
            }
        }

        if healthy {
            log::debug!("all routers passed arping check");
        } else {
            log::warn!("routers failed arping check: {}", failed.join(", "));
        }
        Ok(Some(healthy))
    }

    fn check_side(&self, side: &str, last: Instant, now: Instant) -> Result<(), RunnerError> {
        let silent_for = now.saturating_duration_since(last);
        if silent_for > self.restart_limit {
            log::error!("arping failure for {} interface, {:?} without response", side, silent_for);
            return Err(RunnerError::RoutersNotResponding(format!(
                "no router on the {} interface answered for {} s",
                side,
                silent_for.as_secs()
            )));
        }
        if silent_for > self.warning_limit {
            log::warn!("arping warning for {} interface, {:?} without response", side, silent_for);
        }
        Ok(())
    }
}

impl Monitor for RouterMonitor {
    fn name(&self) -> &'static str {
        "RouterMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }

    fn watchdog(&self, now: Instant) -> Result<(), RunnerError> {
        self.check_side("public", self.last_success_public, now)?;
        self.check_side("private", self.last_success_private, now)
    }
}
