// Periodic health monitors

//! Health monitors run from the runner's main loop.
//!
//! Every monitor is wrapped in a [`Scheduled`] that only calls
//! [`Monitor::update`] once its interval has elapsed since the previous
//! call. Missed cycles are not caught up. An update reports healthy
//! (`Some(true)`), unhealthy (`Some(false)`) or skipped (`None`), and
//! publishes its own health flag into the status store.

use crate::daemons::{Daemon, DaemonEnv};
use crate::error::RunnerError;
use crate::exec::{CommandSpec, Executor};
use crate::license;
use crate::network::ResolvedNetwork;
use crate::ppp::{NukeOptions, PppManager};
use crate::status::{GatewayStatus, ServerStatus};
use crate::store::StatusStore;
use crate::types::{Config, DaemonKind, DynDnsAddressSource};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Used by the router and server reachability checks
pub const PING: &str = "/bin/ping";

/// Shared handles every monitor works with
#[derive(Clone)]
pub struct MonitorContext {
    /// Gateway configuration
    pub cfg: Arc<Config>,
    /// Status document the results are written to
    pub store: StatusStore,
    /// Command runner
    pub exec: Arc<dyn Executor>,
    /// Network as resolved at start
    pub net: Arc<ResolvedNetwork>,
}

/// A periodic health check driven by the runner main loop
pub trait Monitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// One check cycle
    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>>;

    /// Called on every main loop iteration, whether or not the monitor ran
    fn watchdog(&self, _now: Instant) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Interval gate around a monitor
pub struct Scheduled {
    monitor: Box<dyn Monitor>,
    interval: Duration,
    last_fire: Option<Instant>,
}

impl Scheduled {
    /// Wrap `monitor`, due immediately and then every `interval`
    pub fn new(monitor: Box<dyn Monitor>, interval: Duration) -> Self {
        Self {
            monitor,
            interval,
            last_fire: None,
        }
    }

    /// Name of the wrapped monitor
    pub fn name(&self) -> &'static str {
        self.monitor.name()
    }

    /// The interval has passed since the last run
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_fire {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Run the monitor if due; `Ok(None)` when it was not
    pub async fn check(&mut self, now: Instant) -> Result<Option<bool>> {
        if !self.is_due(now) {
            log::debug!("skipping update for {}", self.name());
            return Ok(None);
        }
        log::debug!("running update for {}", self.name());
        self.last_fire = Some(now);
        self.monitor.update().await
    }

    /// Forward to [`Monitor::watchdog`]
    pub fn watchdog(&self, now: Instant) -> Result<(), RunnerError> {
        self.monitor.watchdog(now)
    }

    /// Time until the next update is due
    pub fn until_due(&self, now: Instant) -> Duration {
        match self.last_fire {
            Some(last) => (last + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// Write one of the aggregate health flags
pub(crate) fn set_flag(
    store: &StatusStore,
    flag: fn(&mut GatewayStatus) -> &mut Option<bool>,
    healthy: bool,
) -> Result<()> {
    store.transact(|status| {
        *flag(status) = Some(healthy);
        Ok(())
    })
}

/// ICMP probe; true when at least one reply arrived within five seconds
pub async fn ping_check(exec: &dyn Executor, addr: Ipv4Addr, device: Option<&str>) -> bool {
    let mut cmd = CommandSpec::new(PING).args(["-i", "1.0", "-c", "1", "-w", "5"]);
    if let Some(dev) = device {
        cmd = cmd.arg("-I").arg(dev);
    }
    match exec.run(cmd.arg(addr.to_string())).await {
        Ok(out) => out.success(),
        Err(e) => {
            log::warn!("ping failed to run: {:#}", e);
            false
        }
    }
}

/// Liveness of the daemons the runner started
pub struct ProcessMonitor {
    ctx: MonitorContext,
    daemons: Vec<Daemon>,
}

impl ProcessMonitor {
    /// Monitor for the given daemons
    pub fn new(ctx: MonitorContext, daemons: Vec<Daemon>) -> Self {
        Self { ctx, daemons }
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let mut failures = 0;
        for d in &self.daemons {
            if !d.check_process(self.ctx.exec.as_ref()).await {
                log::warn!("process is missing: {}", d.kind);
                failures += 1;
            }
        }
        let healthy = failures == 0;
        set_flag(&self.ctx.store, |s| &mut s.process_health_check, healthy)?;
        if healthy {
            log::debug!("process monitor: failures=0");
        } else {
            log::info!("process monitor: failures={}", failures);
        }
        Ok(Some(healthy))
    }
}

impl Monitor for ProcessMonitor {
    fn name(&self) -> &'static str {
        "ProcessMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }
}

/// DNS, WINS and RADIUS servers, probed with ping. Failures are reported
/// only.
pub struct PingableServerMonitor {
    ctx: MonitorContext,
    servers: Vec<Ipv4Addr>,
}

impl PingableServerMonitor {
    /// Collect the distinct server addresses and create their status records
    pub fn new(ctx: MonitorContext) -> Result<Self> {
        let mut servers: Vec<Ipv4Addr> = Vec::new();
        let candidates = ctx
            .net
            .dns_servers
            .iter()
            .chain(&ctx.cfg.ppp.dns_servers)
            .chain(&ctx.cfg.ppp.wins_servers)
            .chain(&ctx.cfg.radius.servers);
        for addr in candidates {
            if !servers.contains(addr) {
                servers.push(*addr);
            }
        }
        log::debug!("dns/wins/radius list: {:?}", servers);

        ctx.store.transact(|status| {
            status.server_statuses = servers
                .iter()
                .map(|a| ServerStatus {
                    address: *a,
                    healthy: None,
                })
                .collect();
            Ok(())
        })?;
        Ok(Self { ctx, servers })
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let mut results = Vec::with_capacity(self.servers.len());
        for addr in &self.servers {
            results.push((*addr, ping_check(self.ctx.exec.as_ref(), *addr, None).await));
        }
        let failed: Vec<String> = results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(a, _)| a.to_string())
            .collect();
        let healthy = failed.is_empty();

        self.ctx.store.transact(|status| {
            for (addr, ok) in &results {
                if let Some(st) = status.server_statuses.iter_mut().find(|s| s.address == *addr) {
                    st.healthy = Some(*ok);
                }
            }
            status.server_health_check = Some(healthy);
            Ok(())
        })?;

        if healthy {
            log::debug!("all dns/wins/radius servers passed ping check");
        } else {
            log::warn!("dns/wins/radius servers failed ping check: {}", failed.join(", "));
        }
        Ok(Some(healthy))
    }
}

impl Monitor for PingableServerMonitor {
    fn name(&self) -> &'static str {
        "PingableServerMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }
}

/// Device record reconciliation: retire records whose pppd is gone and
/// refresh traffic counters. Always healthy.
pub struct LicenseMonitor {
    ctx: MonitorContext,
    ppp: PppManager,
}

impl LicenseMonitor {
    /// License monitor using `ppp` for forced disconnects
    pub fn new(ctx: MonitorContext, ppp: PppManager) -> Self {
        Self { ctx, ppp }
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let status = self.ctx.store.snapshot()?;
        let stale = license::stale_devices(&status, self.ctx.exec.as_ref());
        if !stale.is_empty() {
            log::info!("retiring devices without pppd: {:?}", stale);
            if let Err(e) = self.ppp.nuke_ppp_devices(&stale, NukeOptions::no_kill()).await {
                log::warn!("failed to retire stale devices: {:#}", e);
            }
        }
        match license::refresh_counters(&self.ctx.store, &self.ctx.cfg.paths.sysfs_net, Utc::now()) {
            Ok(n) => log::debug!("counters refreshed for {} devices", n),
            Err(e) => log::warn!("counter refresh failed: {:#}", e),
        }
        Ok(Some(true))
    }
}

impl Monitor for LicenseMonitor {
    fn name(&self) -> &'static str {
        "LicenseMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }
}

/// Restart ez-ipupdate when the NATted address seen by the management
/// connection no longer matches the one it publishes
pub struct DynDnsAddressMonitor {
    ctx: MonitorContext,
    env: DaemonEnv,
}

impl DynDnsAddressMonitor {
    /// Dynamic DNS monitor for the updater configured in `env`
    pub fn new(ctx: MonitorContext, env: DaemonEnv) -> Self {
        Self { ctx, env }
    }

    /// Address currently written in the ez-ipupdate configuration
    fn configured_address(&self) -> Result<Option<Ipv4Addr>> {
        let path = &self.ctx.cfg.paths.ezipupdate_conf;
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let addr = contents
            .lines()
            .filter_map(|l| l.split_once('='))
            .find(|(k, _)| k.trim() == "address")
            .map(|(_, v)| v.trim().parse::<Ipv4Addr>())
            .transpose()
            .context("Invalid address in ez-ipupdate configuration")?;
        Ok(addr)
    }

    async fn run(&mut self) -> Result<Option<bool>> {
        let uses_mgmt_address = self
            .ctx
            .cfg
            .dyndns
            .as_ref()
            .is_some_and(|d| d.address == DynDnsAddressSource::ManagementConnection);
        if !uses_mgmt_address {
            log::debug!("dyndns does not follow the management connection address, no action");
            return Ok(Some(true));
        }

        let Some(prev) = self.configured_address()? else {
            log::debug!("no dyndns configured address, no action");
            return Ok(Some(true));
        };
        let Some(current) = self.ctx.store.snapshot()?.management_natted_address else {
            log::debug!("no natted address known, no action");
            return Ok(Some(true));
        };
        if prev == current {
            log::debug!("dyndns address unchanged: {}", current);
            return Ok(Some(true));
        }

        log::info!("dyndns address changed: {} -> {}, restarting ez-ipupdate", prev, current);
        let exec = self.ctx.exec.as_ref();
        let old = Daemon::new(DaemonKind::Ezipupdate, &self.ctx.cfg, &self.env);
        old.pre_stop(exec).await;
        old.soft_stop(exec, true).await;
        old.hard_stop(exec).await.context("ez-ipupdate stop failed")?;
        old.post_stop(exec).await;

        self.env.dyndns_address = Some(current);
        let fresh = Daemon::new(DaemonKind::Ezipupdate, &self.ctx.cfg, &self.env);
        fresh.write_config()?;
        fresh.pre_start(exec).await?;
        fresh.start(exec).await?;
        fresh.post_start(exec).await?;
        log::info!("dyndns: stop, reconfigure, start ok");
        Ok(Some(true))
    }
}

impl Monitor for DynDnsAddressMonitor {
    fn name(&self) -> &'static str {
        "DynDnsAddressMonitor"
    }

    fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
        Box::pin(self.run())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exec::mock::{MockExecutor, ProcBehavior};
    use crate::exec::CommandOutput;
    use crate::firewall::{ApplyMode, Firewall};
    use crate::network::{resolve, Leases};
    use crate::status::PppDevice;
    use crate::types::{DaemonOverride, DynDnsConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn context(cfg: Config, exec: Arc<MockExecutor>) -> MonitorContext {
        let net = resolve(&cfg, &Leases::new()).unwrap();
        MonitorContext {
            cfg: Arc::new(cfg),
            store: StatusStore::in_memory(),
            exec,
            net: Arc::new(net),
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Monitor for Counting {
        fn name(&self) -> &'static str {
            "Counting"
        }

        fn update(&mut self) -> BoxFuture<'_, Result<Option<bool>>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Some(true)) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduling_fires_on_elapsed_interval() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut sched = Scheduled::new(Box::new(Counting(fired.clone())), Duration::from_secs(60));
        let t0 = Instant::now();

        // First call always fires
        assert_eq!(sched.check(t0).await.unwrap(), Some(true));
        assert_eq!(sched.check(t0 + Duration::from_secs(30)).await.unwrap(), None);
        assert_eq!(sched.check(t0 + Duration::from_secs(59)).await.unwrap(), None);
        assert_eq!(sched.until_due(t0 + Duration::from_secs(59)), Duration::from_secs(1));
        assert_eq!(sched.check(t0 + Duration::from_secs(60)).await.unwrap(), Some(true));

        // Missed cycles are not caught up
        assert_eq!(sched.check(t0 + Duration::from_secs(300)).await.unwrap(), Some(true));
        assert_eq!(sched.check(t0 + Duration::from_secs(301)).await.unwrap(), None);
        assert_eq!(sched.check(t0 + Duration::from_secs(359)).await.unwrap(), None);
        assert_eq!(sched.check(t0 + Duration::from_secs(360)).await.unwrap(), Some(true));

        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_process_monitor_flags_missing_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pluto.pid");
        fs::write(&pidfile, "4242\n").unwrap();

        let mut cfg = test_config();
        cfg.daemons.insert(
            DaemonKind::Pluto,
            DaemonOverride {
                pidfile: Some(pidfile),
                ..Default::default()
            },
        );
        let exec = MockExecutor::new();
        exec.spawn(4242, ProcBehavior::Normal);
        let ctx = context(cfg, exec.clone());
        let daemons = vec![Daemon::new(DaemonKind::Pluto, &ctx.cfg, &DaemonEnv::default())];
        let mut mon = ProcessMonitor::new(ctx.clone(), daemons);

        assert_eq!(mon.run().await.unwrap(), Some(true));
        assert_eq!(ctx.store.snapshot().unwrap().process_health_check, Some(true));

        exec.signal(4242, nix::sys::signal::Signal::SIGKILL).unwrap();
        assert_eq!(mon.run().await.unwrap(), Some(false));
        assert_eq!(ctx.store.snapshot().unwrap().process_health_check, Some(false));
    }

    #[tokio::test]
    async fn test_server_monitor_dedups_and_records() {
        let exec = MockExecutor::new();
        exec.respond("/bin/ping -i 1.0 -c 1 -w 5 10.0.0.30", CommandOutput::failed(1, ""));
        let mut cfg = test_config();
        cfg.ppp.dns_servers.push(Ipv4Addr::new(203, 0, 113, 53));
        let ctx = context(cfg, exec.clone());
        let mut mon = PingableServerMonitor::new(ctx.clone()).unwrap();

        // 203.0.113.53, 192.168.100.254, 10.0.0.20, 10.0.0.30
        assert_eq!(mon.servers.len(), 4);
        assert_eq!(mon.run().await.unwrap(), Some(false));

        let status = ctx.store.snapshot().unwrap();
        assert_eq!(status.server_health_check, Some(false));
        let radius = status
            .server_statuses
            .iter()
            .find(|s| s.address == Ipv4Addr::new(10, 0, 0, 30))
            .unwrap();
        assert_eq!(radius.healthy, Some(false));
        assert_eq!(status.server_statuses[0].healthy, Some(true));
    }

    #[tokio::test]
    async fn test_license_monitor_retires_stale_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.paths.sysfs_net = dir.path().to_path_buf();
        cfg.paths.sainfo_dir = dir.path().join("sainfo");
        let exec = MockExecutor::new();
        exec.spawn(100, ProcBehavior::Normal);
        let ctx = context(cfg, exec.clone());
        ctx.store
            .transact(|s| {
                s.ppp_devices.push(PppDevice::new(1, 100, "l2tp1-1", Utc::now()));
                s.ppp_devices.push(PppDevice::new(2, 200, "l2tp2-2", Utc::now()));
                Ok(())
            })
            .unwrap();

        let firewall = Firewall::new(exec.clone(), dir.path().join("fw.lock"), ApplyMode::ValidateOnly);
        let ppp = PppManager::new(ctx.cfg.clone(), ctx.store.clone(), exec.clone(), firewall);
        let mut mon = LicenseMonitor::new(ctx.clone(), ppp);
        assert_eq!(mon.run().await.unwrap(), Some(true));

        let status = ctx.store.snapshot().unwrap();
        assert_eq!(status.ppp_devices.len(), 1);
        assert_eq!(status.ppp_devices[0].pppd_pid, 100);
        assert_eq!(status.retired_ppp_devices.len(), 1);
    }

    #[tokio::test]
    async fn test_dyndns_monitor_restarts_on_address_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.paths.ezipupdate_conf = dir.path().join("ez-ipupdate.conf");
        cfg.dyndns = Some(DynDnsConfig {
            service: "dyndns".to_string(),
            hostname: "vpn.example.com".to_string(),
            credentials: None,
            address: DynDnsAddressSource::ManagementConnection,
            static_address: None,
        });
        cfg.daemons.insert(
            DaemonKind::Ezipupdate,
            DaemonOverride {
                pidfile: Some(dir.path().join("ez.pid")),
                ..Default::default()
            },
        );
        let exec = MockExecutor::new();
        let ctx = context(cfg, exec.clone());
        let env = DaemonEnv {
            dyndns_address: Some(Ipv4Addr::new(198, 51, 100, 1)),
            ..Default::default()
        };
        Daemon::new(DaemonKind::Ezipupdate, &ctx.cfg, &env)
            .write_config()
            .unwrap();
        let mut mon = DynDnsAddressMonitor::new(ctx.clone(), env);

        // No NATted address known yet
        assert_eq!(mon.run().await.unwrap(), Some(true));
        assert!(exec.commands().is_empty());

        ctx.store
            .transact(|s| {
                s.management_natted_address = Some(Ipv4Addr::new(198, 51, 100, 1));
                Ok(())
            })
            .unwrap();
        assert_eq!(mon.run().await.unwrap(), Some(true));
        assert!(exec.commands().is_empty());

        ctx.store
            .transact(|s| {
                s.management_natted_address = Some(Ipv4Addr::new(198, 51, 100, 77));
                Ok(())
            })
            .unwrap();
        assert_eq!(mon.run().await.unwrap(), Some(true));
        let conf = fs::read_to_string(dir.path().join("ez-ipupdate.conf")).unwrap();
        assert!(conf.contains("address=198.51.100.77"));
        assert!(exec.commands().iter().any(|c| c.contains("--start")));
        assert_eq!(mon.configured_address().unwrap(), Some(Ipv4Addr::new(198, 51, 100, 77)));
    }
}
