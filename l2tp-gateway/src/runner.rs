// Gateway runner

//! One incarnation of the gateway: stop whatever a previous incarnation
//! left behind, bring up network and daemons, then run the monitors until
//! a signal or a fatal monitor condition ends it.
//!
//! Every state transition is announced on stdout as a `*** STATE:` line
//! for the supervisor, mirrored into the state file and recorded in the
//! status store. OS signals never do work themselves: a small task per
//! signal forwards it into a channel that the main loop drains between
//! steps.

use crate::config::AddressConfig;
use crate::daemons::{Daemon, DaemonEnv, DaemonRegistry};
use crate::error::RunnerError;
use crate::exec::Executor;
use crate::firewall::{ApplyMode, Firewall};
use crate::monitor::{
    DynDnsAddressMonitor, LicenseMonitor, MonitorContext, PingableServerMonitor, ProcessMonitor,
    Scheduled,
};
use crate::network::{self, Leases, Network, ResolvedNetwork};
use crate::ppp::PppManager;
use crate::router_monitor::RouterMonitor;
use crate::s2s_monitor::SiteToSiteMonitor;
use crate::state_file;
use crate::status::{state_line, RunnerState, StartingSubstate};
use crate::store::StatusStore;
use crate::types::{Config, DaemonKind, DynDnsAddressSource, RunMode};
use anyhow::{Context, Result};
use chrono::Utc;
use std::convert::Infallible;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Size of the channel buffer between the signal tasks and the main loop
const SIGNAL_CHANNEL_SIZE: usize = 16;

/// Signals the runner reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerSignal {
    /// Stop requested
    Term,
    /// DHCP lease changed
    Hup,
    /// DHCP lease acquired, or a plain wake-up
    Usr1,
    /// DHCP failed or the lease expired
    Usr2,
    /// Deferred maintenance is pending
    Alrm,
}

/// Forward SIGTERM, SIGHUP, SIGUSR1, SIGUSR2 and SIGALRM into a channel.
/// Must be called from within the runtime.
pub fn install_signal_handlers() -> Result<mpsc::Receiver<RunnerSignal>> {
    let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
    let kinds = [
        (SignalKind::terminate(), RunnerSignal::Term),
        (SignalKind::hangup(), RunnerSignal::Hup),
        (SignalKind::user_defined1(), RunnerSignal::Usr1),
        (SignalKind::user_defined2(), RunnerSignal::Usr2),
        (SignalKind::alarm(), RunnerSignal::Alrm),
    ];
    for (kind, sig) in kinds {
        let mut stream =
            signal(kind).with_context(|| format!("Failed to set up {:?} handler", sig))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

/// Signals received but not yet acted on
#[derive(Debug, Default)]
struct PendingSignals {
    term: bool,
    hup: bool,
    usr1: bool,
    usr2: bool,
    alrm: bool,
}

impl PendingSignals {
    fn raise(&mut self, sig: RunnerSignal) {
        log::debug!("got signal {:?}", sig);
        match sig {
            RunnerSignal::Term => self.term = true,
            RunnerSignal::Hup => self.hup = true,
            RunnerSignal::Usr1 => self.usr1 = true,
            RunnerSignal::Usr2 => self.usr2 = true,
            RunnerSignal::Alrm => self.alrm = true,
        }
    }
}

/// Command line choices of `run`
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Which daemons are managed
    pub mode: RunMode,
    /// Restart the distribution's networking after the final stop
    pub distro_restart: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            distro_restart: true,
        }
    }
}

type PostStopHook = Box<dyn Fn() + Send + Sync>;

/// One gateway incarnation, from network start to final stop
pub struct Runner {
    cfg: Arc<Config>,
    store: StatusStore,
    exec: Arc<dyn Executor>,
    opts: RunnerOptions,
    network: Network,
    firewall: Firewall,
    ppp: PppManager,
    daemons: DaemonRegistry,
    env: DaemonEnv,
    signals: mpsc::Receiver<RunnerSignal>,
    signals_closed: bool,
    pending: PendingSignals,
    monitors: Vec<Scheduled>,
    post_stop: Vec<PostStopHook>,
}

impl Runner {
    /// Runner bound to its store, executor and signal stream
    pub fn new(
        cfg: Config,
        store: StatusStore,
        exec: Arc<dyn Executor>,
        opts: RunnerOptions,
        signals: mpsc::Receiver<RunnerSignal>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let firewall = Firewall::new(exec.clone(), cfg.paths.firewall_lock.clone(), ApplyMode::Apply);
        let env = DaemonEnv {
            public_address: None,
            dhcp_devices: cfg
                .interfaces()
                .filter(|i| i.address == AddressConfig::Dhcp)
                .map(|i| i.device.clone())
                .collect(),
            dyndns_address: None,
        };
        Self {
            network: Network::new(cfg.clone(), exec.clone()),
            ppp: PppManager::new(cfg.clone(), store.clone(), exec.clone(), firewall.clone()),
            daemons: DaemonRegistry::new(opts.mode),
            firewall,
            env,
            cfg,
            store,
            exec,
            opts,
            signals,
            signals_closed: false,
            pending: PendingSignals::default(),
            monitors: Vec::new(),
            post_stop: Vec::new(),
        }
    }

    /// Register a callback run at the very end of every stop
    pub fn on_post_stop(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.post_stop.push(Box::new(hook));
    }

    /// Run one incarnation to its end and return the process exit code
    pub async fn run(&mut self) -> i32 {
        if let Err(e) = self.write_pidfile() {
            log::warn!("{:#}", e);
        }

        let reason = self.run_raw().await;
        let mut code = reason.exit_code();
        match &reason {
            RunnerError::GotSigTerm => log::info!("got SIGTERM, stopping"),
            RunnerError::DhcpChanged | RunnerError::DhcpExpired => {
                log::warn!("{}, restarting", reason)
            }
            RunnerError::Runtime(_) | RunnerError::Recheck => {
                log::error!("unknown error: {}", reason)
            }
            _ => log::error!("{}", reason),
        }

        self.announce(RunnerState::Stopping, None);
        if let Err(e) = self
            .stop(reason.silent_stop(), false, self.opts.distro_restart)
            .await
        {
            log::error!("final stop failed: {}", e);
            code = e.exit_code();
        }
        self.announce(RunnerState::Stopped, None);
        let stamp = Utc::now();
        if let Err(e) = self.store.transact(|status| {
            status.stop_time = Some(stamp);
            Ok(())
        }) {
            log::warn!("cannot record stop time: {:#}", e);
        }

        let _ = fs::remove_file(&self.cfg.paths.runner_pidfile);
        log::info!("runner exiting with code {}", code);
        code
    }

    /// Everything up to the condition that ends the incarnation
    async fn run_raw(&mut self) -> RunnerError {
        match self.run_until_error().await {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    async fn run_until_error(&mut self) -> Result<Infallible, RunnerError> {
        self.announce(RunnerState::Starting, Some(StartingSubstate::Preparing));
        self.clear_runtime_state()
            .map_err(|e| RunnerError::Runtime(format!("{:#}", e)))?;

        // Whatever a previous incarnation left behind
        self.stop(true, true, false).await?;

        self.start().await.map_err(RunnerError::start_failed)?;

        self.drain_sigusr1().await;
        self.announce(RunnerState::Running, None);

        loop {
            match self.main_loop_iteration().await {
                Ok(()) | Err(RunnerError::Recheck) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_runtime_state(&mut self) -> Result<()> {
        let now = Utc::now();
        self.store.transact(|status| {
            status.clear_runtime();
            status.start_time = Some(now);
            Ok(())
        })?;
        self.monitors.clear();
        self.pending = PendingSignals::default();
        Ok(())
    }

    fn write_pidfile(&self) -> Result<()> {
        let path = &self.cfg.paths.runner_pidfile;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create pidfile directory")?;
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Protocol line on stdout, state file, status store
    fn announce(&mut self, state: RunnerState, substate: Option<StartingSubstate>) {
        // stdout may be gone if the supervisor died; that must not kill us
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", state_line(state, substate));
        // The supervisor reads a pipe, not a tty, and acts on each state
        // line as it arrives. Never leave one sitting in a buffer.
        let _ = out.flush();
        drop(out);

        if let Err(e) = state_file::write_state(&self.cfg.paths.state_file, state, substate) {
            log::warn!("Failed to write state file: {:#}", e);
        }
        let now = Utc::now();
        if let Err(e) = self.store.transact(|status| {
            status.state = Some(state);
            status.substate = substate;
            status.last_state_update = Some(now);
            Ok(())
        }) {
            log::warn!("cannot record state: {:#}", e);
        }
    }

    async fn start(&mut self) -> Result<()> {
        let exec = self.exec.clone();

        self.network.create_sainfo_dir()?;
        self.network.set_forwarding(false).await?;
        self.network.prepare().await?;

        self.announce(RunnerState::Starting, Some(StartingSubstate::WaitingForDhcp));
        let leases = self.acquire_dhcp().await?;

        self.announce(RunnerState::Starting, Some(StartingSubstate::StartingNetwork));
        let net = network::resolve(&self.cfg, &leases)?;
        // Published before the interfaces are configured
        self.store.transact(|status| {
            net.publish(status);
            Ok(())
        })?;
        self.env.public_address = Some(net.public.address.addr);
        self.env.dyndns_address = self.dyndns_address()?;
        self.network.bring_up(&net, &self.firewall).await?;

        self.announce(RunnerState::Starting, Some(StartingSubstate::StartingDaemons));
        self.daemons
            .start_all(exec.as_ref(), &self.cfg, &self.env)
            .await?;
        if self.opts.mode == RunMode::Full {
            self.network.set_forwarding(true).await?;
        }

        self.post_start(Arc::new(net))?;
        Ok(())
    }

    fn dyndns_address(&self) -> Result<Option<Ipv4Addr>> {
        let Some(dyndns) = &self.cfg.dyndns else {
            return Ok(None);
        };
        Ok(match dyndns.address {
            DynDnsAddressSource::Interface => None,
            DynDnsAddressSource::Static => dyndns.static_address,
            DynDnsAddressSource::ManagementConnection => {
                self.store.snapshot()?.management_natted_address
            }
        })
    }

    /// Build the monitors of this incarnation
    fn post_start(&mut self, net: Arc<ResolvedNetwork>) -> Result<()> {
        let ctx = MonitorContext {
            cfg: self.cfg.clone(),
            store: self.store.clone(),
            exec: self.exec.clone(),
            net,
        };
        let m = &self.cfg.monitors;
        let secs = Duration::from_secs;

        let mut monitors = vec![
            Scheduled::new(
                Box::new(ProcessMonitor::new(
                    ctx.clone(),
                    self.daemons.monitored(&self.cfg, &self.env),
                )),
                secs(m.process_interval),
            ),
            Scheduled::new(
                Box::new(RouterMonitor::new(ctx.clone(), Instant::now())?),
                secs(m.router_interval),
            ),
            Scheduled::new(
                Box::new(PingableServerMonitor::new(ctx.clone())?),
                secs(m.server_interval),
            ),
        ];
        if self.opts.mode == RunMode::Full {
            monitors.push(Scheduled::new(
                Box::new(SiteToSiteMonitor::new(ctx.clone())?),
                secs(m.site_to_site_interval),
            ));
            monitors.push(Scheduled::new(
                Box::new(DynDnsAddressMonitor::new(ctx.clone(), self.env.clone())),
                secs(m.dyndns_interval),
            ));
        }
        monitors.push(Scheduled::new(
            Box::new(LicenseMonitor::new(ctx, self.ppp.clone())),
            secs(m.license_interval),
        ));

        log::debug!(
            "monitors: {}",
            monitors.iter().map(Scheduled::name).collect::<Vec<_>>().join(", ")
        );
        self.monitors = monitors;
        Ok(())
    }

    /// Restart the DHCP client until every DHCP interface has a lease
    async fn acquire_dhcp(&mut self) -> Result<Leases, RunnerError> {
        if self.env.dhcp_devices.is_empty() {
            return Ok(Leases::new());
        }
        let t = &self.cfg.timeouts;
        let tries = t.dhcp_try_count;
        let acquire_timeout = Duration::from_secs(t.dhcp_acquire_timeout);
        let poll = Duration::from_secs(t.dhcp_poll_interval);

        for attempt in 1..=tries {
            log::info!("dhcp attempt {}/{} on {}", attempt, tries, self.env.dhcp_devices.join(", "));
            self.restart_dhclient().await?;

            let deadline = Instant::now() + acquire_timeout;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    log::warn!("no dhcp lease within {:?}", acquire_timeout);
                    break;
                }
                match self.next_signal(left.min(poll)).await {
                    Some(RunnerSignal::Term) => return Err(RunnerError::GotSigTerm),
                    Some(RunnerSignal::Hup) => return Err(RunnerError::DhcpChanged),
                    Some(RunnerSignal::Usr2) => {
                        log::warn!("dhcp client reported failure");
                        break;
                    }
                    Some(RunnerSignal::Usr1) => {
                        match network::read_leases(&self.cfg) {
                            Ok(Some(leases)) => {
                                log::info!("dhcp leases acquired");
                                return Ok(leases);
                            }
                            Ok(None) => log::debug!("dhcp leases incomplete"),
                            Err(e) => log::warn!("cannot read dhcp leases: {:#}", e),
                        }
                    }
                    Some(RunnerSignal::Alrm) => log::debug!("ignoring SIGALRM while waiting for dhcp"),
                    None => log::debug!("still waiting for dhcp"),
                }
            }
        }

        Err(RunnerError::DhcpNoResponse(format!(
            "no lease after {} attempts",
            tries
        )))
    }

    async fn restart_dhclient(&mut self) -> Result<(), RunnerError> {
        let exec = self.exec.as_ref();
        let dhclient = Daemon::new(DaemonKind::Dhclient, &self.cfg, &self.env);
        dhclient.soft_stop(exec, true).await;
        dhclient.hard_stop(exec).await.map_err(|e| {
            RunnerError::RebootRequired(format!("dhcp client hard stop failed: {:#}", e))
        })?;
        let started = async {
            dhclient.write_config()?;
            dhclient.pre_start(exec).await?;
            dhclient.start(exec).await?;
            dhclient.post_start(exec).await
        };
        started
            .await
            .map_err(|e| RunnerError::StartFailed(format!("dhcp client: {:#}", e)))
    }

    /// Wait up to `wait` for the next signal
    async fn next_signal(&mut self, wait: Duration) -> Option<RunnerSignal> {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                sig = self.signals.recv(), if !self.signals_closed => match sig {
                    Some(sig) => return Some(sig),
                    None => self.signals_closed = true,
                },
            }
        }
    }

    fn drain_signals(&mut self) {
        while let Ok(sig) = self.signals.try_recv() {
            self.pending.raise(sig);
        }
    }

    /// A lease acquired during startup sends SIGUSR1 that means nothing
    /// once running
    async fn drain_sigusr1(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.timeouts.sigusr1_drain);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.next_signal(left).await {
                Some(RunnerSignal::Usr1) => log::debug!("discarding startup SIGUSR1"),
                Some(sig) => self.pending.raise(sig),
                None => break,
            }
        }
        self.drain_signals();
        self.pending.usr1 = false;
    }

    async fn check_signals(&mut self) -> Result<(), RunnerError> {
        self.drain_signals();
        let p = &mut self.pending;
        if std::mem::take(&mut p.term) {
            return Err(RunnerError::GotSigTerm);
        }
        if std::mem::take(&mut p.hup) {
            return Err(RunnerError::DhcpChanged);
        }
        if std::mem::take(&mut p.usr2) {
            return Err(RunnerError::DhcpExpired);
        }
        if std::mem::take(&mut p.usr1) {
            log::debug!("SIGUSR1 while running, rechecking");
            return Err(RunnerError::Recheck);
        }
        if std::mem::take(&mut p.alrm) {
            self.process_pending_tasks().await;
            return Err(RunnerError::Recheck);
        }
        Ok(())
    }

    async fn main_loop_iteration(&mut self) -> Result<(), RunnerError> {
        self.check_signals().await?;
        self.main_loop_callback().await?;
        self.check_signals().await?;

        let now = Instant::now();
        let poll = Duration::from_secs(self.cfg.timeouts.mainloop_poll_interval);
        let wait = self
            .monitors
            .iter()
            .map(|m| m.until_due(now))
            .fold(poll, Duration::min);
        if let Some(sig) = self.next_signal(wait).await {
            self.pending.raise(sig);
        }
        Ok(())
    }

    async fn main_loop_callback(&mut self) -> Result<(), RunnerError> {
        self.process_pending_tasks().await;

        let now = Instant::now();
        for m in &mut self.monitors {
            match m.check(now).await {
                Ok(Some(false)) => log::debug!("{}: unhealthy", m.name()),
                Ok(_) => {}
                Err(e) => log::warn!("{} failed: {:#}", m.name(), e),
            }
        }
        for m in &self.monitors {
            m.watchdog(now)?;
        }

        let stamp = Utc::now();
        self.store
            .transact(|status| {
                status.last_poll_time = Some(stamp);
                Ok(())
            })
            .map_err(|e| RunnerError::Runtime(format!("{:#}", e)))?;
        Ok(())
    }

    /// Deferred maintenance requested through marker files
    async fn process_pending_tasks(&mut self) {
        let marker = &self.cfg.paths.radius_restart_marker;
        if !marker.exists() {
            return;
        }
        log::info!("radius restart requested");
        if let Err(e) = fs::remove_file(marker) {
            log::warn!("cannot remove {}: {}", marker.display(), e);
        }
        if self.opts.mode != RunMode::Full {
            log::debug!("network only mode, no radius restart");
            return;
        }
        if let Err(e) = self
            .daemons
            .restart(DaemonKind::Freeradius, self.exec.as_ref(), &self.cfg, &self.env)
            .await
        {
            log::error!("radius restart failed: {:#}", e);
        }
    }

    /// Best-effort teardown. Only a daemon that cannot be killed aborts
    /// the sequence.
    async fn stop(
        &mut self,
        silent: bool,
        all_daemons: bool,
        distro_restart: bool,
    ) -> Result<(), RunnerError> {
        log::info!("stopping (silent={}, all_daemons={})", silent, all_daemons);
        self.monitors.clear();
        let exec = self.exec.clone();

        self.network.down_proxy_arp(silent).await;
        if let Err(e) = self.network.set_forwarding(false).await {
            log::warn!("disabling forwarding failed: {:#}", e);
        }
        self.network.down_qos(silent).await;
        if let Err(e) = self.firewall.down().await {
            if !silent {
                log::warn!("firewall down failed: {:#}", e);
            }
        }
        self.network.down_routes(silent).await;
        self.network.down_interfaces(silent).await;
        self.network.flush_route_cache(silent).await;

        self.daemons
            .stop_all(exec.as_ref(), &self.cfg, &self.env, all_daemons, silent)
            .await?;

        self.network.flush_conntrack(silent).await;
        if let Err(e) = self.network.set_forwarding(true).await {
            log::warn!("enabling forwarding failed: {:#}", e);
        }
        self.network.remove_sainfo_dir();

        match self.ppp.nuke_all_ppp_devices(silent, true).await {
            Ok(true) => {}
            Ok(false) => log::warn!("some ppp devices survived the stop"),
            Err(e) => log::warn!("retiring ppp devices failed: {:#}", e),
        }

        if distro_restart {
            self.network.restart_distro_networking(silent).await;
        }
        for hook in &self.post_stop {
            hook();
        }
        Ok(())
    }
}
