// External daemon lifecycle

//! Start/stop adapters for the external programs the gateway runs. Every
//! daemon goes through `start-stop-daemon`; a few need extra steps around
//! it (IKE whack, L2TP config restore, SA flush). [`DaemonRegistry`] owns
//! the fixed start and stop orders and remembers what was started.

use crate::error::RunnerError;
use crate::exec::{run_checked, run_logged, CommandSpec, Executor};
use crate::ipsec::{OPENL2TPCONFIG, SETKEY};
use crate::types::{
    Config, ConfigFile, DaemonKind, DynDnsAddressSource, RunMode, L2TP_PEER_PORT,
};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Debian daemon launcher used for every start and stop
pub const START_STOP_DAEMON: &str = "/sbin/start-stop-daemon";
/// Openswan control program (`ipsec whack`, `ipsec tncfg`)
pub const IPSEC: &str = "/usr/sbin/ipsec";
/// Updown script handed to pluto, routing is ours
pub const TRUE: &str = "/bin/true";
const PIDOF: &str = "/bin/pidof";
const MODPROBE: &str = "/sbin/modprobe";
const KILLALL: &str = "/usr/bin/killall";
const IPPOOLCONFIG: &str = "/usr/bin/ippoolconfig";

/// IKE proposal for every connection, server and client side
pub const IKE_PROPOSAL: &str = "--ike=aes-128-sha1-160-modp1536";
const SERVER_CONNECTION: &str = "l2tptunnel";
const DHCLIENT_SCRIPT: &str = "/usr/lib/l2tpgw/dhclient-script";

/// Daemons started in full mode, in dependency order
pub const START_ORDER: [DaemonKind; 9] = [
    DaemonKind::Portmap,
    DaemonKind::Freeradius,
    DaemonKind::Pluto,
    DaemonKind::Pppd,
    DaemonKind::Openl2tp,
    DaemonKind::Ippool,
    DaemonKind::Ezipupdate,
    DaemonKind::Snmpd,
    DaemonKind::Dhcp,
];

/// Stop order used when everything must go, whatever was started.
/// pppd comes after openl2tp so no new pppd gets spawned behind our back;
/// its pre-stop already gives clients a chance to disconnect cleanly.
pub const STOP_ORDER_ALL: [DaemonKind; 9] = [
    DaemonKind::Dhcp,
    DaemonKind::Ezipupdate,
    DaemonKind::Ippool,
    DaemonKind::Openl2tp,
    DaemonKind::Pppd,
    DaemonKind::Pluto,
    DaemonKind::Freeradius,
    DaemonKind::Snmpd,
    DaemonKind::Portmap,
];

/// Resolved network facts that daemon configuration depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonEnv {
    /// Address of the public interface, once known
    pub public_address: Option<Ipv4Addr>,
    /// Interfaces handed to the DHCP client
    pub dhcp_devices: Vec<String>,
    /// Address the dynamic DNS updater should publish
    pub dyndns_address: Option<Ipv4Addr>,
}

/// One external program and how to start, stop and probe it
#[derive(Debug, Clone)]
pub struct Daemon {
    /// Which daemon this is
    pub kind: DaemonKind,
    /// Executable path
    pub command: String,
    /// Arguments passed after `--`
    pub args: Vec<String>,
    /// Pidfile that identifies the running process, if any
    pub pidfile: Option<PathBuf>,
    /// Launched per connection by another daemon, never by us
    spawned: bool,
    /// Not configured: start is skipped, stop is silent, health is assumed
    enabled: bool,
    configs: Vec<ConfigFile>,
    cleanup_files: Vec<PathBuf>,
    stop_timeout: u64,
    ike: Option<IkeServer>,
}

#[derive(Debug, Clone)]
struct IkeServer {
    address: Ipv4Addr,
    ike_lifetime: u64,
    ipsec_lifetime: u64,
}

impl Daemon {
    /// Build the adapter for `kind` from built-in defaults, generated
    /// configuration and the `[daemons.<kind>]` overrides
    pub fn new(kind: DaemonKind, cfg: &Config, env: &DaemonEnv) -> Self {
        let address = env.public_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let debug = matches!(cfg.general.log_level.as_str(), "debug" | "trace");

        let mut daemon = Daemon {
            kind,
            command: String::new(),
            args: Vec::new(),
            pidfile: None,
            spawned: false,
            enabled: true,
            configs: Vec::new(),
            cleanup_files: Vec::new(),
            stop_timeout: cfg.timeouts.daemon_stop_timeout,
            ike: None,
        };

        match kind {
            DaemonKind::Portmap => {
                // Writes no pidfile, probed with pidof
                daemon.command = "/sbin/portmap".into();
                daemon.args = vec!["-i".into(), "127.0.0.1".into()];
            }
            DaemonKind::Freeradius => {
                daemon.command = "/usr/sbin/freeradius".into();
                daemon.args = vec!["-d".into(), "/etc/freeradius".into()];
                daemon.pidfile = Some("/var/run/freeradius/freeradius.pid".into());
            }
            DaemonKind::Pluto => {
                daemon.command = "/usr/lib/ipsec/pluto".into();
                daemon.args = vec![
                    "--secretsfile".into(),
                    cfg.paths.ipsec_secrets.display().to_string(),
                    "--nat_traversal".into(),
                    "--nhelpers".into(),
                    "0".into(),
                    (if debug { "--debug-control" } else { "--debug-none" }).into(),
                ];
                daemon.pidfile = Some("/var/run/pluto/pluto.pid".into());
                daemon.configs.push(ConfigFile {
                    path: cfg.paths.ipsec_secrets.clone(),
                    contents: psk_file(&[], &cfg.ipsec.pre_shared_keys),
                });
                daemon.ike = Some(IkeServer {
                    address,
                    ike_lifetime: cfg.ipsec.ike_lifetime,
                    ipsec_lifetime: cfg.ipsec.ipsec_lifetime,
                });
            }
            DaemonKind::Pppd => {
                daemon.command = "/usr/sbin/pppd".into();
                daemon.spawned = true;
            }
            DaemonKind::Openl2tp => {
                daemon.command = "/usr/sbin/openl2tpd".into();
                daemon.args = vec![
                    "-u".into(),
                    L2TP_PEER_PORT.to_string(),
                    "-a".into(),
                    address.to_string(),
                ];
                daemon.pidfile = Some("/var/run/openl2tpd.pid".into());
            }
            DaemonKind::Ippool => {
                daemon.command = "/usr/sbin/ippoold".into();
                if debug {
                    daemon.args = vec!["-d".into()];
                }
                daemon.pidfile = Some("/var/run/ippoold.pid".into());
            }
            DaemonKind::Ezipupdate => {
                daemon.command = "/usr/sbin/ez-ipupdate".into();
                daemon.pidfile = Some("/var/run/ezipupdate.pid".into());
                daemon.args = vec![
                    "-c".into(),
                    cfg.paths.ezipupdate_conf.display().to_string(),
                    "-d".into(),
                    "-F".into(),
                    "/var/run/ezipupdate.pid".into(),
                ];
                match &cfg.dyndns {
                    Some(_) => daemon.configs.push(ConfigFile {
                        path: cfg.paths.ezipupdate_conf.clone(),
                        contents: ezipupdate_config(cfg, env),
                    }),
                    None => daemon.enabled = false,
                }
            }
            DaemonKind::Snmpd => {
                daemon.command = "/usr/sbin/snmpd".into();
                daemon.args = vec![
                    "-Lsd".into(),
                    "-p".into(),
                    "/var/run/snmpd.pid".into(),
                ];
                daemon.pidfile = Some("/var/run/snmpd.pid".into());
            }
            DaemonKind::Dhcp => {
                // Only runs when explicitly configured
                daemon.command = "/usr/sbin/dhcpd3".into();
                daemon.args = vec!["-q".into(), "-pf".into(), "/var/run/dhcpd.pid".into()];
                if let Some(private) = &cfg.network.private {
                    daemon.args.push(private.device.clone());
                }
                daemon.pidfile = Some("/var/run/dhcpd.pid".into());
                daemon.enabled = cfg.daemons.contains_key(&DaemonKind::Dhcp);
            }
            DaemonKind::Dhclient => {
                daemon.command = "/sbin/dhclient3".into();
                daemon.pidfile = Some("/var/run/dhclient-l2tp.pid".into());
                daemon.args = vec![
                    "-nw".into(),
                    "-pf".into(),
                    "/var/run/dhclient-l2tp.pid".into(),
                    "-sf".into(),
                    DHCLIENT_SCRIPT.into(),
                ];
                daemon.args.extend(env.dhcp_devices.iter().cloned());
                // Stale lease info must not be mistaken for a fresh lease
                daemon.cleanup_files = cfg
                    .interfaces()
                    .map(|i| cfg.paths.dhcp_lease_file(&i.device))
                    .collect();
            }
        }

        if let Some(over) = cfg.daemons.get(&kind) {
            if let Some(command) = &over.command {
                daemon.command = command.clone();
            }
            if let Some(args) = &over.args {
                daemon.args = args.clone();
            }
            if let Some(pidfile) = &over.pidfile {
                daemon.pidfile = Some(pidfile.clone());
            }
            daemon.configs.extend(over.config_files.iter().cloned());
        }
        daemon
    }

    /// Files written by [`Daemon::write_config`]
    pub fn config_files(&self) -> &[ConfigFile] {
        &self.configs
    }

    /// Write the configuration files, creating parent directories
    pub fn write_config(&self) -> Result<()> {
        for file in &self.configs {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&file.path, &file.contents)
                .with_context(|| format!("Failed to write {}", file.path.display()))?;
        }
        Ok(())
    }

    /// Load kernel modules the daemon needs
    pub async fn pre_start(&self, exec: &dyn Executor) -> Result<()> {
        if self.kind == DaemonKind::Openl2tp {
            run_logged(exec, CommandSpec::new(MODPROBE).arg("pppol2tp"), false).await;
        }
        Ok(())
    }

    /// Launch through start-stop-daemon. Spawned and unconfigured daemons are skipped.
    pub async fn start(&self, exec: &dyn Executor) -> Result<()> {
        if self.spawned || !self.enabled {
            log::debug!("{}: not started directly", self.kind);
            return Ok(());
        }
        if let Some(pidfile) = &self.pidfile {
            if let Err(e) = remove_if_exists(pidfile) {
                log::warn!("{}: {:#}", self.kind, e);
            }
        }

        let mut cmd = CommandSpec::new(START_STOP_DAEMON)
            .args(["--start", "--verbose", "--exec"])
            .arg(&self.command);
        if let Some(pidfile) = &self.pidfile {
            cmd = cmd.arg("--pidfile").arg(pidfile.display().to_string());
        }
        if !self.args.is_empty() {
            cmd = cmd.arg("--").args(self.args.iter().cloned());
        }
        run_checked(exec, cmd)
            .await
            .with_context(|| format!("Failed to start {}", self.kind))?;
        log::debug!("{} started", self.kind);
        Ok(())
    }

    /// Push runtime configuration once the daemon is up
    pub async fn post_start(&self, exec: &dyn Executor) -> Result<()> {
        match self.kind {
            DaemonKind::Pluto => {
                if let Some(ike) = &self.ike {
                    self.whack_server(exec, ike).await?;
                }
            }
            DaemonKind::Openl2tp => self.restore_config(exec, OPENL2TPCONFIG).await?,
            DaemonKind::Ippool => self.restore_config(exec, IPPOOLCONFIG).await?,
            _ => {}
        }
        Ok(())
    }

    // whack's exit status is unreliable, it reports pluto progress codes
    async fn whack_server(&self, exec: &dyn Executor, ike: &IkeServer) -> Result<()> {
        let out = exec
            .run(CommandSpec::new(IPSEC).args(["whack", "--listen"]))
            .await?;
        log::debug!("whack --listen: {:?} {}", out.code, out.stderr.trim());

        let host = ike.address.to_string();
        let cmd = CommandSpec::new(IPSEC)
            .args(["whack", "--name", SERVER_CONNECTION])
            .args(["--host", &host, "--nexthop", &host])
            .args(["--clientprotoport", "17/1701", "--updown", TRUE])
            .args(["--to", "--host", "%any"])
            .args(["--clientprotoport", "17/0", "--updown", TRUE])
            .args(["--psk", "--encrypt", IKE_PROPOSAL])
            .arg("--ikelifetime")
            .arg(ike.ike_lifetime.to_string())
            .arg("--ipseclifetime")
            .arg(ike.ipsec_lifetime.to_string())
            .args(["--dontrekey", "--forceencaps"]);
        let out = exec.run(cmd).await?;
        log::debug!("whack {}: {:?} {}", SERVER_CONNECTION, out.code, out.stderr.trim());
        Ok(())
    }

    async fn restore_config(&self, exec: &dyn Executor, tool: &str) -> Result<()> {
        if let Some(file) = self.configs.first() {
            run_checked(
                exec,
                CommandSpec::new(tool)
                    .args(["config", "restore"])
                    .arg(format!("file={}", file.path.display())),
            )
            .await
            .with_context(|| format!("{} config restore failed", self.kind))?;
        }
        Ok(())
    }

    /// Ask the daemon to let its clients go before the real stop
    pub async fn pre_stop(&self, exec: &dyn Executor) {
        if self.kind == DaemonKind::Pppd {
            // Let clients see a normal disconnect before the hard kill
            let cmd = self.stop_command("TERM", None);
            run_logged(exec, cmd, true).await;
        }
    }

    fn stop_command(&self, signal: &str, timeout: Option<u64>) -> CommandSpec {
        let cmd = CommandSpec::new(START_STOP_DAEMON).args(["--stop", "--verbose"]);
        let cmd = match timeout {
            Some(t) => cmd.arg("--retry").arg(format!("{}/{}", signal, t)),
            None => cmd.arg("--signal").arg(signal),
        };
        match &self.pidfile {
            Some(pidfile) => cmd.arg("--pidfile").arg(pidfile.display().to_string()),
            None => cmd.arg("--exec").arg(&self.command),
        }
    }

    /// Stop with SIGTERM, escalating after the configured timeout
    pub async fn soft_stop(&self, exec: &dyn Executor, silent: bool) {
        let cmd = self.stop_command("TERM", Some(self.stop_timeout));
        let quiet = silent || !self.enabled;
        match exec.run(cmd).await {
            Ok(out) if out.success() => {}
            // 1: nothing was running
            Ok(out) if quiet || out.code == Some(1) => {
                log::debug!("{} soft stop: exit {:?}", self.kind, out.code)
            }
            Ok(out) => log::warn!("{} soft stop failed: exit {:?}", self.kind, out.code),
            Err(e) => log::warn!("{} soft stop: {:#}", self.kind, e),
        }
    }

    /// SIGKILL with a bounded wait, then remove the pidfile and leftovers.
    /// An error means the process may still be alive.
    pub async fn hard_stop(&self, exec: &dyn Executor) -> Result<()> {
        let out = exec
            .run(self.stop_command("KILL", Some(self.stop_timeout)))
            .await
            .with_context(|| format!("Failed to hard stop {}", self.kind))?;
        // start-stop-daemon exits 2 when the process survived the schedule
        anyhow::ensure!(
            out.code != Some(2),
            "{} still running after KILL and {} s",
            self.kind,
            self.stop_timeout
        );

        match self.kind {
            DaemonKind::Openl2tp => {
                let cmd = CommandSpec::new(START_STOP_DAEMON)
                    .args(["--stop", "--verbose", "--signal", "KILL", "--exec"])
                    .arg(OPENL2TPCONFIG);
                run_logged(exec, cmd, true).await;
            }
            DaemonKind::Dhclient => {
                // A dhclient started by the distro scripts must not survive either
                run_logged(exec, CommandSpec::new(KILLALL).arg(&self.command), true).await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                run_logged(
                    exec,
                    CommandSpec::new(KILLALL).arg("-9").arg(&self.command),
                    true,
                )
                .await;
            }
            _ => {}
        }

        for path in self.pidfile.iter().chain(&self.cleanup_files) {
            remove_if_exists(path)?;
        }

        if self.kind == DaemonKind::Pluto {
            flush_ipsec(exec).await?;
        }
        Ok(())
    }

    /// Remove what the daemon leaves behind, such as IPsec SAs
    pub async fn post_stop(&self, exec: &dyn Executor) {
        if self.kind == DaemonKind::Pluto {
            if let Err(e) = flush_ipsec(exec).await {
                log::warn!("tolerating failed IPsec flush: {:#}", e);
            }
        }
    }

    /// Liveness via the pidfile, or `pidof` when the daemon writes none
    pub async fn check_process(&self, exec: &dyn Executor) -> bool {
        if self.spawned || !self.enabled {
            return true;
        }

        if let Some(pidfile) = &self.pidfile {
            let pid = match fs::read_to_string(pidfile) {
                Ok(contents) => contents.trim().parse::<i32>().ok(),
                Err(_) => {
                    log::warn!("missing pidfile {}, assuming {} exited", pidfile.display(), self.kind);
                    return false;
                }
            };
            return pid.is_some_and(|pid| exec.is_alive(pid));
        }

        let out = match exec.run(CommandSpec::new(PIDOF).arg(self.kind.name())).await {
            Ok(out) if out.success() => out,
            _ => return false,
        };
        let pids: Vec<&str> = out.stdout.split_whitespace().collect();
        match pids.as_slice() {
            [pid] => pid.parse().is_ok_and(|pid| exec.is_alive(pid)),
            _ => false,
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

async fn flush_ipsec(exec: &dyn Executor) -> Result<()> {
    run_checked(exec, CommandSpec::new(SETKEY).arg("-F"))
        .await
        .context("IPsec SA flush failed")?;
    run_checked(exec, CommandSpec::new(SETKEY).arg("-FP"))
        .await
        .context("IPsec policy flush failed")?;
    Ok(())
}

fn encode_hex(s: &str) -> String {
    s.bytes().fold(String::from("0x"), |mut acc, b| {
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

/// Pluto secrets: address specific keys first, then the generic ones in
/// preference order. Keys are hex encoded so any byte is safe.
pub fn psk_file(specific: &[(Ipv4Addr, String)], generic: &[String]) -> String {
    if generic.is_empty() {
        log::warn!("no generic pre-shared keys configured");
    }
    let mut out = String::new();
    for (addr, psk) in specific {
        let _ = writeln!(out, "{} : PSK {}", addr, encode_hex(psk));
    }
    for psk in generic {
        let _ = writeln!(out, ": PSK {}", encode_hex(psk));
    }
    out
}

/// Rewrite the secrets file and have pluto reload it
pub async fn rewrite_psks(
    exec: &dyn Executor,
    path: &Path,
    specific: &[(Ipv4Addr, String)],
    generic: &[String],
) -> Result<()> {
    fs::write(path, psk_file(specific, generic))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    run_checked(exec, CommandSpec::new(IPSEC).args(["whack", "--rereadsecrets"])).await?;
    Ok(())
}

fn ezipupdate_config(cfg: &Config, env: &DaemonEnv) -> String {
    let mut out = String::new();
    if let Some(dyndns) = &cfg.dyndns {
        let _ = writeln!(out, "service-type={}", dyndns.service);
        let _ = writeln!(out, "host={}", dyndns.hostname);
        if let Some(credentials) = &dyndns.credentials {
            let _ = writeln!(out, "user={}", credentials);
        }
        match (dyndns.address, env.dyndns_address) {
            (DynDnsAddressSource::Interface, _) => {
                let _ = writeln!(out, "interface={}", cfg.network.public.device);
            }
            (_, Some(addr)) => {
                let _ = writeln!(out, "address={}", addr);
            }
            (_, None) => log::warn!("dyndns: no address known yet"),
        }
        out.push_str("max-interval=2073600\n");
    }
    out
}

/// The daemons of one runner incarnation
#[derive(Debug)]
pub struct DaemonRegistry {
    mode: RunMode,
    started: Vec<Daemon>,
}

impl DaemonRegistry {
    /// Empty registry for the given mode
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            started: Vec::new(),
        }
    }

    /// Started daemons in start order
    pub fn started(&self) -> &[Daemon] {
        &self.started
    }

    /// Started daemon of the given kind
    pub fn get(&self, kind: DaemonKind) -> Option<&Daemon> {
        self.started.iter().find(|d| d.kind == kind)
    }

    /// Configure and start every daemon in [`START_ORDER`]. Each phase runs
    /// for all daemons before the next begins.
    pub async fn start_all(
        &mut self,
        exec: &dyn Executor,
        cfg: &Config,
        env: &DaemonEnv,
    ) -> Result<()> {
        if self.mode == RunMode::NetworkOnly {
            log::info!("Network only - no daemon start");
            return Ok(());
        }

        // Recorded up front so a partial start is still stopped in reverse
        self.started = START_ORDER
            .iter()
            .map(|kind| Daemon::new(*kind, cfg, env))
            .collect();

        for d in &self.started {
            d.write_config()
                .with_context(|| format!("{}: writing config", d.kind))?;
        }
        log::info!("Pre-starting daemons");
        for d in &self.started {
            d.pre_start(exec).await?;
        }
        log::info!("Starting daemons");
        for d in &self.started {
            d.start(exec).await?;
        }
        log::info!("Post-starting daemons");
        for d in &self.started {
            d.post_start(exec)
                .await
                .with_context(|| format!("{}: post start", d.kind))?;
        }
        Ok(())
    }

    /// Daemons to stop, in order. The DHCP client is always included.
    pub fn stop_set(&self, cfg: &Config, env: &DaemonEnv, all_daemons: bool) -> Vec<Daemon> {
        let mut daemons = match self.mode {
            RunMode::NetworkOnly => Vec::new(),
            RunMode::Full if all_daemons => STOP_ORDER_ALL
                .iter()
                .map(|kind| Daemon::new(*kind, cfg, env))
                .collect(),
            RunMode::Full => self.started.iter().rev().cloned().collect(),
        };
        daemons.push(Daemon::new(DaemonKind::Dhclient, cfg, env));
        daemons
    }

    /// Daemons whose death is a health failure. ez-ipupdate exits on its
    /// own when the account is misconfigured, so it is left out.
    pub fn monitored(&self, cfg: &Config, env: &DaemonEnv) -> Vec<Daemon> {
        let mut daemons: Vec<Daemon> = self
            .started
            .iter()
            .filter(|d| d.kind != DaemonKind::Ezipupdate)
            .cloned()
            .collect();
        if cfg.uses_dhcp() {
            daemons.push(Daemon::new(DaemonKind::Dhclient, cfg, env));
        }
        daemons
    }

    /// Phased stop: pre-stop, soft stop, hard stop, post-stop, with a settle
    /// delay between phases. A failed hard stop aborts the sequence.
    pub async fn stop_all(
        &mut self,
        exec: &dyn Executor,
        cfg: &Config,
        env: &DaemonEnv,
        all_daemons: bool,
        silent: bool,
    ) -> Result<(), RunnerError> {
        let daemons = self.stop_set(cfg, env, all_daemons);
        let settle = Duration::from_secs(cfg.timeouts.stop_settle);

        for d in &daemons {
            d.pre_stop(exec).await;
        }
        tokio::time::sleep(settle).await;

        for d in &daemons {
            d.soft_stop(exec, silent).await;
        }
        tokio::time::sleep(settle).await;

        for d in &daemons {
            if let Err(e) = d.hard_stop(exec).await {
                log::error!("hard stop failed for {}: {:#}", d.kind, e);
                return Err(RunnerError::RebootRequired(format!(
                    "daemon hard stop failed: {}",
                    d.kind
                )));
            }
        }
        tokio::time::sleep(settle).await;

        for d in &daemons {
            d.post_stop(exec).await;
        }
        self.started.clear();
        Ok(())
    }

    /// Reconfigure and restart one started daemon in place
    pub async fn restart(
        &mut self,
        kind: DaemonKind,
        exec: &dyn Executor,
        cfg: &Config,
        env: &DaemonEnv,
    ) -> Result<()> {
        let pos = self
            .started
            .iter()
            .position(|d| d.kind == kind)
            .with_context(|| format!("{} was not started", kind))?;

        let fresh = Daemon::new(kind, cfg, env);
        let old = std::mem::replace(&mut self.started[pos], fresh.clone());
        old.soft_stop(exec, false).await;
        old.hard_stop(exec).await?;
        fresh.write_config()?;
        fresh.pre_start(exec).await?;
        fresh.start(exec).await?;
        fresh.post_start(exec).await?;
        log::info!("{} restarted", kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exec::mock::{MockExecutor, ProcBehavior};
    use crate::exec::CommandOutput;
    use crate::types::DaemonOverride;

    fn env() -> DaemonEnv {
        DaemonEnv {
            public_address: Some(Ipv4Addr::new(203, 0, 113, 10)),
            dhcp_devices: vec!["eth0".into()],
            dyndns_address: None,
        }
    }

    fn temp_config(dir: &Path) -> Config {
        let mut cfg = test_config();
        cfg.paths.ipsec_secrets = dir.join("ipsec.secrets");
        cfg.paths.ezipupdate_conf = dir.join("ez-ipupdate.conf");
        cfg.timeouts.stop_settle = 1;
        // Pidfiles under the temp dir so start() never touches /var/run
        for kind in START_ORDER.iter().chain([DaemonKind::Dhclient].iter()) {
            cfg.daemons.entry(*kind).or_default().pidfile =
                Some(dir.join(format!("{}.pid", kind.name())));
        }
        cfg.daemons.remove(&DaemonKind::Dhcp);
        cfg
    }

    fn kinds(daemons: &[Daemon]) -> Vec<DaemonKind> {
        daemons.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn test_start_and_stop_orders() {
        let cfg = test_config();
        let mut registry = DaemonRegistry::new(RunMode::Full);
        registry.started = START_ORDER.iter().map(|k| Daemon::new(*k, &cfg, &env())).collect();

        let mut reversed: Vec<DaemonKind> = START_ORDER.iter().rev().copied().collect();
        reversed.push(DaemonKind::Dhclient);
        assert_eq!(kinds(&registry.stop_set(&cfg, &env(), false)), reversed);

        let mut all = STOP_ORDER_ALL.to_vec();
        all.push(DaemonKind::Dhclient);
        assert_eq!(kinds(&registry.stop_set(&cfg, &env(), true)), all);

        let network_only = DaemonRegistry::new(RunMode::NetworkOnly);
        assert_eq!(
            kinds(&network_only.stop_set(&cfg, &env(), true)),
            vec![DaemonKind::Dhclient]
        );
    }

    #[test]
    fn test_monitored_set() {
        let mut cfg = test_config();
        let mut registry = DaemonRegistry::new(RunMode::Full);
        registry.started = START_ORDER.iter().map(|k| Daemon::new(*k, &cfg, &env())).collect();

        let monitored = kinds(&registry.monitored(&cfg, &env()));
        assert!(!monitored.contains(&DaemonKind::Ezipupdate));
        assert!(!monitored.contains(&DaemonKind::Dhclient));
        assert_eq!(monitored.len(), 8);

        cfg.network.public.address = crate::config::AddressConfig::Dhcp;
        let monitored = kinds(&registry.monitored(&cfg, &env()));
        assert_eq!(monitored.last(), Some(&DaemonKind::Dhclient));
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let mut cfg = test_config();
        cfg.daemons.insert(
            DaemonKind::Snmpd,
            DaemonOverride {
                command: Some("/opt/snmpd".into()),
                args: Some(vec!["-f".into()]),
                pidfile: None,
                config_files: vec![ConfigFile {
                    path: "/tmp/snmpd.conf".into(),
                    contents: "rocommunity public\n".into(),
                }],
            },
        );
        let d = Daemon::new(DaemonKind::Snmpd, &cfg, &env());
        assert_eq!(d.command, "/opt/snmpd");
        assert_eq!(d.args, vec!["-f".to_string()]);
        assert_eq!(d.pidfile, Some(PathBuf::from("/var/run/snmpd.pid")));
        assert_eq!(d.config_files().len(), 1);

        let openl2tp = Daemon::new(DaemonKind::Openl2tp, &cfg, &env());
        assert_eq!(openl2tp.args, vec!["-u", "1701", "-a", "203.0.113.10"]);
    }

    #[test]
    fn test_psk_file_hex_encodes_keys() {
        let file = psk_file(
            &[(Ipv4Addr::new(198, 51, 100, 7), "ab".into())],
            &["key".into(), "x y".into()],
        );
        assert_eq!(
            file,
            "198.51.100.7 : PSK 0x6162\n: PSK 0x6b6579\n: PSK 0x782079\n"
        );
    }

    #[tokio::test]
    async fn test_start_command_line() {
        let cfg = test_config();
        let exec = MockExecutor::new();
        Daemon::new(DaemonKind::Portmap, &cfg, &env())
            .start(exec.as_ref())
            .await
            .unwrap();
        assert_eq!(
            exec.commands(),
            vec!["/sbin/start-stop-daemon --start --verbose --exec /sbin/portmap -- -i 127.0.0.1"]
        );

        // pppd is forked by openl2tpd, ez-ipupdate needs [dyndns]
        exec.clear_calls();
        Daemon::new(DaemonKind::Pppd, &cfg, &env()).start(exec.as_ref()).await.unwrap();
        Daemon::new(DaemonKind::Ezipupdate, &cfg, &env()).start(exec.as_ref()).await.unwrap();
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let cfg = test_config();
        let exec = MockExecutor::new();
        exec.respond(
            "/sbin/start-stop-daemon --start",
            CommandOutput::failed(1, "no such file"),
        );
        let err = Daemon::new(DaemonKind::Portmap, &cfg, &env())
            .start(exec.as_ref())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("portmap"));
    }

    #[tokio::test]
    async fn test_hard_stop_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        let exec = MockExecutor::new();
        let d = Daemon::new(DaemonKind::Snmpd, &cfg, &env());
        let pidfile = d.pidfile.clone().unwrap();
        fs::write(&pidfile, "4242\n").unwrap();

        exec.respond("/sbin/start-stop-daemon --stop --verbose --retry KILL", CommandOutput::failed(2, ""));
        assert!(d.hard_stop(exec.as_ref()).await.is_err());
        assert!(pidfile.exists());

        // Nothing running (exit 1) is fine and cleans up
        exec.respond("/sbin/start-stop-daemon --stop --verbose --retry KILL", CommandOutput::failed(1, ""));
        d.hard_stop(exec.as_ref()).await.unwrap();
        assert!(!pidfile.exists());
    }

    #[tokio::test]
    async fn test_check_process() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        let exec = MockExecutor::new();
        exec.spawn(4242, ProcBehavior::Normal);

        let snmpd = Daemon::new(DaemonKind::Snmpd, &cfg, &env());
        assert!(!snmpd.check_process(exec.as_ref()).await);
        fs::write(snmpd.pidfile.as_ref().unwrap(), "4242\n").unwrap();
        assert!(snmpd.check_process(exec.as_ref()).await);
        fs::write(snmpd.pidfile.as_ref().unwrap(), "4243\n").unwrap();
        assert!(!snmpd.check_process(exec.as_ref()).await);

        let mut no_pidfile = test_config();
        no_pidfile.daemons.clear();
        let portmap = Daemon::new(DaemonKind::Portmap, &no_pidfile, &env());
        exec.respond("/bin/pidof portmap", CommandOutput::with_stdout("4242\n"));
        assert!(portmap.check_process(exec.as_ref()).await);
        exec.respond("/bin/pidof portmap", CommandOutput::with_stdout("4242 4243\n"));
        assert!(!portmap.check_process(exec.as_ref()).await);

        // Disabled and spawned daemons never count as dead
        assert!(Daemon::new(DaemonKind::Dhcp, &no_pidfile, &env())
            .check_process(exec.as_ref())
            .await);
        assert!(Daemon::new(DaemonKind::Pppd, &no_pidfile, &env())
            .check_process(exec.as_ref())
            .await);
    }

    #[tokio::test]
    async fn test_start_all_phases() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        let exec = MockExecutor::new();
        let mut registry = DaemonRegistry::new(RunMode::Full);
        registry.start_all(exec.as_ref(), &cfg, &env()).await.unwrap();

        assert_eq!(kinds(registry.started()), START_ORDER.to_vec());
        let secrets = fs::read_to_string(&cfg.paths.ipsec_secrets).unwrap();
        assert!(secrets.starts_with(": PSK 0x"));

        let cmds = exec.commands();
        let modprobe = cmds.iter().position(|c| c.contains("modprobe pppol2tp")).unwrap();
        let first_start = cmds.iter().position(|c| c.contains("--start")).unwrap();
        let whack = cmds
            .iter()
            .position(|c| c.contains("--name l2tptunnel --host 203.0.113.10"))
            .unwrap();
        let last_start = cmds.iter().rposition(|c| c.contains("--start")).unwrap();
        assert!(modprobe < first_start);
        assert!(last_start < whack);
        assert!(cmds[whack].contains("--ikelifetime 28800"));
    }

    #[tokio::test]
    async fn test_network_only_starts_nothing() {
        let exec = MockExecutor::new();
        let mut registry = DaemonRegistry::new(RunMode::NetworkOnly);
        registry
            .start_all(exec.as_ref(), &test_config(), &env())
            .await
            .unwrap();
        assert!(registry.started().is_empty());
        assert!(exec.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_aborts_on_failed_hard_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        let exec = MockExecutor::new();
        let mut registry = DaemonRegistry::new(RunMode::Full);
        registry.started = vec![
            Daemon::new(DaemonKind::Pluto, &cfg, &env()),
            Daemon::new(DaemonKind::Openl2tp, &cfg, &env()),
        ];
        let openl2tp_pid = dir.path().join("openl2tpd.pid");
        exec.respond(
            &format!(
                "/sbin/start-stop-daemon --stop --verbose --retry KILL/10 --pidfile {}",
                openl2tp_pid.display()
            ),
            CommandOutput::failed(2, ""),
        );

        let err = registry
            .stop_all(exec.as_ref(), &cfg, &env(), false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::RebootRequired(_)));

        // openl2tp goes first in reverse order; pluto is never hard stopped
        let cmds = exec.commands();
        assert!(cmds.iter().any(|c| c.contains("--retry TERM/10")));
        assert!(!cmds.iter().any(|c| c.starts_with("/usr/sbin/setkey")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_flushes_ipsec() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = temp_config(dir.path());
        let exec = MockExecutor::new();
        let mut registry = DaemonRegistry::new(RunMode::Full);
        registry.started = vec![Daemon::new(DaemonKind::Pluto, &cfg, &env())];

        registry
            .stop_all(exec.as_ref(), &cfg, &env(), false, false)
            .await
            .unwrap();
        let flushes = exec
            .commands()
            .iter()
            .filter(|c| *c == "/usr/sbin/setkey -F")
            .count();
        // hard stop and post stop
        assert_eq!(flushes, 2);
        assert!(registry.started().is_empty());
    }
}
