// PPP device lifecycle

//! Handlers for the pppd `ip-pre-up`, `ip-up` and `ip-down` hooks, and the
//! forced termination primitive ("nuke") shared with the monitors.
//!
//! Pre-up validates the connection, resolves conflicts with existing
//! tunnels, provisions firewall rules and creates the [`PppDevice`] record.
//! Any failure in a hook cleans up what it can and sends SIGTERM to the
//! owning pppd, so a half configured tunnel never carries traffic.

use crate::config::Ipv4Cidr;
use crate::error::ConnectionError;
use crate::exec::{run_checked, run_logged, CommandSpec, Executor, IP, SYSCTL};
use crate::firewall::{DeviceRules, Firewall, WebForward};
use crate::ipsec;
use crate::license;
use crate::restrictions;
use crate::status::{ConnectionType, PppDevice};
use crate::store::StatusStore;
use crate::types::{Config, RouteConfig, RouteGateway, SiteToSiteRole, UserConfig, ROUTE_TABLE_CLIENT, ROUTE_TABLE_GATEWAY};
use anyhow::{Context, Result};
use chrono::Utc;
use nix::sys::signal::Signal;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which pppd hook is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// `ip-pre-up`, before the interface is configured
    PreUp,
    /// `ip-up`, interface has its addresses
    Up,
    /// `ip-down`, the link is gone
    Down,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::PreUp => "ip-pre-up",
            HookKind::Up => "ip-up",
            HookKind::Down => "ip-down",
        })
    }
}

/// Allocator markers exported by the ippool and RADIUS plugins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressAllocation {
    /// Address came from the ippool plugin
    pub ippool: bool,
    /// Address came from RADIUS
    pub radius: bool,
}

impl AddressAllocation {
    /// Neither allocator claimed the address, so pppd negotiated it
    pub fn server_allocated(self) -> bool {
        !self.ippool && !self.radius
    }
}

/// Parameters pppd hands to a hook through its environment and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookParams {
    /// PPP interface name
    pub device: String,
    /// Terminal device of the link
    pub tty: Option<String>,
    /// Link speed as pppd reports it
    pub speed: Option<String>,
    /// Our end of the tunnel
    pub local: Option<Ipv4Addr>,
    /// Client end of the tunnel
    pub remote: Option<Ipv4Addr>,
    /// Authenticated user name
    pub peername: Option<String>,
    /// pid of the pppd serving the link
    pub pppd_pid: i32,
    /// DNS servers pppd negotiated
    pub dns: Vec<Ipv4Addr>,
    /// `ipparam` option, carries the L2TP peer
    pub ipparam: Option<String>,
    /// Which allocator assigned the remote address
    pub allocation: AddressAllocation,
    /// At least one allocator marker is absent from the environment
    pub missing_address_info: bool,
}

fn parse_addr(name: &str, value: Option<String>) -> Result<Option<Ipv4Addr>> {
    value
        .map(|v| {
            v.parse()
                .with_context(|| format!("Invalid {} address: {}", name, v))
        })
        .transpose()
}

impl HookParams {
    /// Read parameters from the process environment and the positional
    /// arguments pppd passes after the hook name
    pub fn from_env(args: &[String]) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), args)
    }

    /// Positional arguments: device, tty, speed, local, remote, ipparam
    pub fn from_lookup<F>(env: F, args: &[String]) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.is_empty());
        let arg = |i: usize| args.get(i).filter(|v| !v.is_empty()).cloned();

        let device = arg(0)
            .or_else(|| var("IFNAME"))
            .context("No PPP device name in arguments or IFNAME")?;
        let pppd_pid = var("PPPD_PID")
            .context("PPPD_PID not set")?
            .parse()
            .context("Invalid PPPD_PID")?;

        let mut dns = Vec::new();
        for key in ["DNS1", "DNS2"] {
            if let Some(addr) = parse_addr(key, var(key))? {
                dns.push(addr);
            }
        }

        let ippool = var("IPPOOL_ALLOCATED_ADDRESS");
        let radius = var("RADIUS_ALLOCATED_ADDRESS");

        Ok(Self {
            device,
            tty: arg(1),
            speed: arg(2),
            local: parse_addr("local", var("IPLOCAL").or_else(|| arg(3)))?,
            remote: parse_addr("remote", var("IPREMOTE").or_else(|| arg(4)))?,
            peername: var("PEERNAME"),
            pppd_pid,
            dns,
            ipparam: arg(5).or_else(|| var("IPPARAM")),
            missing_address_info: ippool.is_none() || radius.is_none(),
            allocation: AddressAllocation {
                ippool: ippool.as_deref() == Some("TRUE"),
                radius: radius.as_deref() == Some("TRUE"),
            },
        })
    }

    fn addresses(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        match (self.local, self.remote) {
            (Some(local), Some(remote)) => Ok((local, remote)),
            _ => anyhow::bail!("IPLOCAL/IPREMOTE missing for {}", self.device),
        }
    }

    /// One line summary for logs and the device comment. Passwords in
    /// `ipparam` are masked.
    pub fn dump(&self) -> String {
        let opt = |v: &Option<Ipv4Addr>| v.map(|a| a.to_string()).unwrap_or_default();
        let ipparam = self.ipparam.as_deref().map(|p| match p.rsplit_once(':') {
            Some((head, _)) if p.starts_with("client:") => format!("{}:***", head),
            _ => p.to_string(),
        });
        format!(
            "device={} iplocal={} ipremote={} peername={} pppd_pid={} speed={} dns={:?} ipparam={} ippool={} radius={}",
            self.device,
            opt(&self.local),
            opt(&self.remote),
            self.peername.as_deref().unwrap_or(""),
            self.pppd_pid,
            self.speed.as_deref().unwrap_or(""),
            self.dns,
            ipparam.unwrap_or_default(),
            self.allocation.ippool,
            self.allocation.radius,
        )
    }
}

/// Who is on the other end of a tunnel and in which role
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    /// Authenticated name
    pub username: String,
    /// `None` for RADIUS users without local configuration
    pub user: Option<UserConfig>,
    /// We initiated the connection (site-to-site client)
    pub client_mode: bool,
    /// Site-to-site peer rather than a road warrior
    pub site_to_site: bool,
    /// Configured fixed address
    pub fixed_ip: Option<Ipv4Addr>,
}

impl ConnectionIdentity {
    /// Status document classification
    pub fn connection_type(&self) -> ConnectionType {
        match (self.site_to_site, self.client_mode) {
            (false, _) => ConnectionType::NormalUser,
            (true, true) => ConnectionType::SiteToSiteClient,
            (true, false) => ConnectionType::SiteToSiteServer,
        }
    }

    fn is_site_to_site_client(&self) -> bool {
        self.site_to_site && self.client_mode
    }
}

/// Work out the connection's user and role.
///
/// Server mode connections are named by the negotiated peer name; client
/// mode connections carry `client:<user>:<password>` in ipparam.
pub fn resolve_identity(cfg: &Config, params: &HookParams) -> Result<ConnectionIdentity, ConnectionError> {
    let identity_err = |msg: String| ConnectionError::Identity(msg);

    let (user, username, client_mode) = match (&params.peername, &params.ipparam) {
        (Some(peer), _) => (cfg.find_user(peer).cloned(), peer.clone(), false),
        (None, Some(ipparam)) => {
            let parts: Vec<&str> = ipparam.split(':').collect();
            if parts.len() != 3 {
                return Err(identity_err("ipparam has invalid format".to_string()));
            }
            if parts[0] != "client" {
                return Err(identity_err(
                    "ipparam has invalid format (does not begin with \"client\")".to_string(),
                ));
            }
            let user = cfg
                .site_to_site_users()
                .find(|u| u.username == parts[1] && u.site_to_site_role() == Some(SiteToSiteRole::Client))
                .cloned()
                .ok_or_else(|| identity_err(format!("no site-to-site client user {}", parts[1])))?;
            (Some(user), parts[1].to_string(), true)
        }
        (None, None) => {
            return Err(identity_err(
                "no peername or ipparam, cannot determine user".to_string(),
            ))
        }
    };

    let site_to_site = match user.as_ref().map(UserConfig::site_to_site_role) {
        None if client_mode => return Err(identity_err("client mode but no user".to_string())),
        None | Some(None) => false,
        Some(Some(SiteToSiteRole::Client)) if !client_mode => {
            return Err(identity_err(format!(
                "{}: site-to-site client but not client mode",
                username
            )))
        }
        Some(Some(SiteToSiteRole::Server)) if client_mode => {
            return Err(identity_err(format!(
                "{}: site-to-site server but client mode",
                username
            )))
        }
        Some(Some(_)) => true,
    };

    if params.missing_address_info && !(site_to_site && client_mode) {
        return Err(identity_err(
            "ppp environment missing (ippool/radius) address allocation info and not a site-to-site client"
                .to_string(),
        ));
    }

    let fixed_ip = user.as_ref().and_then(|u| u.fixed_ip);
    log::info!(
        "ppp user info: username={}, known={}, fixed_ip={:?}, client_mode={}, site_to_site={}",
        username,
        user.is_some(),
        fixed_ip,
        client_mode,
        site_to_site
    );

    Ok(ConnectionIdentity {
        username,
        user,
        client_mode,
        site_to_site,
        fixed_ip,
    })
}

/// Accept or reject the addresses assigned to a new tunnel.
///
/// Site-to-site client tunnels get their addresses from the remote server
/// and must stay clear of our pool, fixed IPs and reserved addresses. All
/// other tunnels must use our server address locally and exactly one of
/// pool, RADIUS or fixed-IP allocation remotely.
pub fn check_addresses_stage1(
    cfg: &Config,
    ident: &ConnectionIdentity,
    alloc: AddressAllocation,
    local: Ipv4Addr,
    remote: Ipv4Addr,
) -> Result<(), ConnectionError> {
    let check = |msg: String| Err(ConnectionError::AddressCheck(msg));
    let subnet: &Ipv4Cidr = &cfg.ppp.subnet;
    let range = &cfg.ppp.range;
    let server_address = subnet.last_usable();
    let reserved = [subnet.network(), subnet.broadcast(), server_address];
    let who = &ident.username;

    if ident.is_site_to_site_client() {
        if !alloc.server_allocated() {
            return Err(ConnectionError::Internal(format!(
                "site-to-site client {}, addresses not server allocated",
                who
            )));
        }
        for (addr, name) in [(local, "local"), (remote, "remote")] {
            if range.contains(addr) {
                return check(format!(
                    "site-to-site client {} ppp {} address {} in ppp range {}",
                    who, name, addr, range
                ));
            }
            if let Some(owner) = cfg.users.iter().find(|u| u.fixed_ip == Some(addr)) {
                return check(format!(
                    "site-to-site client {} ppp {} address {} same as fixed IP of user {}",
                    who, name, addr, owner.username
                ));
            }
            if reserved.contains(&addr) {
                return check(format!(
                    "site-to-site client {} ppp {} address {} is a reserved ppp address (subnet {})",
                    who, name, addr, subnet
                ));
            }
        }
        return Ok(());
    }

    if local != server_address {
        return check(format!(
            "{} ppp local address {} is not the expected local address {}",
            who, local, server_address
        ));
    }

    let must_be_in_range = match (&ident.user, ident.fixed_ip) {
        (None, _) if alloc.ippool => true,
        (None, _) if alloc.radius => false,
        (None, _) => {
            return Err(ConnectionError::Internal(format!(
                "{} is unknown locally (radius?) but neither radius nor ippool allocated the address",
                who
            )))
        }
        (Some(_), Some(_)) if alloc.ippool => {
            return Err(ConnectionError::Internal(format!(
                "{} has an ippool allocated address and also a fixed IP",
                who
            )))
        }
        (Some(_), None) if alloc.ippool => true,
        (Some(_), _) if !alloc.radius => {
            return Err(ConnectionError::Internal(format!(
                "{} is configured locally but the address is not radius allocated",
                who
            )))
        }
        (Some(_), None) => {
            return Err(ConnectionError::Internal(format!(
                "{} has no ippool allocated address and no fixed IP",
                who
            )))
        }
        (Some(_), Some(fixed)) => {
            if remote != fixed {
                return check(format!(
                    "{} ppp remote address {} should match configured fixed IP {}",
                    who, remote, fixed
                ));
            }
            false
        }
    };

    if must_be_in_range && !range.contains(remote) {
        return check(format!(
            "{} ppp remote address {} should be in ppp range {}, but is not",
            who, remote, range
        ));
    }
    if !must_be_in_range && range.contains(remote) {
        return check(format!(
            "{} ppp remote address {} should not be in ppp range {}, but is",
            who, remote, range
        ));
    }
    if reserved.contains(&remote) {
        return check(format!(
            "{} ppp remote address {} is a reserved ppp address (subnet {})",
            who, remote, subnet
        ));
    }
    Ok(())
}

/// Signal policy for [`PppManager::nuke_ppp_devices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NukeOptions {
    /// Do not log failures
    pub silent: bool,
    /// Send SIGTERM first
    pub kill_soft: bool,
    /// Wait after SIGTERM
    pub soft_wait: Duration,
    /// Send SIGKILL to survivors
    pub kill_hard: bool,
    /// Wait after SIGKILL
    pub hard_wait: Duration,
}

impl NukeOptions {
    /// SIGTERM only
    pub fn soft(wait: Duration) -> Self {
        Self {
            silent: true,
            kill_soft: true,
            soft_wait: wait,
            kill_hard: false,
            hard_wait: Duration::ZERO,
        }
    }

    /// SIGKILL only, no grace period
    pub fn hard(wait: Duration) -> Self {
        Self {
            silent: true,
            kill_soft: false,
            soft_wait: Duration::ZERO,
            kill_hard: true,
            hard_wait: wait,
        }
    }

    /// SIGTERM, then SIGKILL for survivors
    pub fn soft_then_hard(soft_wait: Duration, hard_wait: Duration) -> Self {
        Self {
            silent: true,
            kill_soft: true,
            soft_wait,
            kill_hard: true,
            hard_wait,
        }
    }

    /// Clean up state but leave pppd alone
    pub fn no_kill() -> Self {
        Self {
            silent: true,
            kill_soft: false,
            soft_wait: Duration::ZERO,
            kill_hard: false,
            hard_wait: Duration::ZERO,
        }
    }
}

/// Owns everything a hook or monitor needs to provision or destroy tunnels
#[derive(Clone)]
pub struct PppManager {
    cfg: Arc<Config>,
    store: StatusStore,
    exec: Arc<dyn Executor>,
    firewall: Firewall,
    sainfo_dir: PathBuf,
}

impl PppManager {
    /// Manager applying firewall changes through `firewall`
    pub fn new(cfg: Arc<Config>, store: StatusStore, exec: Arc<dyn Executor>, firewall: Firewall) -> Self {
        let sainfo_dir = cfg.paths.sainfo_dir.clone();
        Self {
            cfg,
            store,
            exec,
            firewall,
            sainfo_dir,
        }
    }

    /// Run one hook. On failure the device is cleaned up silently and the
    /// parent pppd is sent SIGTERM. Returns whether the hook succeeded.
    pub async fn run_hook(&self, kind: HookKind, params: &HookParams) -> bool {
        log::info!("{}: {}", kind, params.dump());
        let result = match kind {
            HookKind::PreUp => self.ip_pre_up(params).await,
            HookKind::Up => self.ip_up(params).await,
            HookKind::Down => self.ip_down(params).await,
        };

        match result {
            Ok(()) => {
                log::info!("{} done for {}", kind, params.device);
                true
            }
            Err(e) => {
                log::error!("{} failed for {}, killing parent pppd: {:#}", kind, params.device, e);
                let ident = resolve_identity(&self.cfg, params).ok();
                if let Err(e) = self.cleanup(params, ident.as_ref(), true).await {
                    log::debug!("silent cleanup failed: {:#}", e);
                }
                if let Err(e) = self.exec.signal(params.pppd_pid, Signal::SIGTERM) {
                    log::warn!("failed to signal parent pppd {}: {:#}", params.pppd_pid, e);
                }
                false
            }
        }
    }

    /// Validate the peer and record the new device
    pub async fn ip_pre_up(&self, params: &HookParams) -> Result<(), ConnectionError> {
        let ident = resolve_identity(&self.cfg, params)?;
        self.flag_site_to_site(&ident.username, Some(false), Some(false));

        let (local, remote) = params.addresses()?;
        if let Err(e) = check_addresses_stage1(&self.cfg, &ident, params.allocation, local, remote) {
            if matches!(e, ConnectionError::AddressCheck(_)) && ident.is_site_to_site_client() {
                self.flag_site_to_site(&ident.username, Some(true), None);
            }
            return Err(e);
        }

        self.resolve_conflicts(&ident, params, remote).await?;

        let spoof_prevention = !ident.site_to_site;
        let info = ipsec::lookup_or_default(
            self.exec.as_ref(),
            &self.sainfo_dir,
            &params.device,
            ident.is_site_to_site_client(),
        )
        .await;
        if info.psk_index > 0 {
            log::info!("user {} is using a non-primary psk (index {})", ident.username, info.psk_index);
        }

        let license_state = license::evaluate_access(&self.cfg.license, &self.store.snapshot()?);
        let r = restrictions::evaluate(ident.user.as_ref(), &license_state, info.psk_index, &self.cfg.redirect);
        if r.restrict {
            log::info!("connection restricted for user {} because of: {}", ident.username, r.reason);
        }
        if let (Some(http), Some(https)) = (r.forward_http_port, r.forward_https_port) {
            log::info!("forwarding user {} to {}:{} because of: {}", ident.username, http, https, r.reason);
        }

        if r.drop_connection {
            log::info!("connection drop required by license, dropping");
            self.flag_site_to_site(&ident.username, None, Some(true));
            return Err(ConnectionError::LicenseDrop(format!(
                "site-to-site connection for {}: {}",
                ident.username, r.reason
            )));
        }

        let web_forward = match (r.forward, r.forward_http_port, r.forward_https_port) {
            (true, Some(http_port), Some(https_port)) => Some(WebForward {
                address: local,
                http_port,
                https_port,
            }),
            _ => None,
        };
        self.firewall.tear_down_device(&params.device, true).await?;
        self.firewall
            .set_up_device(&DeviceRules {
                device: params.device.clone(),
                peer_address: remote,
                own_address: local,
                restricted: r.restrict,
                web_forward,
                spoof_prevention,
                site_to_site: ident.site_to_site,
                custom_chains: self.cfg.network.firewall_custom_chains,
            })
            .await?;

        let now = Utc::now();
        let device = params.device.clone();
        self.store.transact(|status| {
            // Stage 2 already nuked same-name devices; a racing hook may not have
            let stale = status.retire_where(now, |d| d.device_name.as_deref() == Some(device.as_str()));
            if !stale.is_empty() {
                log::warn!("retired {} stale record(s) for {}", stale.len(), device);
            }

            let id = status.allocate_device_id();
            let mut dev = PppDevice::new(id, params.pppd_pid, &device, now);
            dev.username = Some(ident.username.clone());
            dev.connection_type = ident.connection_type();
            dev.restricted = r.restrict;
            dev.web_forwarded = r.forward;
            dev.forward_reason = r.forward_reason;
            dev.spoof_prevention = spoof_prevention;
            dev.locally_authenticated = ident.user.is_some();
            dev.local_address = local;
            dev.remote_address = remote;
            dev.outer_address = info.outer_address;
            dev.outer_port = info.outer_port;
            dev.spi_rx = info.spi_rx.clone();
            dev.spi_tx = info.spi_tx.clone();
            dev.psk_index = info.psk_index;
            dev.encapsulation = info.encapsulation;
            dev.comment = params.dump();
            status.ppp_devices.push(dev);
            Ok(())
        })?;
        Ok(())
    }

    /// Install firewall rules, routes and tunnel state
    pub async fn ip_up(&self, params: &HookParams) -> Result<(), ConnectionError> {
        let ident = resolve_identity(&self.cfg, params)?;
        let (_, remote) = params.addresses()?;
        let dev = params.device.as_str();

        if ident.site_to_site {
            for (route, table) in self.site_to_site_routes(&ident.username) {
                log::debug!("site-to-site: adding route {} table {}", route.subnet, table);
                run_checked(
                    self.exec.as_ref(),
                    CommandSpec::new(IP).args([
                        "route".to_string(),
                        "replace".to_string(),
                        route.subnet.subnet_string(),
                        "table".to_string(),
                        table.to_string(),
                        "dev".to_string(),
                        dev.to_string(),
                        "metric".to_string(),
                        route.metric.to_string(),
                    ]),
                )
                .await?;
            }
        }

        run_checked(
            self.exec.as_ref(),
            CommandSpec::new(IP).args([
                "route".to_string(),
                "replace".to_string(),
                format!("{}/32", remote),
                "table".to_string(),
                ROUTE_TABLE_CLIENT.to_string(),
                "dev".to_string(),
                dev.to_string(),
            ]),
        )
        .await?;

        // Multi-table routing breaks reverse path filtering on PPP devices
        run_checked(
            self.exec.as_ref(),
            CommandSpec::new(SYSCTL)
                .arg("-w")
                .arg(format!("net.ipv4.conf.{}.rp_filter=0", dev)),
        )
        .await?;
        Ok(())
    }

    /// Tear down whatever `ip-up` installed and retire the record
    pub async fn ip_down(&self, params: &HookParams) -> Result<(), ConnectionError> {
        let ident = resolve_identity(&self.cfg, params)?;
        self.cleanup(params, Some(&ident), false).await?;
        Ok(())
    }

    /// Remove routes and firewall state of a device and retire its record.
    /// pppd is not signalled; in silent mode every step is attempted.
    async fn cleanup(&self, params: &HookParams, ident: Option<&ConnectionIdentity>, silent: bool) -> Result<()> {
        if let Some(ident) = ident.filter(|i| i.site_to_site) {
            for (route, table) in self.site_to_site_routes(&ident.username) {
                // Blackhole routes with a higher metric stay behind
                run_logged(
                    self.exec.as_ref(),
                    CommandSpec::new(IP).args([
                        "route".to_string(),
                        "del".to_string(),
                        route.subnet.subnet_string(),
                        "table".to_string(),
                        table.to_string(),
                        "metric".to_string(),
                        route.metric.to_string(),
                    ]),
                    true,
                )
                .await;
            }
        }

        if let Some(remote) = params.remote {
            run_logged(
                self.exec.as_ref(),
                CommandSpec::new(IP).args([
                    "route".to_string(),
                    "del".to_string(),
                    format!("{}/32", remote),
                    "table".to_string(),
                    ROUTE_TABLE_CLIENT.to_string(),
                    "dev".to_string(),
                    params.device.clone(),
                ]),
                true,
            )
            .await;
        }

        let opts = NukeOptions {
            silent,
            ..NukeOptions::no_kill()
        };
        match self.nuke_ppp_devices(std::slice::from_ref(&params.device), opts).await {
            Ok(_) => Ok(()),
            Err(e) if silent => {
                log::debug!("device retire failed (silent): {:#}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn site_to_site_routes<'a>(&'a self, username: &'a str) -> impl Iterator<Item = (&'a RouteConfig, &'static str)> {
        let net = &self.cfg.network;
        net.gateway_routes
            .iter()
            .map(|r| (r, ROUTE_TABLE_GATEWAY))
            .chain(net.client_routes.iter().map(|r| (r, ROUTE_TABLE_CLIENT)))
            .filter(move |(r, _)| matches!(&r.gateway, RouteGateway::SiteToSite { user } if user == username))
    }

    /// Kill tunnels that would conflict with the new one: same remote
    /// address always, same username when the user must be unique, and any
    /// leftover device with the same name.
    async fn resolve_conflicts(
        &self,
        ident: &ConnectionIdentity,
        params: &HookParams,
        remote: Ipv4Addr,
    ) -> Result<()> {
        let t = &self.cfg.timeouts;
        let full = NukeOptions::soft_then_hard(
            Duration::from_secs(t.nuke_soft_wait),
            Duration::from_secs(t.nuke_hard_wait),
        );

        let nuke_same_user = ident.fixed_ip.is_some()
            || (ident.user.is_none() && !params.allocation.ippool)
            || (ident.site_to_site && !ident.client_mode);
        log::debug!("nuke_same_ip=true, nuke_same_user={}", nuke_same_user);

        let status = self.store.snapshot()?;
        let same_ip = conflicting_devices(&status.ppp_devices, |d| d.remote_address == remote);
        if !same_ip.is_empty() {
            log::info!("nuking previous connections with ip {}: {:?}", remote, same_ip);
            self.nuke_ppp_devices(&same_ip, full).await?;
        }

        if nuke_same_user {
            let status = self.store.snapshot()?;
            let same_user = conflicting_devices(&status.ppp_devices, |d| {
                d.username.as_deref() == Some(ident.username.as_str())
            });
            if !same_user.is_empty() {
                log::info!("nuking previous connections with username {}: {:?}", ident.username, same_user);
                self.nuke_ppp_devices(&same_user, full).await?;
            }
        }

        log::debug!("nuking previous devices with same name [sanity]");
        self.nuke_ppp_devices(
            std::slice::from_ref(&params.device),
            NukeOptions::hard(Duration::from_secs(t.nuke_hard_wait)),
        )
        .await?;
        Ok(())
    }

    fn flag_site_to_site(&self, username: &str, address_check: Option<bool>, license_restricted: Option<bool>) {
        let result = self.store.transact(|status| {
            if let Some(s2s) = status.site_to_site_status_mut(username) {
                if let Some(v) = address_check {
                    log::info!("setting s2s address check failure to {} for user {}", v, username);
                    s2s.address_check_failure = v;
                }
                if let Some(v) = license_restricted {
                    log::info!("setting s2s license restricted failure to {} for user {}", v, username);
                    s2s.license_restricted_failure = v;
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            log::warn!("failed to set s2s error flags: {:#}", e);
        }
    }

    /// Force-terminate PPP devices: links down, firewall torn down, records
    /// retired, then the owning pppds signalled. Records without a device
    /// name are retired too. Returns `true` when none of the targeted pppds
    /// is alive at the end; unknown names are a successful no-op.
    pub async fn nuke_ppp_devices(&self, names: &[String], opts: NukeOptions) -> Result<bool> {
        log::info!(
            "nuke_ppp_devices: devices=[{}], silent={}, soft={} ({:?}), hard={} ({:?})",
            names.join(","),
            opts.silent,
            opts.kill_soft,
            opts.soft_wait,
            opts.kill_hard,
            opts.hard_wait
        );

        for name in names {
            run_logged(
                self.exec.as_ref(),
                CommandSpec::new(IP).args(["link", "set", name.as_str(), "down"]),
                opts.silent,
            )
            .await;
            if let Err(e) = self.firewall.tear_down_device(name, opts.silent).await {
                if !opts.silent {
                    log::warn!("tear down fw in nuke failed for {}: {:#}", name, e);
                }
            }
        }

        let now = Utc::now();
        let retired = self.store.transact(|status| {
            Ok(status.retire_where(now, |d| match &d.device_name {
                Some(n) => names.contains(n),
                None => {
                    log::warn!("device record {} has no device name, retiring it", d.id);
                    true
                }
            }))
        })?;
        let pids: Vec<i32> = retired.iter().map(|d| d.pppd_pid).collect();

        let mut remaining = pids.clone();
        if opts.kill_soft {
            remaining = self.kill_and_wait("soft kill", &remaining, Signal::SIGTERM, opts.soft_wait, opts.silent).await;
        }
        if opts.kill_hard {
            self.kill_and_wait("hard kill", &remaining, Signal::SIGKILL, opts.hard_wait, opts.silent).await;
        }

        let success = pids.iter().all(|pid| !self.exec.is_alive(*pid));
        log::info!("nuke_ppp_devices: done, devices=[{}], success={}", names.join(","), success);
        Ok(success)
    }

    /// Nuke every active device with a soft kill only
    pub async fn nuke_all_ppp_devices(&self, silent: bool, kill_ppp: bool) -> Result<bool> {
        let names: Vec<String> = self
            .store
            .snapshot()?
            .ppp_devices
            .iter()
            .filter_map(|d| d.device_name.clone())
            .collect();
        let opts = NukeOptions {
            silent,
            kill_soft: kill_ppp,
            soft_wait: Duration::from_secs(self.cfg.timeouts.nuke_soft_wait),
            ..NukeOptions::no_kill()
        };
        self.nuke_ppp_devices(&names, opts).await
    }

    /// Signal every pid once, then poll once per second for up to
    /// `wait` whole seconds. Returns the survivors.
    async fn kill_and_wait(&self, label: &str, pids: &[i32], signal: Signal, wait: Duration, silent: bool) -> Vec<i32> {
        if pids.is_empty() {
            return Vec::new();
        }
        for pid in pids {
            if let Err(e) = self.exec.signal(*pid, signal) {
                if !silent {
                    log::warn!("{} failed for pid {}: {:#}", label, pid, e);
                }
            }
        }

        let mut loops = wait.as_secs();
        loop {
            loops = loops.saturating_sub(1);
            tokio::time::sleep(Duration::from_secs(1)).await;
            let remaining: Vec<i32> = pids.iter().copied().filter(|p| self.exec.is_alive(*p)).collect();
            log::debug!("remaining pids after {}: {:?}", label, remaining);
            if remaining.is_empty() || loops == 0 {
                if !remaining.is_empty() {
                    log::warn!("pids left after {}: {:?}", label, remaining);
                }
                return remaining;
            }
        }
    }
}

/// Distinct device names of active records matching `pred`
fn conflicting_devices<F>(devices: &[PppDevice], pred: F) -> Vec<String>
where
    F: Fn(&PppDevice) -> bool,
{
    devices
        .iter()
        .filter(|d| pred(d))
        .filter_map(|d| d.device_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exec::mock::{MockExecutor, ProcBehavior};
    use crate::firewall::ApplyMode;
    use crate::status::{ForwardReason, SiteToSiteStatus};
    use std::collections::HashMap;

    fn params(device: &str, pid: i32, peer: Option<&str>, remote: &str, extra: &[(&str, &str)]) -> HookParams {
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("PPPD_PID".into(), pid.to_string());
        env.insert("IPLOCAL".into(), "192.168.100.254".into());
        env.insert("IPREMOTE".into(), remote.into());
        env.insert("IPPOOL_ALLOCATED_ADDRESS".into(), "TRUE".into());
        env.insert("RADIUS_ALLOCATED_ADDRESS".into(), "FALSE".into());
        if let Some(peer) = peer {
            env.insert("PEERNAME".into(), peer.into());
        }
        for (k, v) in extra {
            if v.is_empty() {
                env.remove(*k);
            } else {
                env.insert(k.to_string(), v.to_string());
            }
        }
        let args = vec![device.to_string(), String::new(), "0".to_string()];
        HookParams::from_lookup(|k| env.get(k).cloned(), &args).unwrap()
    }

    fn client_params(device: &str, pid: i32, local: &str, remote: &str) -> HookParams {
        let mut p = params(
            device,
            pid,
            None,
            remote,
            &[
                ("IPLOCAL", local),
                ("IPPOOL_ALLOCATED_ADDRESS", ""),
                ("RADIUS_ALLOCATED_ADDRESS", ""),
            ],
        );
        p.ipparam = Some("client:branch:secret".to_string());
        p
    }

    struct Harness {
        _dir: tempfile::TempDir,
        exec: Arc<MockExecutor>,
        store: StatusStore,
        ppp: PppManager,
    }

    fn harness_with(cfg: Config) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let exec = MockExecutor::new();
        let store = StatusStore::in_memory();
        let firewall = Firewall::new(exec.clone(), dir.path().join("fw.lock"), ApplyMode::Apply);
        let mut cfg = cfg;
        cfg.paths.sainfo_dir = dir.path().join("sainfo");
        let ppp = PppManager::new(Arc::new(cfg), store.clone(), exec.clone(), firewall);
        Harness {
            _dir: dir,
            exec,
            store,
            ppp,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn active_names(store: &StatusStore) -> Vec<String> {
        store
            .snapshot()
            .unwrap()
            .ppp_devices
            .iter()
            .filter_map(|d| d.device_name.clone())
            .collect()
    }

    #[test]
    fn test_hook_params_from_env_and_args() {
        let env: HashMap<&str, &str> = [
            ("IFNAME", "ignored"),
            ("IPLOCAL", "192.168.100.254"),
            ("IPREMOTE", "192.168.100.50"),
            ("PEERNAME", "alice"),
            ("PPPD_PID", "4242"),
            ("DNS1", "10.0.0.53"),
            ("IPPOOL_ALLOCATED_ADDRESS", "TRUE"),
            ("RADIUS_ALLOCATED_ADDRESS", "FALSE"),
        ]
        .into_iter()
        .collect();
        let args: Vec<String> = ["l2tp100-200", "", "0", "1.1.1.1", "2.2.2.2", "client:x:pw"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let p = HookParams::from_lookup(|k| env.get(k).map(|v| v.to_string()), &args).unwrap();

        assert_eq!(p.device, "l2tp100-200");
        assert_eq!(p.tty, None);
        assert_eq!(p.local, Some(Ipv4Addr::new(192, 168, 100, 254)));
        assert_eq!(p.pppd_pid, 4242);
        assert_eq!(p.dns, vec![Ipv4Addr::new(10, 0, 0, 53)]);
        assert!(p.allocation.ippool);
        assert!(!p.allocation.server_allocated());
        assert!(!p.missing_address_info);
        assert!(p.dump().contains("ipparam=client:x:***"));

        // Device name falls back to IFNAME, absent markers are remembered
        let env: HashMap<&str, &str> = [("IFNAME", "l2tp1-1"), ("PPPD_PID", "1")].into_iter().collect();
        let p = HookParams::from_lookup(|k| env.get(k).map(|v| v.to_string()), &[]).unwrap();
        assert_eq!(p.device, "l2tp1-1");
        assert!(p.missing_address_info);
        assert!(p.allocation.server_allocated());

        let env: HashMap<&str, &str> = [("IFNAME", "l2tp1-1")].into_iter().collect();
        assert!(HookParams::from_lookup(|k| env.get(k).map(|v| v.to_string()), &[]).is_err());
    }

    #[test]
    fn test_identity_resolution() {
        let cfg = test_config();

        let ident = resolve_identity(&cfg, &params("l2tp1-1", 1, Some("hq"), "192.168.100.9", &[])).unwrap();
        assert_eq!(ident.connection_type(), ConnectionType::SiteToSiteServer);

        let ident = resolve_identity(&cfg, &client_params("l2tp1-1", 1, "10.99.0.1", "10.99.0.2")).unwrap();
        assert_eq!(ident.username, "branch");
        assert_eq!(ident.connection_type(), ConnectionType::SiteToSiteClient);

        // Unknown peer is a RADIUS user
        let ident = resolve_identity(&cfg, &params("l2tp1-1", 1, Some("radiususer"), "192.168.100.9", &[])).unwrap();
        assert!(ident.user.is_none());
        assert_eq!(ident.connection_type(), ConnectionType::NormalUser);

        // Client role user connecting in server mode
        assert!(matches!(
            resolve_identity(&cfg, &params("l2tp1-1", 1, Some("branch"), "192.168.100.9", &[])),
            Err(ConnectionError::Identity(_))
        ));

        // Missing allocator markers only allowed for site-to-site clients
        let p = params("l2tp1-1", 1, Some("alice"), "192.168.100.9", &[("RADIUS_ALLOCATED_ADDRESS", "")]);
        assert!(matches!(resolve_identity(&cfg, &p), Err(ConnectionError::Identity(_))));

        let mut p = params("l2tp1-1", 1, None, "192.168.100.9", &[]);
        p.ipparam = Some("server:branch:pw".to_string());
        assert!(resolve_identity(&cfg, &p).is_err());
        p.ipparam = Some("client:hq:pw".to_string());
        assert!(resolve_identity(&cfg, &p).is_err());
        p.ipparam = None;
        assert!(resolve_identity(&cfg, &p).is_err());
    }

    #[test]
    fn test_pool_address_in_range_accepted() {
        let cfg = test_config();
        let p = params("l2tp100-200", 1, Some("alice"), "192.168.100.50", &[]);
        let ident = resolve_identity(&cfg, &p).unwrap();
        assert!(check_addresses_stage1(
            &cfg,
            &ident,
            p.allocation,
            p.local.unwrap(),
            p.remote.unwrap()
        )
        .is_ok());
    }

    #[test]
    fn test_pool_address_outside_range_rejected() {
        let cfg = test_config();
        let p = params("l2tp100-200", 1, Some("alice"), "10.0.0.5", &[]);
        let ident = resolve_identity(&cfg, &p).unwrap();
        let err = check_addresses_stage1(&cfg, &ident, p.allocation, p.local.unwrap(), p.remote.unwrap());
        assert!(matches!(err, Err(ConnectionError::AddressCheck(_))));
    }

    #[test]
    fn test_fixed_ip_and_radius_rules() {
        let cfg = test_config();
        let server = Ipv4Addr::new(192, 168, 100, 254);
        let radius = AddressAllocation {
            ippool: false,
            radius: true,
        };
        let ippool = AddressAllocation {
            ippool: true,
            radius: false,
        };

        let carol = resolve_identity(&cfg, &params("l2tp1-1", 1, Some("carol"), "192.168.200.7", &[])).unwrap();
        assert!(check_addresses_stage1(&cfg, &carol, radius, server, Ipv4Addr::new(192, 168, 200, 7)).is_ok());
        assert!(matches!(
            check_addresses_stage1(&cfg, &carol, radius, server, Ipv4Addr::new(192, 168, 200, 8)),
            Err(ConnectionError::AddressCheck(_))
        ));
        assert!(matches!(
            check_addresses_stage1(&cfg, &carol, ippool, server, Ipv4Addr::new(192, 168, 100, 9)),
            Err(ConnectionError::Internal(_))
        ));

        let unknown = resolve_identity(&cfg, &params("l2tp1-1", 1, Some("rad"), "10.1.1.1", &[])).unwrap();
        assert!(check_addresses_stage1(&cfg, &unknown, radius, server, Ipv4Addr::new(10, 1, 1, 1)).is_ok());
        assert!(check_addresses_stage1(&cfg, &unknown, radius, server, Ipv4Addr::new(192, 168, 100, 9)).is_err());
        assert!(matches!(
            check_addresses_stage1(&cfg, &unknown, AddressAllocation::default(), server, Ipv4Addr::new(10, 1, 1, 1)),
            Err(ConnectionError::Internal(_))
        ));

        // Wrong local address
        let alice = resolve_identity(&cfg, &params("l2tp1-1", 1, Some("alice"), "192.168.100.9", &[])).unwrap();
        assert!(check_addresses_stage1(&cfg, &alice, ippool, Ipv4Addr::new(192, 168, 100, 1), Ipv4Addr::new(192, 168, 100, 9)).is_err());
    }

    #[test]
    fn test_site_to_site_client_addresses() {
        let cfg = test_config();
        let ident = resolve_identity(&cfg, &client_params("l2tp1-1", 1, "10.99.0.1", "10.99.0.2")).unwrap();
        let alloc = AddressAllocation::default();
        let ok = |l: [u8; 4], r: [u8; 4]| check_addresses_stage1(&cfg, &ident, alloc, l.into(), r.into()).is_ok();

        assert!(ok([10, 99, 0, 1], [10, 99, 0, 2]));
        assert!(!ok([10, 99, 0, 1], [192, 168, 100, 20]));
        assert!(!ok([192, 168, 200, 7], [10, 99, 0, 2]));
        assert!(!ok([10, 99, 0, 1], [192, 168, 100, 255]));
        assert!(!ok([192, 168, 100, 254], [10, 99, 0, 2]));
        assert!(matches!(
            check_addresses_stage1(
                &cfg,
                &ident,
                AddressAllocation {
                    ippool: true,
                    radius: false
                },
                [10, 99, 0, 1].into(),
                [10, 99, 0, 2].into()
            ),
            Err(ConnectionError::Internal(_))
        ));
    }

    #[test]
    fn test_stage1_accept_implies_address_policy() {
        let cfg = test_config();
        let range = &cfg.ppp.range;
        let server = cfg.ppp.subnet.last_usable();
        let reserved = [cfg.ppp.subnet.network(), cfg.ppp.subnet.broadcast(), server];
        let allocations = [
            AddressAllocation::default(),
            AddressAllocation { ippool: true, radius: false },
            AddressAllocation { ippool: false, radius: true },
            AddressAllocation { ippool: true, radius: true },
        ];
        let idents = [
            resolve_identity(&cfg, &params("d", 1, Some("alice"), "1.1.1.1", &[])).unwrap(),
            resolve_identity(&cfg, &params("d", 1, Some("carol"), "1.1.1.1", &[])).unwrap(),
            resolve_identity(&cfg, &params("d", 1, Some("hq"), "1.1.1.1", &[])).unwrap(),
            resolve_identity(&cfg, &params("d", 1, Some("radius-only"), "1.1.1.1", &[])).unwrap(),
            resolve_identity(&cfg, &client_params("d", 1, "1.1.1.1", "1.1.1.2")).unwrap(),
        ];
        let mut candidates: Vec<Ipv4Addr> = (0..=255).map(|i| Ipv4Addr::new(192, 168, 100, i)).collect();
        candidates.extend([
            Ipv4Addr::new(192, 168, 200, 7),
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 99, 0, 2),
        ]);
        let locals = [server, Ipv4Addr::new(10, 99, 0, 1), Ipv4Addr::new(192, 168, 100, 1)];

        for ident in &idents {
            for alloc in allocations {
                for local in locals {
                    for remote in &candidates {
                        let remote = *remote;
                        if check_addresses_stage1(&cfg, ident, alloc, local, remote).is_err() {
                            continue;
                        }
                        if ident.is_site_to_site_client() {
                            for addr in [local, remote] {
                                assert!(!range.contains(addr));
                                assert!(!reserved.contains(&addr));
                                assert!(cfg.users.iter().all(|u| u.fixed_ip != Some(addr)));
                            }
                            assert!(alloc.server_allocated());
                        } else {
                            assert_eq!(local, server);
                            assert!(!reserved.contains(&remote));
                            match ident.fixed_ip {
                                Some(fixed) => {
                                    assert_eq!(remote, fixed);
                                    assert!(!range.contains(remote));
                                }
                                None if alloc.ippool => assert!(range.contains(remote)),
                                None => {
                                    assert!(ident.user.is_none() && alloc.radius);
                                    assert!(!range.contains(remote));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_up_creates_device_and_firewall() {
        let h = harness();
        h.exec.spawn(1000, ProcBehavior::Normal);
        let p = params("l2tp100-200", 1000, Some("alice"), "192.168.100.50", &[]);

        h.ppp.ip_pre_up(&p).await.unwrap();

        let status = h.store.snapshot().unwrap();
        assert_eq!(status.ppp_devices.len(), 1);
        let dev = &status.ppp_devices[0];
        assert_eq!(dev.device_name.as_deref(), Some("l2tp100-200"));
        assert_eq!(dev.username.as_deref(), Some("alice"));
        assert_eq!(dev.connection_type, ConnectionType::NormalUser);
        assert!(dev.spoof_prevention);
        assert!(dev.locally_authenticated);
        assert!(!dev.restricted);
        assert_eq!(dev.remote_address, Ipv4Addr::new(192, 168, 100, 50));
        assert_eq!(dev.spi_rx, "0x00000000");
        assert!(dev.stop_time.is_none());

        let restores: Vec<_> = h
            .exec
            .calls()
            .into_iter()
            .filter(|c| c.program == "/sbin/iptables-restore")
            .collect();
        assert_eq!(restores.len(), 1);
        assert!(restores[0]
            .stdin
            .as_deref()
            .unwrap()
            .contains("-A ppp_prert_l2tp100-200 -s ! 192.168.100.50 -j DROP"));
        assert!(h.exec.is_alive(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_remote_address_nukes_previous_user() {
        let h = harness();
        h.exec.spawn(1001, ProcBehavior::Normal);
        h.exec.spawn(1002, ProcBehavior::Normal);

        let alice = params("l2tp10-10", 1001, Some("alice"), "192.168.100.50", &[]);
        h.ppp.ip_pre_up(&alice).await.unwrap();
        let bob = params("l2tp11-11", 1002, Some("bob"), "192.168.100.50", &[]);
        h.ppp.ip_pre_up(&bob).await.unwrap();

        let status = h.store.snapshot().unwrap();
        assert_eq!(status.ppp_devices.len(), 1);
        assert_eq!(status.ppp_devices[0].username.as_deref(), Some("bob"));
        assert_eq!(status.retired_ppp_devices.len(), 1);
        assert_eq!(status.retired_ppp_devices[0].username.as_deref(), Some("alice"));
        assert!(status.retired_ppp_devices[0].stop_time.is_some());

        assert_eq!(h.exec.signals_to(1001), vec![Signal::SIGTERM]);
        assert!(!h.exec.is_alive(1001));
        assert!(h.exec.signals_to(1002).is_empty());
        assert!(h.exec.commands().contains(&"/sbin/ip link set l2tp10-10 down".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unique_users_nuked_by_username() {
        let h = harness();
        h.exec.spawn(2001, ProcBehavior::IgnoresTerm);
        h.exec.spawn(2002, ProcBehavior::Normal);

        // Site-to-site server users may only have one tunnel
        let first = params("l2tp20-20", 2001, Some("hq"), "192.168.100.60", &[]);
        h.ppp.ip_pre_up(&first).await.unwrap();
        let second = params("l2tp21-21", 2002, Some("hq"), "192.168.100.61", &[]);
        h.ppp.ip_pre_up(&second).await.unwrap();

        assert_eq!(active_names(&h.store), vec!["l2tp21-21".to_string()]);
        assert_eq!(h.exec.signals_to(2001), vec![Signal::SIGTERM, Signal::SIGKILL]);

        // Normal pool users may have several
        h.exec.spawn(2003, ProcBehavior::Normal);
        h.exec.spawn(2004, ProcBehavior::Normal);
        h.ppp
            .ip_pre_up(&params("l2tp22-22", 2003, Some("alice"), "192.168.100.70", &[]))
            .await
            .unwrap();
        h.ppp
            .ip_pre_up(&params("l2tp23-23", 2004, Some("alice"), "192.168.100.71", &[]))
            .await
            .unwrap();
        let status = h.store.snapshot().unwrap();
        assert_eq!(
            status
                .ppp_devices
                .iter()
                .filter(|d| d.username.as_deref() == Some("alice"))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_active_device_per_name() {
        let h = harness();
        for (i, remote) in ["192.168.100.10", "192.168.100.11", "192.168.100.12"].iter().enumerate() {
            let pid = 3000 + i as i32;
            h.exec.spawn(pid, ProcBehavior::Normal);
            let user = if i % 2 == 0 { "alice" } else { "bob" };
            h.ppp
                .ip_pre_up(&params("l2tp30-30", pid, Some(user), remote, &[]))
                .await
                .unwrap();
            assert_eq!(active_names(&h.store), vec!["l2tp30-30".to_string()]);
            let status = h.store.snapshot().unwrap();
            let active: Vec<_> = status.active_by_name("l2tp30-30").collect();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].username.as_deref(), Some(user));
        }
        h.ppp
            .ip_down(&params("l2tp30-30", 3002, Some("alice"), "192.168.100.12", &[]))
            .await
            .unwrap();
        assert!(active_names(&h.store).is_empty());
        assert_eq!(h.store.snapshot().unwrap().retired_ppp_devices.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nuke_gives_up_after_soft_wait() {
        let h = harness();
        h.exec.spawn(4000, ProcBehavior::Immortal);
        h.store
            .transact(|s| {
                s.ppp_devices.push(PppDevice::new(1, 4000, "l2tp1-1", Utc::now()));
                Ok(())
            })
            .unwrap();

        let start = tokio::time::Instant::now();
        let ok = h
            .ppp
            .nuke_ppp_devices(&["l2tp1-1".to_string()], NukeOptions::soft(Duration::from_secs_f64(2.0)))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(!ok);
        assert_eq!(h.exec.signals_to(4000), vec![Signal::SIGTERM]);
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert!(active_names(&h.store).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nuke_is_idempotent() {
        let h = harness();
        h.exec.spawn(5000, ProcBehavior::Normal);
        h.store
            .transact(|s| {
                s.ppp_devices.push(PppDevice::new(1, 5000, "l2tp5-5", Utc::now()));
                Ok(())
            })
            .unwrap();

        let names = vec!["l2tp5-5".to_string()];
        let opts = NukeOptions::soft_then_hard(Duration::from_secs(15), Duration::from_secs(15));
        assert!(h.ppp.nuke_ppp_devices(&names, opts).await.unwrap());
        assert!(h.ppp.nuke_ppp_devices(&names, opts).await.unwrap());
        assert!(h
            .ppp
            .nuke_ppp_devices(&["l2tp404-404".to_string()], opts)
            .await
            .unwrap());

        let status = h.store.snapshot().unwrap();
        assert!(status.ppp_devices.is_empty());
        assert_eq!(status.retired_ppp_devices.len(), 1);
        assert_eq!(h.exec.signals_to(5000), vec![Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nuke_all_retires_nameless_records() {
        let h = harness();
        h.exec.spawn(6000, ProcBehavior::Normal);
        h.store
            .transact(|s| {
                s.ppp_devices.push(PppDevice::new(1, 6000, "l2tp6-6", Utc::now()));
                let mut nameless = PppDevice::new(2, 6001, "x", Utc::now());
                nameless.device_name = None;
                s.ppp_devices.push(nameless);
                Ok(())
            })
            .unwrap();

        assert!(h.ppp.nuke_all_ppp_devices(true, true).await.unwrap());
        let status = h.store.snapshot().unwrap();
        assert!(status.ppp_devices.is_empty());
        assert_eq!(status.retired_ppp_devices.len(), 2);
        assert_eq!(h.exec.signals_to(6000), vec![Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_license_drop_for_site_to_site() {
        let mut cfg = test_config();
        cfg.license.max_site_to_site_connections = 0;
        let h = harness_with(cfg);
        h.store
            .transact(|s| {
                s.site_to_site_statuses.push(SiteToSiteStatus {
                    username: "hq".to_string(),
                    healthy: None,
                    address_check_failure: true,
                    license_restricted_failure: false,
                    remote_address: None,
                });
                Ok(())
            })
            .unwrap();
        h.exec.spawn(7000, ProcBehavior::Normal);

        let p = params("l2tp7-7", 7000, Some("hq"), "192.168.100.77", &[]);
        let err = h.ppp.ip_pre_up(&p).await.unwrap_err();
        assert!(matches!(err, ConnectionError::LicenseDrop(_)));

        let status = h.store.snapshot().unwrap();
        assert!(status.ppp_devices.is_empty());
        assert!(status.retired_ppp_devices.is_empty());
        assert!(status.site_to_site_statuses[0].license_restricted_failure);
        assert!(!status.site_to_site_statuses[0].address_check_failure);

        // Through the hook wrapper the parent pppd gets SIGTERM
        assert!(!h.ppp.run_hook(HookKind::PreUp, &p).await);
        assert_eq!(h.exec.signals_to(7000), vec![Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_license_forwards_normal_user() {
        let mut cfg = test_config();
        cfg.license.valid = false;
        let h = harness_with(cfg);
        h.exec.spawn(8000, ProcBehavior::Normal);

        h.ppp
            .ip_pre_up(&params("l2tp8-8", 8000, Some("bob"), "192.168.100.80", &[]))
            .await
            .unwrap();
        let dev = h.store.snapshot().unwrap().ppp_devices[0].clone();
        assert!(dev.restricted);
        assert!(dev.web_forwarded);
        assert_eq!(dev.forward_reason, Some(ForwardReason::LicenseInvalid));

        let script = h
            .exec
            .calls()
            .into_iter()
            .find(|c| c.program == "/sbin/iptables-restore")
            .and_then(|c| c.stdin)
            .unwrap();
        assert!(script.contains("--to-destination 192.168.100.254:10081"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_address_failure_flags_status() {
        let h = harness();
        h.store
            .transact(|s| {
                s.site_to_site_statuses.push(SiteToSiteStatus {
                    username: "branch".to_string(),
                    healthy: None,
                    address_check_failure: false,
                    license_restricted_failure: true,
                    remote_address: None,
                });
                Ok(())
            })
            .unwrap();
        h.exec.spawn(9000, ProcBehavior::Normal);

        let p = client_params("l2tp9-9", 9000, "10.99.0.1", "192.168.100.30");
        assert!(!h.ppp.run_hook(HookKind::PreUp, &p).await);
        let s2s = h.store.snapshot().unwrap().site_to_site_statuses[0].clone();
        assert!(s2s.address_check_failure);
        assert!(!s2s.license_restricted_failure);
        assert_eq!(h.exec.signals_to(9000), vec![Signal::SIGTERM]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_and_down_routes_for_site_to_site_client() {
        let h = harness();
        h.exec.spawn(9100, ProcBehavior::Normal);
        let p = client_params("l2tp5-5", 9100, "10.99.0.1", "10.99.0.2");

        h.ppp.ip_pre_up(&p).await.unwrap();
        let dev = h.store.snapshot().unwrap().ppp_devices[0].clone();
        assert_eq!(dev.connection_type, ConnectionType::SiteToSiteClient);
        assert!(!dev.spoof_prevention);

        h.exec.clear_calls();
        h.ppp.ip_up(&p).await.unwrap();
        assert_eq!(
            h.exec.commands(),
            vec![
                "/sbin/ip route replace 172.16.5.0/24 table 100 dev l2tp5-5 metric 10",
                "/sbin/ip route replace 10.99.0.2/32 table 100 dev l2tp5-5",
                "/sbin/sysctl -w net.ipv4.conf.l2tp5-5.rp_filter=0",
            ]
        );

        h.exec.clear_calls();
        assert!(h.ppp.run_hook(HookKind::Down, &p).await);
        let cmds = h.exec.commands();
        assert_eq!(cmds[0], "/sbin/ip route del 172.16.5.0/24 table 100 metric 10");
        assert_eq!(cmds[1], "/sbin/ip route del 10.99.0.2/32 table 100 dev l2tp5-5");
        assert_eq!(cmds[2], "/sbin/ip link set l2tp5-5 down");
        // pppd is exiting on its own after ip-down
        assert!(h.exec.signals_to(9100).is_empty());
        assert!(active_names(&h.store).is_empty());
    }
}
