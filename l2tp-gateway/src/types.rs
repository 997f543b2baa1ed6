// Shared types and configuration structures

//! Configuration structures read from the TOML configuration file, plus the
//! small constants shared by the firewall, routing and daemon layers.

use crate::config::{AddressConfig, AddressRange, Ipv4Cidr};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Packet mark for IPsec traffic
pub const FWMARK_IPSEC: u32 = 1;
/// Packet mark for traffic that must not be NATted
pub const FWMARK_SKIPNAT: u32 = 2;
/// Packet mark for traffic entering from any PPP device
pub const FWMARK_PPP: u32 = 4;
/// Packet mark for locally originated L2TP traffic
pub const FWMARK_LOCAL_L2TP: u32 = 8;
/// Packet mark for site-to-site tunnel traffic, selects the client routing table
pub const FWMARK_PPP_S2S: u32 = 16;
/// Packet mark for license restricted connections
pub const FWMARK_LICENSE_RESTRICTED: u32 = 32;

/// Routing table for gateway routes
pub const ROUTE_TABLE_GATEWAY: &str = "main";
/// Routing table for client (PPP side) routes
pub const ROUTE_TABLE_CLIENT: &str = "100";

/// L2TP port used by the remote end of a site-to-site client connection
pub const L2TP_PEER_PORT: u16 = 1701;
/// Local L2TP port for site-to-site client connections (distinct from the server's 1701)
pub const L2TP_CLIENT_PORT: u16 = 1702;
/// Outer UDP port used by NAT-T for site-to-site client connections
pub const NATT_PORT: u16 = 4500;

/// Runner operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RunMode {
    /// Network setup plus all daemons
    #[default]
    #[value(name = "FULL")]
    Full,
    /// Network setup only, no daemons started or stopped
    #[value(name = "NETWORK-ONLY")]
    NetworkOnly,
}

impl RunMode {
    /// Command line token, as accepted by `run --mode`
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "FULL",
            RunMode::NetworkOnly => "NETWORK-ONLY",
        }
    }
}

/// External programs managed by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonKind {
    /// RPC port mapper (needed by snmpd)
    Portmap,
    /// RADIUS server
    Freeradius,
    /// IKE keying daemon
    Pluto,
    /// PPP daemon (plugin host for openl2tp)
    Pppd,
    /// L2TP daemon
    Openl2tp,
    /// Address pool allocator
    Ippool,
    /// Dynamic DNS updater
    Ezipupdate,
    /// SNMP agent
    Snmpd,
    /// DHCP relay/server for PPP clients
    Dhcp,
    /// DHCP client for the public/private interfaces
    Dhclient,
}

impl DaemonKind {
    /// Short name used in logs and as the `pidof` fallback
    pub fn name(self) -> &'static str {
        match self {
            DaemonKind::Portmap => "portmap",
            DaemonKind::Freeradius => "freeradius",
            DaemonKind::Pluto => "pluto",
            DaemonKind::Pppd => "pppd",
            DaemonKind::Openl2tp => "openl2tpd",
            DaemonKind::Ippool => "ippoold",
            DaemonKind::Ezipupdate => "ez-ipupdate",
            DaemonKind::Snmpd => "snmpd",
            DaemonKind::Dhcp => "dhcp3-relay",
            DaemonKind::Dhclient => "dhclient3",
        }
    }
}

impl std::fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging
    #[serde(default)]
    pub general: GeneralConfig,
    /// Runtime file locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Interfaces and routes
    pub network: NetworkConfig,
    /// Client address pool
    pub ppp: PppConfig,
    /// Locally configured users
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// RADIUS servers to monitor
    #[serde(default)]
    pub radius: RadiusConfig,
    /// Local ports for redirected web traffic
    #[serde(default)]
    pub redirect: RedirectPorts,
    /// License limits
    #[serde(default)]
    pub license: LicenseConfig,
    /// IKE settings
    #[serde(default)]
    pub ipsec: IpsecConfig,
    /// Dynamic DNS updater, off when absent
    #[serde(default)]
    pub dyndns: Option<DynDnsConfig>,
    /// Per daemon overrides
    #[serde(default)]
    pub daemons: BTreeMap<DaemonKind, DaemonOverride>,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Monitor intervals and limits
    #[serde(default)]
    pub monitors: MonitorsConfig,
}

impl Config {
    /// Look up a configured user by name
    pub fn find_user(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Site-to-site users in configuration order
    pub fn site_to_site_users(&self) -> impl Iterator<Item = &UserConfig> {
        self.users.iter().filter(|u| u.site_to_site.is_some())
    }

    /// True when any interface takes its address from DHCP
    pub fn uses_dhcp(&self) -> bool {
        self.interfaces().any(|i| matches!(i.address, AddressConfig::Dhcp))
    }

    /// Public interface followed by the private one, if configured
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceConfig> {
        std::iter::once(&self.network.public).chain(self.network.private.as_ref())
    }
}

/// General settings
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// env_logger filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Runtime file locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory for leases and other runtime files
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Status document shared by the runner, the hooks and the CLI
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Lock serializing iptables updates
    #[serde(default = "default_firewall_lock")]
    pub firewall_lock: PathBuf,
    /// Per connection SA info files
    #[serde(default = "default_sainfo_dir")]
    pub sainfo_dir: PathBuf,
    /// Created by other tools to request a RADIUS daemon restart
    #[serde(default = "default_radius_restart_marker")]
    pub radius_restart_marker: PathBuf,
    /// Generated ez-ipupdate configuration
    #[serde(default = "default_ezipupdate_conf")]
    pub ezipupdate_conf: PathBuf,
    /// Generated IKE secrets file
    #[serde(default = "default_ipsec_secrets")]
    pub ipsec_secrets: PathBuf,
    /// pid of the running runner
    #[serde(default = "default_runner_pidfile")]
    pub runner_pidfile: PathBuf,
    /// Last announced runner state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Root of the per-device sysfs counters
    #[serde(default = "default_sysfs_net")]
    pub sysfs_net: PathBuf,
    /// Rewritten with the resolved DNS servers at network start
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            status_file: default_status_file(),
            firewall_lock: default_firewall_lock(),
            sainfo_dir: default_sainfo_dir(),
            radius_restart_marker: default_radius_restart_marker(),
            ezipupdate_conf: default_ezipupdate_conf(),
            ipsec_secrets: default_ipsec_secrets(),
            runner_pidfile: default_runner_pidfile(),
            state_file: default_state_file(),
            sysfs_net: default_sysfs_net(),
            resolv_conf: default_resolv_conf(),
        }
    }
}

impl PathsConfig {
    /// DHCP lease info file written by the dhclient hook for one interface
    pub fn dhcp_lease_file(&self, device: &str) -> PathBuf {
        self.runtime_dir.join(format!("dhcp-{}.lease", device))
    }
}

/// Interfaces, routes and related options
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Uplink interface
    pub public: InterfaceConfig,
    /// Optional LAN interface
    #[serde(default)]
    pub private: Option<InterfaceConfig>,
    /// Static DNS servers; when empty the DHCP supplied ones are used
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    /// Routes for gateway originated traffic
    #[serde(default)]
    pub gateway_routes: Vec<RouteConfig>,
    /// Routes for client traffic
    #[serde(default)]
    pub client_routes: Vec<RouteConfig>,
    /// Answer ARP for client addresses on the LAN
    #[serde(default)]
    pub proxy_arp: bool,
    /// Public uplink shaping in kbit/s; unset leaves the default qdisc
    #[serde(default)]
    pub uplink_rate_limit: Option<u32>,
    /// MTU set on the public interface
    #[serde(default = "default_mtu")]
    pub public_mtu: u32,
    /// Jump from every device chain to the empty `_ppp_cust` chains
    #[serde(default)]
    pub firewall_custom_chains: bool,
}

/// One physical interface
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// Kernel device name
    pub device: String,
    /// `"dhcp"` or a static `a.b.c.d/n`
    pub address: AddressConfig,
    /// Default router for static addresses
    #[serde(default)]
    pub default_gateway: Option<Ipv4Addr>,
}

/// Route from configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Destination subnet
    pub subnet: Ipv4Cidr,
    /// Next hop
    pub gateway: RouteGateway,
    /// Route metric
    #[serde(default = "default_route_metric")]
    pub metric: u32,
}

/// Where a configured route points
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RouteGateway {
    /// Default gateway of the interface the route is bound to
    NetworkDefault,
    /// Explicit router address
    Static { router: Ipv4Addr },
    /// Installed by the PPP up hook when this site-to-site user connects
    SiteToSite { user: String },
}

/// Addressing of the PPP clients
#[derive(Debug, Clone, Deserialize)]
pub struct PppConfig {
    /// Subnet of the tunnels; the last usable address is ours
    pub subnet: Ipv4Cidr,
    /// Pool handed to clients without a fixed address
    pub range: AddressRange,
    /// DNS servers pushed to clients
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    /// WINS servers pushed to clients
    #[serde(default)]
    pub wins_servers: Vec<Ipv4Addr>,
}

/// A locally authenticated user
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Login name
    pub username: String,
    /// Password for PPP authentication
    #[serde(default)]
    pub password: String,
    /// Address always given to this user
    #[serde(default)]
    pub fixed_ip: Option<Ipv4Addr>,
    /// Redirect all web traffic of the user
    #[serde(default)]
    pub force_web_redirect: bool,
    /// Redirect web traffic when a non-primary PSK was used
    #[serde(default)]
    pub force_non_primary_psk_web_redirect: bool,
    /// Present for site-to-site peers
    #[serde(default)]
    pub site_to_site: Option<SiteToSiteConfig>,
}

impl UserConfig {
    /// Site-to-site role, if this is a site-to-site user
    pub fn site_to_site_role(&self) -> Option<SiteToSiteRole> {
        self.site_to_site.as_ref().map(|s| s.role)
    }
}

/// Site-to-site settings of a user
#[derive(Debug, Clone, Deserialize)]
pub struct SiteToSiteConfig {
    /// Which side dials
    pub role: SiteToSiteRole,
    /// DNS name or address of the remote gateway (client role)
    #[serde(default)]
    pub destination: Option<String>,
    /// Pre-shared key for the client role IKE connection
    #[serde(default)]
    pub psk: Option<String>,
}

/// Site-to-site direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteToSiteRole {
    /// We dial out
    Client,
    /// The peer dials in
    Server,
}

/// RADIUS settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RadiusConfig {
    /// Servers checked by the server monitor
    #[serde(default)]
    pub servers: Vec<Ipv4Addr>,
}

/// Local ports that forced HTTP/HTTPS traffic is redirected to
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectPorts {
    /// Forced redirect, HTTP
    #[serde(default = "default_http_forced_port")]
    pub http_forced: u16,
    /// Forced redirect, HTTPS
    #[serde(default = "default_https_forced_port")]
    pub https_forced: u16,
    /// License redirect, HTTP
    #[serde(default = "default_http_license_port")]
    pub http_license: u16,
    /// License redirect, HTTPS
    #[serde(default = "default_https_license_port")]
    pub https_license: u16,
    /// Non-primary PSK redirect, HTTP
    #[serde(default = "default_http_non_primary_psk_port")]
    pub http_non_primary_psk: u16,
    /// Non-primary PSK redirect, HTTPS
    #[serde(default = "default_https_non_primary_psk_port")]
    pub https_non_primary_psk: u16,
}

impl Default for RedirectPorts {
    fn default() -> Self {
        Self {
            http_forced: default_http_forced_port(),
            https_forced: default_https_forced_port(),
            http_license: default_http_license_port(),
            https_license: default_https_license_port(),
            http_non_primary_psk: default_http_non_primary_psk_port(),
            https_non_primary_psk: default_https_non_primary_psk_port(),
        }
    }
}

/// License limits applied to new connections
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseConfig {
    /// License present and valid
    #[serde(default = "default_true")]
    pub valid: bool,
    /// Normal user connection quota
    #[serde(default = "default_max_normal_connections")]
    pub max_normal_connections: u32,
    /// Site-to-site connection quota
    #[serde(default = "default_max_site_to_site_connections")]
    pub max_site_to_site_connections: u32,
    /// Fraction of extra normal connections tolerated over the quota
    #[serde(default = "default_connection_leeway")]
    pub connection_leeway: f64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            valid: true,
            max_normal_connections: default_max_normal_connections(),
            max_site_to_site_connections: default_max_site_to_site_connections(),
            connection_leeway: default_connection_leeway(),
        }
    }
}

/// IKE daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct IpsecConfig {
    /// Generic pre-shared keys, primary first
    #[serde(default)]
    pub pre_shared_keys: Vec<String>,
    /// IKE SA lifetime in seconds
    #[serde(default = "default_sa_lifetime")]
    pub ike_lifetime: u64,
    /// IPsec SA lifetime in seconds
    #[serde(default = "default_sa_lifetime")]
    pub ipsec_lifetime: u64,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            pre_shared_keys: Vec::new(),
            ike_lifetime: default_sa_lifetime(),
            ipsec_lifetime: default_sa_lifetime(),
        }
    }
}

/// Dynamic DNS updater settings
#[derive(Debug, Clone, Deserialize)]
pub struct DynDnsConfig {
    /// ez-ipupdate service name
    pub service: String,
    /// Published host name
    pub hostname: String,
    /// `user:password` for the service
    #[serde(default)]
    pub credentials: Option<String>,
    /// Which address to publish
    #[serde(default)]
    pub address: DynDnsAddressSource,
    /// Address published with the static source
    #[serde(default)]
    pub static_address: Option<Ipv4Addr>,
}

/// Which address the dynamic DNS updater publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DynDnsAddressSource {
    /// Current address of the public interface
    #[default]
    Interface,
    /// `static_address`
    Static,
    /// NATted address seen by the management connection
    ManagementConnection,
}

/// Per daemon overrides of the built-in defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonOverride {
    /// Replaces the executable path
    #[serde(default)]
    pub command: Option<String>,
    /// Replaces the argument list
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Replaces the pidfile
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Configuration files written verbatim before start
    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
}

/// File written before a daemon starts
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Destination path
    pub path: PathBuf,
    /// Exact contents
    pub contents: String,
}

/// Timeouts in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Time allowed for each lease to arrive
    #[serde(default = "default_dhcp_acquire_timeout")]
    pub dhcp_acquire_timeout: u64,
    /// How often lease files are checked while waiting
    #[serde(default = "default_dhcp_poll_interval")]
    pub dhcp_poll_interval: u64,
    /// Lease attempts before giving up
    #[serde(default = "default_dhcp_try_count")]
    pub dhcp_try_count: u32,
    /// Main loop wake up interval
    #[serde(default = "default_mainloop_poll_interval")]
    pub mainloop_poll_interval: u64,
    /// How long SIGUSR1 is swallowed after startup completes
    #[serde(default = "default_sigusr1_drain")]
    pub sigusr1_drain: u64,
    /// Pause between asking daemons to stop and stopping them
    #[serde(default = "default_stop_settle")]
    pub stop_settle: u64,
    /// Wait after SIGTERM when nuking pppd
    #[serde(default = "default_nuke_wait")]
    pub nuke_soft_wait: u64,
    /// Wait after SIGKILL when nuking pppd
    #[serde(default = "default_nuke_wait")]
    pub nuke_hard_wait: u64,
    /// start-stop-daemon retry timeout
    #[serde(default = "default_daemon_stop_timeout")]
    pub daemon_stop_timeout: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dhcp_acquire_timeout: default_dhcp_acquire_timeout(),
            dhcp_poll_interval: default_dhcp_poll_interval(),
            dhcp_try_count: default_dhcp_try_count(),
            mainloop_poll_interval: default_mainloop_poll_interval(),
            sigusr1_drain: default_sigusr1_drain(),
            stop_settle: default_stop_settle(),
            nuke_soft_wait: default_nuke_wait(),
            nuke_hard_wait: default_nuke_wait(),
            daemon_stop_timeout: default_daemon_stop_timeout(),
        }
    }
}

/// Monitor intervals and router watchdog limits, in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorsConfig {
    /// Daemon liveness check
    #[serde(default = "default_process_interval")]
    pub process_interval: u64,
    /// Router ping
    #[serde(default = "default_router_interval")]
    pub router_interval: u64,
    /// RADIUS server ping
    #[serde(default = "default_router_interval")]
    pub server_interval: u64,
    /// Site-to-site tunnel check
    #[serde(default = "default_site_to_site_interval")]
    pub site_to_site_interval: u64,
    /// Dynamic DNS address check
    #[serde(default = "default_router_interval")]
    pub dyndns_interval: u64,
    /// License and traffic counter check
    #[serde(default = "default_process_interval")]
    pub license_interval: u64,
    /// Runner restarts after routers have been silent this long
    #[serde(default = "default_router_restart_limit")]
    pub router_restart_limit: u64,
    /// A warning is logged after routers have been silent this long
    #[serde(default = "default_router_warning_limit")]
    pub router_warning_limit: u64,
}

impl Default for MonitorsConfig {
    fn default() -> Self {
        Self {
            process_interval: default_process_interval(),
            router_interval: default_router_interval(),
            server_interval: default_router_interval(),
            site_to_site_interval: default_site_to_site_interval(),
            dyndns_interval: default_router_interval(),
            license_interval: default_process_interval(),
            router_restart_limit: default_router_restart_limit(),
            router_warning_limit: default_router_warning_limit(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw")
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/var/lib/l2tpgw/status.json")
}

fn default_firewall_lock() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/iptables.lock")
}

fn default_sainfo_dir() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/sainfo")
}

fn default_radius_restart_marker() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/restart-freeradius")
}

fn default_ezipupdate_conf() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/ez-ipupdate.conf")
}

fn default_ipsec_secrets() -> PathBuf {
    PathBuf::from("/etc/ipsec.secrets")
}

fn default_runner_pidfile() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/l2tpgw-runner.pid")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/run/l2tpgw/state")
}

fn default_sysfs_net() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

fn default_mtu() -> u32 {
    1500
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_route_metric() -> u32 {
    0
}

fn default_http_forced_port() -> u16 {
    10080
}

fn default_https_forced_port() -> u16 {
    10443
}

fn default_http_license_port() -> u16 {
    10081
}

fn default_https_license_port() -> u16 {
    10444
}

fn default_http_non_primary_psk_port() -> u16 {
    10082
}

fn default_https_non_primary_psk_port() -> u16 {
    10445
}

fn default_max_normal_connections() -> u32 {
    100
}

fn default_max_site_to_site_connections() -> u32 {
    10
}

fn default_connection_leeway() -> f64 {
    0.02
}

fn default_sa_lifetime() -> u64 {
    8 * 60 * 60
}

fn default_dhcp_acquire_timeout() -> u64 {
    60
}

fn default_dhcp_poll_interval() -> u64 {
    10
}

fn default_dhcp_try_count() -> u32 {
    5
}

fn default_mainloop_poll_interval() -> u64 {
    60
}

fn default_sigusr1_drain() -> u64 {
    2
}

fn default_stop_settle() -> u64 {
    2
}

fn default_nuke_wait() -> u64 {
    15
}

fn default_daemon_stop_timeout() -> u64 {
    10
}

fn default_process_interval() -> u64 {
    60
}

fn default_router_interval() -> u64 {
    300
}

fn default_site_to_site_interval() -> u64 {
    150
}

fn default_router_restart_limit() -> u64 {
    15 * 60
}

fn default_router_warning_limit() -> u64 {
    5 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_tokens() {
        assert_eq!(RunMode::Full.as_str(), "FULL");
        assert_eq!(RunMode::NetworkOnly.as_str(), "NETWORK-ONLY");
        assert_eq!(RunMode::default(), RunMode::Full);
    }

    #[test]
    fn test_route_gateway_variants() {
        #[derive(Deserialize)]
        struct Wrapper {
            routes: Vec<RouteConfig>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[routes]]
            subnet = "0.0.0.0/0"
            gateway = { kind = "network-default" }

            [[routes]]
            subnet = "10.1.0.0/16"
            gateway = { kind = "static", router = "10.0.0.1" }
            metric = 5

            [[routes]]
            subnet = "172.16.0.0/24"
            gateway = { kind = "site-to-site", user = "branch" }
            "#,
        )
        .unwrap();

        assert_eq!(parsed.routes[0].gateway, RouteGateway::NetworkDefault);
        assert_eq!(
            parsed.routes[1].gateway,
            RouteGateway::Static {
                router: Ipv4Addr::new(10, 0, 0, 1)
            }
        );
        assert_eq!(parsed.routes[1].metric, 5);
        assert_eq!(
            parsed.routes[2].gateway,
            RouteGateway::SiteToSite {
                user: "branch".to_string()
            }
        );
    }

    #[test]
    fn test_daemon_overrides_keyed_by_kind() {
        #[derive(Deserialize)]
        struct Wrapper {
            daemons: BTreeMap<DaemonKind, DaemonOverride>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [daemons.pluto]
            command = "/usr/local/sbin/pluto"

            [daemons.ezipupdate]
            pidfile = "/tmp/ez.pid"
            "#,
        )
        .unwrap();

        assert_eq!(
            parsed.daemons[&DaemonKind::Pluto].command.as_deref(),
            Some("/usr/local/sbin/pluto")
        );
        assert!(parsed.daemons.contains_key(&DaemonKind::Ezipupdate));
    }
}
