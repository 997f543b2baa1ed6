// Host network setup

//! Interface, route and ARP handling for the runner.
//!
//! Start-up is split in two stages around DHCP: [`Network::prepare`] checks
//! that every configured device exists and brings it up without addresses,
//! then [`resolve`] combines the configuration with any DHCP leases and
//! [`Network::bring_up`] assigns addresses, routes and the base firewall.
//! The `down_*` helpers undo the same steps on stop and never fail hard.

use crate::config::{AddressConfig, Ipv4Cidr};
use crate::error::RunnerError;
use crate::exec::{run_checked, run_logged, CommandSpec, Executor, IP, SYSCTL};
use crate::firewall::{BaseRules, Firewall};
use crate::status::{GatewayStatus, InterfaceStatus};
use crate::types::{
    Config, InterfaceConfig, RouteConfig, RouteGateway, FWMARK_PPP, FWMARK_PPP_S2S, ROUTE_TABLE_CLIENT,
    ROUTE_TABLE_GATEWAY,
};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

/// Gratuitous ARP sender
pub const ARPING: &str = "/usr/bin/arping";
const TC: &str = "/sbin/tc";
const CONNTRACK: &str = "/usr/sbin/conntrack";
const NETWORKING_INIT: &str = "/etc/init.d/networking";

/// Marks routed through the client table
const CLIENT_TABLE_MARKS: [u32; 2] = [FWMARK_PPP, FWMARK_PPP_S2S];

/// Lease data written by the DHCP client hook, one file per device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Leased address and prefix
    pub address: Ipv4Cidr,
    /// Routers from the lease, preferred first
    pub routers: Vec<Ipv4Addr>,
    /// DNS servers from the lease
    pub dns_servers: Vec<Ipv4Addr>,
}

impl DhcpLease {
    /// Parse `KEY=VALUE` lines (ADDRESS, PREFIX, ROUTERS, DNS)
    pub fn parse(text: &str) -> Result<Self> {
        let mut address = None;
        let mut prefix = None;
        let mut routers = Vec::new();
        let mut dns_servers = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "ADDRESS" => address = Some(value.parse::<Ipv4Addr>().context("Invalid lease ADDRESS")?),
                "PREFIX" => prefix = Some(value.parse::<u8>().context("Invalid lease PREFIX")?),
                "ROUTERS" => routers = parse_addr_list(value).context("Invalid lease ROUTERS")?,
                "DNS" => dns_servers = parse_addr_list(value).context("Invalid lease DNS")?,
                _ => {}
            }
        }

        let address = address.context("Lease has no ADDRESS")?;
        let prefix = prefix.context("Lease has no PREFIX")?;
        anyhow::ensure!(prefix <= 32, "Lease PREFIX out of range: {}", prefix);
        Ok(Self {
            address: Ipv4Cidr::new(address, prefix),
            routers,
            dns_servers,
        })
    }

    /// Inverse of [`DhcpLease::parse`]
    pub fn render(&self) -> String {
        format!(
            "ADDRESS={}\nPREFIX={}\nROUTERS={}\nDNS={}\n",
            self.address.addr,
            self.address.prefix,
            join_addrs(&self.routers),
            join_addrs(&self.dns_servers)
        )
    }

    /// `None` when the lease file does not exist yet
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("Failed to parse lease file {}", path.display()))
                .map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Write the lease file, creating the parent directory
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create lease directory")?;
        }
        fs::write(path, self.render()).with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn parse_addr_list(value: &str) -> Result<Vec<Ipv4Addr>> {
    value
        .split([' ', ','])
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Ipv4Addr>().with_context(|| format!("Invalid address: {}", s)))
        .collect()
}

fn join_addrs(addrs: &[Ipv4Addr]) -> String {
    addrs.iter().map(Ipv4Addr::to_string).collect::<Vec<_>>().join(" ")
}

/// Leases keyed by device name
pub type Leases = BTreeMap<String, DhcpLease>;

/// Read the lease of every DHCP configured interface.
///
/// Returns `None` until all of them have a lease file.
pub fn read_leases(cfg: &Config) -> Result<Option<Leases>> {
    let mut leases = Leases::new();
    for iface in cfg.interfaces().filter(|i| i.address == AddressConfig::Dhcp) {
        match DhcpLease::read(&cfg.paths.dhcp_lease_file(&iface.device))? {
            Some(lease) => {
                leases.insert(iface.device.clone(), lease);
            }
            None => {
                log::debug!("no lease for {} yet", iface.device);
                return Ok(None);
            }
        }
    }
    Ok(Some(leases))
}

/// Interface with its final address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterface {
    /// Kernel device name
    pub device: String,
    /// Address and prefix in use
    pub address: Ipv4Cidr,
    /// Default router on this interface
    pub default_gateway: Option<Ipv4Addr>,
}

impl ResolvedInterface {
    /// Snapshot for the status document
    pub fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            device: self.device.clone(),
            address: self.address.addr,
            prefix: self.address.prefix,
            default_gateway: self.default_gateway,
        }
    }
}

/// Route bound to a concrete router and device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Destination subnet
    pub subnet: Ipv4Cidr,
    /// Next hop
    pub router: Ipv4Addr,
    /// Outgoing device
    pub device: String,
    /// Route metric
    pub metric: u32,
}

/// Network configuration after DHCP results have been merged in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetwork {
    /// Uplink
    pub public: ResolvedInterface,
    /// LAN side, if any
    pub private: Option<ResolvedInterface>,
    /// DNS servers clients are given
    pub dns_servers: Vec<Ipv4Addr>,
    /// Routes for gateway originated traffic
    pub gateway_routes: Vec<ResolvedRoute>,
    /// Routes for client traffic, in the client table
    pub client_routes: Vec<ResolvedRoute>,
}

impl ResolvedNetwork {
    /// Public interface followed by the private one
    pub fn interfaces(&self) -> impl Iterator<Item = &ResolvedInterface> {
        std::iter::once(&self.public).chain(self.private.as_ref())
    }

    /// Distinct routers per device, from both route tables
    pub fn routers(&self) -> BTreeMap<String, BTreeSet<Ipv4Addr>> {
        let mut out: BTreeMap<String, BTreeSet<Ipv4Addr>> = BTreeMap::new();
        for route in self.gateway_routes.iter().chain(&self.client_routes) {
            out.entry(route.device.clone()).or_default().insert(route.router);
        }
        out
    }

    /// Device answering ARP for the PPP clients
    pub fn proxy_arp_interface(&self) -> &ResolvedInterface {
        self.private.as_ref().unwrap_or(&self.public)
    }

    /// The gateway's own addresses
    pub fn own_addresses(&self) -> Vec<Ipv4Addr> {
        self.interfaces().map(|i| i.address.addr).collect()
    }

    /// Record the interface addresses before they are activated
    pub fn publish(&self, status: &mut GatewayStatus) {
        status.public_interface = Some(self.public.status());
        status.private_interface = self.private.as_ref().map(ResolvedInterface::status);
    }
}

/// Combine configuration and DHCP leases into the final network setup
pub fn resolve(cfg: &Config, leases: &Leases) -> Result<ResolvedNetwork> {
    let resolve_iface = |iface: &InterfaceConfig| -> Result<ResolvedInterface> {
        let lease = leases.get(&iface.device);
        let address = match iface.address {
            AddressConfig::Static(cidr) => cidr,
            AddressConfig::Dhcp => lease
                .map(|l| l.address)
                .with_context(|| format!("No DHCP lease for {}", iface.device))?,
        };
        let default_gateway = iface
            .default_gateway
            .or_else(|| lease.and_then(|l| l.routers.first().copied()));
        Ok(ResolvedInterface {
            device: iface.device.clone(),
            address,
            default_gateway,
        })
    };

    let public = resolve_iface(&cfg.network.public)?;
    let private = cfg.network.private.as_ref().map(resolve_iface).transpose()?;

    let mut dns_servers = cfg.network.dns_servers.clone();
    if dns_servers.is_empty() {
        for lease in cfg.interfaces().filter_map(|i| leases.get(&i.device)) {
            for dns in &lease.dns_servers {
                if !dns_servers.contains(dns) {
                    dns_servers.push(*dns);
                }
            }
        }
    }

    let ifaces: Vec<&ResolvedInterface> = std::iter::once(&public).chain(private.as_ref()).collect();
    let gateway_routes = resolve_routes(&cfg.network.gateway_routes, &ifaces)?;
    let client_routes = resolve_routes(&cfg.network.client_routes, &ifaces)?;

    Ok(ResolvedNetwork {
        public,
        private,
        dns_servers,
        gateway_routes,
        client_routes,
    })
}

fn resolve_routes(routes: &[RouteConfig], ifaces: &[&ResolvedInterface]) -> Result<Vec<ResolvedRoute>> {
    let mut out = Vec::new();
    for route in routes {
        let router = match &route.gateway {
            RouteGateway::NetworkDefault => ifaces
                .iter()
                .find_map(|i| i.default_gateway)
                .with_context(|| format!("Route {} needs a default gateway, none known", route.subnet))?,
            RouteGateway::Static { router } => *router,
            // Installed by the PPP up hook
            RouteGateway::SiteToSite { .. } => continue,
        };

        if ifaces
            .iter()
            .any(|i| i.address.subnet_string() == route.subnet.subnet_string())
        {
            log::warn!("route {} overlaps an interface subnet, skipped", route.subnet);
            continue;
        }

        let device = match ifaces.iter().find(|i| i.address.contains(router)) {
            Some(iface) => iface.device.clone(),
            None => {
                let iface = ifaces
                    .iter()
                    .find(|i| i.default_gateway == Some(router))
                    .unwrap_or(&ifaces[0]);
                log::warn!(
                    "router {} for {} is not on a local subnet, using {}",
                    router,
                    route.subnet,
                    iface.device
                );
                iface.device.clone()
            }
        };

        out.push(ResolvedRoute {
            subnet: route.subnet,
            router,
            device,
            metric: route.metric,
        });
    }
    Ok(out)
}

fn sysctl(setting: String) -> CommandSpec {
    CommandSpec::new(SYSCTL).arg("-w").arg(setting)
}

fn ip<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(IP).args(args)
}

/// Host network operations used by the runner
pub struct Network {
    cfg: Arc<Config>,
    exec: Arc<dyn Executor>,
}

impl Network {
    /// Handle over the configured interfaces
    pub fn new(cfg: Arc<Config>, exec: Arc<dyn Executor>) -> Self {
        Self { cfg, exec }
    }

    /// Toggle promiscuous mode on and off; some virtual NICs stop
    /// receiving until this is done
    pub async fn promisc_flip(&self, device: &str) {
        for mode in ["on", "off"] {
            run_logged(self.exec.as_ref(), ip(["link", "set", device, "promisc", mode]), true).await;
        }
    }

    /// Stage 1: existence check and bare interface preparation
    pub async fn prepare(&self) -> Result<()> {
        for iface in self.cfg.interfaces() {
            let dev = iface.device.as_str();
            self.promisc_flip(dev).await;

            let output = self
                .exec
                .run(ip(["link", "show", dev]))
                .await
                .context("Failed to query interfaces")?;
            if !output.success() {
                log::error!("interface {} does not exist", dev);
                return Err(RunnerError::StartFailedInterface(dev.to_string()).into());
            }
        }

        run_checked(self.exec.as_ref(), sysctl("net.ipv4.conf.all.rp_filter=0".to_string())).await?;
        for iface in self.cfg.interfaces() {
            let dev = iface.device.as_str();
            run_checked(self.exec.as_ref(), ip(["addr", "flush", "dev", dev])).await?;
            run_checked(self.exec.as_ref(), ip(["link", "set", dev, "up"])).await?;
            run_checked(self.exec.as_ref(), sysctl(format!("net.ipv4.conf.{}.rp_filter=0", dev))).await?;
        }
        Ok(())
    }

    /// Stage 2: base firewall, addresses, proxy ARP, DNS, routes, ARP probes and QoS
    pub async fn bring_up(&self, net: &ResolvedNetwork, firewall: &Firewall) -> Result<()> {
        firewall
            .up(&BaseRules {
                public_device: net.public.device.clone(),
                private_device: net.private.as_ref().map(|p| p.device.clone()),
                ppp_subnet: self.cfg.ppp.subnet,
            })
            .await?;

        for iface in net.interfaces() {
            let dev = iface.device.as_str();
            log::info!("setting address {} on {}", iface.address, dev);
            run_checked(self.exec.as_ref(), ip(["addr", "flush", "dev", dev])).await?;
            run_checked(
                self.exec.as_ref(),
                ip(["addr".to_string(), "add".to_string(), iface.address.to_string(), "dev".to_string(), dev.to_string()]),
            )
            .await?;
        }

        if self.cfg.network.proxy_arp {
            let dev = &net.proxy_arp_interface().device;
            run_checked(self.exec.as_ref(), sysctl(format!("net.ipv4.conf.{}.proxy_arp=1", dev))).await?;
        }
        for iface in net.interfaces() {
            self.promisc_flip(&iface.device).await;
        }

        self.write_resolv_conf(&net.dns_servers)?;
        self.up_routes(net).await?;
        self.flush_route_cache(false).await;
        self.arping_routers(net).await;
        self.send_gratuitous_arps(net).await;
        self.up_qos(net).await
    }

    fn write_resolv_conf(&self, servers: &[Ipv4Addr]) -> Result<()> {
        if servers.is_empty() {
            log::warn!("no DNS servers known, leaving resolver configuration alone");
            return Ok(());
        }
        let contents: String = servers.iter().map(|s| format!("nameserver {}\n", s)).collect();
        let path = &self.cfg.paths.resolv_conf;
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn up_routes(&self, net: &ResolvedNetwork) -> Result<()> {
        // Directly connected subnets are visible to clients too
        for iface in net.interfaces() {
            run_checked(
                self.exec.as_ref(),
                ip([
                    "route".to_string(),
                    "add".to_string(),
                    iface.address.subnet_string(),
                    "table".to_string(),
                    ROUTE_TABLE_CLIENT.to_string(),
                    "dev".to_string(),
                    iface.device.clone(),
                ]),
            )
            .await?;
        }

        let tables = net
            .gateway_routes
            .iter()
            .map(|r| (r, ROUTE_TABLE_GATEWAY))
            .chain(net.client_routes.iter().map(|r| (r, ROUTE_TABLE_CLIENT)));
        for (route, table) in tables {
            log::debug!("route {} via {} dev {} table {}", route.subnet, route.router, route.device, table);
            run_checked(
                self.exec.as_ref(),
                ip([
                    "route".to_string(),
                    "add".to_string(),
                    route.subnet.subnet_string(),
                    "table".to_string(),
                    table.to_string(),
                    "via".to_string(),
                    route.router.to_string(),
                    "dev".to_string(),
                    route.device.clone(),
                    "metric".to_string(),
                    route.metric.to_string(),
                    "onlink".to_string(),
                ]),
            )
            .await?;
        }

        for mark in CLIENT_TABLE_MARKS {
            run_checked(
                self.exec.as_ref(),
                ip([
                    "rule".to_string(),
                    "add".to_string(),
                    "fwmark".to_string(),
                    format!("{}/{}", mark, mark),
                    "table".to_string(),
                    ROUTE_TABLE_CLIENT.to_string(),
                ]),
            )
            .await?;
        }
        Ok(())
    }

    /// Flush the kernel route cache
    pub async fn flush_route_cache(&self, silent: bool) {
        run_logged(self.exec.as_ref(), ip(["route", "flush", "cache"]), silent).await;
    }

    /// Send ARP requests to every router so neighbour entries exist before
    /// the first client connects; failures are only logged
    async fn arping_routers(&self, net: &ResolvedNetwork) {
        for (device, routers) in net.routers() {
            let Some(iface) = net.interfaces().find(|i| i.device == device) else {
                continue;
            };
            for router in routers {
                if !arp_probe(self.exec.as_ref(), &iface.device, iface.address.addr, router).await {
                    log::warn!("router {} did not answer ARP on {}", router, device);
                }
            }
        }
    }

    async fn send_gratuitous_arps(&self, net: &ResolvedNetwork) {
        for iface in net.interfaces() {
            let addr = iface.address.addr.to_string();
            for mode in ["-U", "-A"] {
                run_logged(
                    self.exec.as_ref(),
                    CommandSpec::new(ARPING).args([mode, "-c", "1", "-I", iface.device.as_str(), "-s", addr.as_str(), addr.as_str()]),
                    true,
                )
                .await;
            }
        }
    }

    async fn up_qos(&self, net: &ResolvedNetwork) -> Result<()> {
        let Some(rate) = self.cfg.network.uplink_rate_limit else {
            return Ok(());
        };
        let dev = net.public.device.as_str();
        let rate = format!("{}kbit", rate);
        let mtu = self.cfg.network.public_mtu.to_string();

        run_logged(self.exec.as_ref(), CommandSpec::new(TC).args(["qdisc", "del", "dev", dev, "root"]), true).await;
        run_checked(
            self.exec.as_ref(),
            CommandSpec::new(TC).args(["qdisc", "add", "dev", dev, "root", "handle", "1:", "htb", "default", "1"]),
        )
        .await?;
        run_checked(
            self.exec.as_ref(),
            CommandSpec::new(TC).args([
                "class", "add", "dev", dev, "parent", "1:", "classid", "1:1", "htb", "rate", rate.as_str(), "quantum", mtu.as_str(),
            ]),
        )
        .await?;
        run_checked(
            self.exec.as_ref(),
            CommandSpec::new(TC).args(["qdisc", "add", "dev", dev, "parent", "1:1", "handle", "10:", "sfq", "perturb", "30"]),
        )
        .await?;
        Ok(())
    }

    /// Remove the uplink shaping qdisc
    pub async fn down_qos(&self, silent: bool) {
        for iface in self.cfg.interfaces() {
            run_logged(
                self.exec.as_ref(),
                CommandSpec::new(TC).args(["qdisc", "del", "dev", iface.device.as_str(), "root"]),
                silent,
            )
            .await;
        }
    }

    /// Toggle `net.ipv4.ip_forward`
    pub async fn set_forwarding(&self, enabled: bool) -> Result<()> {
        log::debug!("ip forwarding {}", if enabled { "on" } else { "off" });
        run_checked(
            self.exec.as_ref(),
            sysctl(format!("net.ipv4.ip_forward={}", u8::from(enabled))),
        )
        .await?;
        Ok(())
    }

    /// Disable proxy ARP on every interface
    pub async fn down_proxy_arp(&self, silent: bool) {
        for iface in self.cfg.interfaces() {
            run_logged(
                self.exec.as_ref(),
                sysctl(format!("net.ipv4.conf.{}.proxy_arp=0", iface.device)),
                silent,
            )
            .await;
        }
    }

    /// Drop the client fwmark rules and flush both routing tables
    pub async fn down_routes(&self, silent: bool) {
        for mark in CLIENT_TABLE_MARKS {
            run_logged(
                self.exec.as_ref(),
                ip([
                    "rule".to_string(),
                    "del".to_string(),
                    "fwmark".to_string(),
                    format!("{}/{}", mark, mark),
                    "table".to_string(),
                    ROUTE_TABLE_CLIENT.to_string(),
                ]),
                silent,
            )
            .await;
        }
        for table in [ROUTE_TABLE_CLIENT, ROUTE_TABLE_GATEWAY] {
            run_logged(self.exec.as_ref(), ip(["route", "flush", "table", table]), silent).await;
        }
    }

    /// Flush addresses and take interfaces down
    pub async fn down_interfaces(&self, silent: bool) {
        for iface in self.cfg.interfaces() {
            let dev = iface.device.as_str();
            run_logged(self.exec.as_ref(), ip(["addr", "flush", "dev", dev]), silent).await;
            run_logged(self.exec.as_ref(), ip(["link", "set", dev, "down"]), silent).await;
        }
    }

    /// Drop all connection tracking entries
    pub async fn flush_conntrack(&self, silent: bool) {
        run_logged(self.exec.as_ref(), CommandSpec::new(CONNTRACK).arg("-F"), silent).await;
    }

    /// Hand the interfaces back to the distribution's own configuration
    pub async fn restart_distro_networking(&self, silent: bool) {
        for action in ["stop", "start"] {
            run_logged(self.exec.as_ref(), CommandSpec::new(NETWORKING_INIT).arg(action), silent).await;
        }
    }

    /// Create the per-connection SA info directory
    pub fn create_sainfo_dir(&self) -> Result<()> {
        let dir = &self.cfg.paths.sainfo_dir;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
    }

    /// Remove the SA info directory and its contents
    pub fn remove_sainfo_dir(&self) {
        let dir = &self.cfg.paths.sainfo_dir;
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

/// Link layer probe of `target` from `source` on `device`; true when it answered
pub async fn arp_probe(exec: &dyn Executor, device: &str, source: Ipv4Addr, target: Ipv4Addr) -> bool {
    let cmd = CommandSpec::new(ARPING).args([
        "-f".to_string(),
        "-c".to_string(),
        "3".to_string(),
        "-w".to_string(),
        "1".to_string(),
        "-s".to_string(),
        source.to_string(),
        "-I".to_string(),
        device.to_string(),
        target.to_string(),
    ]);
    match exec.run(cmd).await {
        Ok(out) => out.success(),
        Err(e) => {
            log::warn!("arping failed to run: {:#}", e);
            false
        }
    }
}
