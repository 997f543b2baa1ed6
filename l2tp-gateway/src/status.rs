// Runtime status model

//! Live status records shared between the runner, the PPP hooks and the
//! monitors. Every attribute that may be absent is an `Option`, so readers
//! never need a separate existence check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Upper bound on retired devices kept for history
pub const MAX_RETIRED_DEVICES: usize = 500;

/// SPI value recorded when the SA table gives no answer
pub const DEFAULT_SPI: &str = "0x00000000";

/// Prefix of every state announcement on the runner's stdout
pub const STATE_PREFIX: &str = "*** STATE:";

/// Runner main state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    /// Bringing up the network and daemons
    Starting,
    /// Serving connections
    Running,
    /// Tearing everything down
    Stopping,
    /// Finished, about to exit
    Stopped,
}

impl RunnerState {
    /// Token used in state lines and the state file
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerState::Starting => "STARTING",
            RunnerState::Running => "RUNNING",
            RunnerState::Stopping => "STOPPING",
            RunnerState::Stopped => "STOPPED",
        }
    }

    /// Inverse of [`RunnerState::as_str`]
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "STARTING" => Some(RunnerState::Starting),
            "RUNNING" => Some(RunnerState::Running),
            "STOPPING" => Some(RunnerState::Stopping),
            "STOPPED" => Some(RunnerState::Stopped),
            _ => None,
        }
    }
}

/// Sub-state, only meaningful while starting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingSubstate {
    /// Validating configuration and cleaning up leftovers
    Preparing,
    /// Waiting for dhclient to deliver leases
    WaitingForDhcp,
    /// Configuring interfaces, routes and firewall
    StartingNetwork,
    /// Launching the external daemons
    StartingDaemons,
}

impl StartingSubstate {
    /// Token used in state lines and the state file
    pub fn as_str(self) -> &'static str {
        match self {
            StartingSubstate::Preparing => "PREPARING",
            StartingSubstate::WaitingForDhcp => "WAITING_FOR_DHCP",
            StartingSubstate::StartingNetwork => "STARTING_NETWORK",
            StartingSubstate::StartingDaemons => "STARTING_DAEMONS",
        }
    }

    /// Inverse of [`StartingSubstate::as_str`]
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "PREPARING" => Some(StartingSubstate::Preparing),
            "WAITING_FOR_DHCP" => Some(StartingSubstate::WaitingForDhcp),
            "STARTING_NETWORK" => Some(StartingSubstate::StartingNetwork),
            "STARTING_DAEMONS" => Some(StartingSubstate::StartingDaemons),
            _ => None,
        }
    }
}

/// Format the protocol line for a state transition
pub fn state_line(state: RunnerState, substate: Option<StartingSubstate>) -> String {
    match substate {
        Some(sub) => format!("{} {} {}", STATE_PREFIX, state.as_str(), sub.as_str()),
        None => format!("{} {}", STATE_PREFIX, state.as_str()),
    }
}

/// Parse a `*** STATE: MAIN [SUB]` line; anything else yields `None`
pub fn parse_state_line(line: &str) -> Option<(RunnerState, Option<StartingSubstate>)> {
    let rest = line.trim_end().strip_prefix(STATE_PREFIX)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut tokens = rest.split_whitespace();
    let state = RunnerState::parse(tokens.next()?)?;
    let substate = match tokens.next() {
        Some(tok) => Some(StartingSubstate::parse(tok)?),
        None => None,
    };
    if tokens.next().is_some() {
        return None;
    }
    Some((state, substate))
}

/// Role of the peer on a PPP device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Remote access client
    NormalUser,
    /// We dialled out to another gateway
    SiteToSiteClient,
    /// Another gateway dialled in to us
    SiteToSiteServer,
}

impl ConnectionType {
    /// Either site-to-site role
    pub fn is_site_to_site(self) -> bool {
        !matches!(self, ConnectionType::NormalUser)
    }
}

/// Why web traffic of a connection is redirected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardReason {
    /// Forced for the user in configuration
    UiForced,
    /// Normal connection quota used up
    LicenseExceeded,
    /// No valid license
    LicenseInvalid,
    /// License does not cover this connection type
    LicenseProhibits,
}

/// How ESP reaches us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncapsulationMode {
    /// Inside UDP 4500, behind NAT
    EspOverUdp,
    /// Bare ESP
    EspPlain,
}

/// One live or recently terminated PPP tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PppDevice {
    /// Unique record id, never reused
    pub id: u64,
    /// pid of the serving pppd
    pub pppd_pid: i32,
    /// Kernel device name, once known
    pub device_name: Option<String>,
    /// Authenticated user name
    pub username: Option<String>,
    /// Peer role
    pub connection_type: ConnectionType,
    /// Restricted filter applied
    pub restricted: bool,
    /// Web traffic redirected locally
    pub web_forwarded: bool,
    /// Reason for the redirect
    pub forward_reason: Option<ForwardReason>,
    /// Source address filtering applied
    pub spoof_prevention: bool,
    /// Authenticated against local users rather than RADIUS
    pub locally_authenticated: bool,
    /// Our end of the tunnel
    pub local_address: Ipv4Addr,
    /// Client end of the tunnel
    pub remote_address: Ipv4Addr,
    /// Public address of the remote endpoint
    pub outer_address: Ipv4Addr,
    /// Public source port of the remote endpoint
    pub outer_port: u16,
    /// Inbound SPI, hex
    pub spi_rx: String,
    /// Outbound SPI, hex
    pub spi_tx: String,
    /// Index of the pre-shared key used
    pub psk_index: u32,
    /// ESP encapsulation
    pub encapsulation: EncapsulationMode,
    /// When `ip-pre-up` ran
    pub start_time: DateTime<Utc>,
    /// When the device went away
    pub stop_time: Option<DateTime<Utc>>,
    /// Received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
    /// Received packets
    pub rx_packets: u64,
    /// Transmitted packets
    pub tx_packets: u64,
    /// Receive rate over the last interval, bytes/s
    pub rx_rate_current: f64,
    /// Transmit rate over the last interval, bytes/s
    pub tx_rate_current: f64,
    /// Highest receive rate seen
    pub rx_rate_maximum: f64,
    /// Highest transmit rate seen
    pub tx_rate_maximum: f64,
    /// When the counters were last read
    pub counters_updated: Option<DateTime<Utc>>,
    /// Free form notes, the hook parameters by default
    pub comment: String,
}

/// Snapshot of one interface as resolved at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    /// Kernel device name
    pub device: String,
    /// Address in use
    pub address: Ipv4Addr,
    /// Prefix length
    pub prefix: u8,
    /// Default router, if any
    pub default_gateway: Option<Ipv4Addr>,
}

/// Reachability of one router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStatus {
    /// Router address
    pub address: Ipv4Addr,
    /// Device it is reached through
    pub device: String,
    /// Result of the last ping, `None` before the first
    pub healthy: Option<bool>,
    /// Last time it answered
    pub last_success: Option<DateTime<Utc>>,
}

/// Reachability of one RADIUS server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Server address
    pub address: Ipv4Addr,
    /// Result of the last ping, `None` before the first
    pub healthy: Option<bool>,
}

/// Health of one configured site-to-site user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteToSiteStatus {
    /// Configured user name
    pub username: String,
    /// Tunnel up and verified
    pub healthy: Option<bool>,
    /// Peer came up with an unexpected address
    pub address_check_failure: bool,
    /// Dropped for license reasons
    pub license_restricted_failure: bool,
    /// Address the peer was given
    pub remote_address: Option<Ipv4Addr>,
}

/// Root of the persisted status document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Current runner state
    pub state: Option<RunnerState>,
    /// Starting sub-state
    pub substate: Option<StartingSubstate>,
    /// When the current incarnation started
    pub start_time: Option<DateTime<Utc>>,
    /// When it stopped
    pub stop_time: Option<DateTime<Utc>>,
    /// When `state` last changed
    pub last_state_update: Option<DateTime<Utc>>,
    /// When the main loop last polled
    pub last_poll_time: Option<DateTime<Utc>>,
    /// Uplink as configured at start
    pub public_interface: Option<InterfaceStatus>,
    /// LAN interface as configured at start
    pub private_interface: Option<InterfaceStatus>,
    /// Daemon liveness
    pub process_health_check: Option<bool>,
    /// At least one router answers
    pub router_health_check: Option<bool>,
    /// RADIUS servers answer
    pub server_health_check: Option<bool>,
    /// Site-to-site tunnels are up
    pub site_to_site_health_check: Option<bool>,
    /// Written by the management connection
    pub management_natted_address: Option<Ipv4Addr>,
    /// Per router results
    #[serde(default)]
    pub router_statuses: Vec<RouterStatus>,
    /// Per RADIUS server results
    #[serde(default)]
    pub server_statuses: Vec<ServerStatus>,
    /// Per site-to-site user results
    #[serde(default)]
    pub site_to_site_statuses: Vec<SiteToSiteStatus>,
    /// Live PPP devices
    #[serde(default)]
    pub ppp_devices: Vec<PppDevice>,
    /// Recently terminated PPP devices, oldest first
    #[serde(default)]
    pub retired_ppp_devices: Vec<PppDevice>,
    /// Last id handed out by [`GatewayStatus::allocate_device_id`]
    #[serde(default)]
    pub next_device_id: u64,
}

impl GatewayStatus {
    /// Reset everything that belongs to one runner incarnation
    pub fn clear_runtime(&mut self) {
        let keep_retired = std::mem::take(&mut self.retired_ppp_devices);
        let keep_devices = std::mem::take(&mut self.ppp_devices);
        let next_id = self.next_device_id;
        let natted = self.management_natted_address;
        *self = GatewayStatus::default();
        self.ppp_devices = keep_devices;
        self.retired_ppp_devices = keep_retired;
        self.next_device_id = next_id;
        self.management_natted_address = natted;
    }

    /// Next unused device record id
    pub fn allocate_device_id(&mut self) -> u64 {
        self.next_device_id += 1;
        self.next_device_id
    }

    /// Active devices with the given kernel name
    pub fn active_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PppDevice> {
        self.ppp_devices
            .iter()
            .filter(move |d| d.device_name.as_deref() == Some(name))
    }

    /// First active device of a user
    pub fn active_by_username(&self, username: &str) -> Option<&PppDevice> {
        self.ppp_devices
            .iter()
            .find(|d| d.username.as_deref() == Some(username))
    }

    /// Move devices matching `pred` from the active set into the retired set,
    /// stamping the stop time if missing. Returns the retired records.
    pub fn retire_where<F>(&mut self, now: DateTime<Utc>, mut pred: F) -> Vec<PppDevice>
    where
        F: FnMut(&PppDevice) -> bool,
    {
        let (retire, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.ppp_devices).into_iter().partition(|d| pred(d));
        self.ppp_devices = keep;

        let mut retired = Vec::with_capacity(retire.len());
        for mut dev in retire {
            if dev.stop_time.is_none() {
                dev.stop_time = Some(now);
            }
            retired.push(dev.clone());
            self.retired_ppp_devices.push(dev);
        }

        let len = self.retired_ppp_devices.len();
        if len > MAX_RETIRED_DEVICES {
            self.retired_ppp_devices.drain(..len - MAX_RETIRED_DEVICES);
        }
        retired
    }

    /// Status entry of a site-to-site user
    pub fn site_to_site_status_mut(&mut self, username: &str) -> Option<&mut SiteToSiteStatus> {
        self.site_to_site_statuses
            .iter_mut()
            .find(|s| s.username == username)
    }
}

impl PppDevice {
    /// Fresh record for a device entering `ip-pre-up`
    pub fn new(id: u64, pppd_pid: i32, device_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pppd_pid,
            device_name: Some(device_name.to_string()),
            username: None,
            connection_type: ConnectionType::NormalUser,
            restricted: false,
            web_forwarded: false,
            forward_reason: None,
            spoof_prevention: true,
            locally_authenticated: false,
            local_address: Ipv4Addr::UNSPECIFIED,
            remote_address: Ipv4Addr::UNSPECIFIED,
            outer_address: Ipv4Addr::UNSPECIFIED,
            outer_port: 0,
            spi_rx: DEFAULT_SPI.to_string(),
            spi_tx: DEFAULT_SPI.to_string(),
            psk_index: 0,
            encapsulation: EncapsulationMode::EspOverUdp,
            start_time: now,
            stop_time: None,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_packets: 0,
            tx_packets: 0,
            rx_rate_current: 0.0,
            tx_rate_current: 0.0,
            rx_rate_maximum: 0.0,
            tx_rate_maximum: 0.0,
            counters_updated: None,
            comment: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_line_format() {
        assert_eq!(
            state_line(RunnerState::Starting, Some(StartingSubstate::WaitingForDhcp)),
            "*** STATE: STARTING WAITING_FOR_DHCP"
        );
        assert_eq!(state_line(RunnerState::Running, None), "*** STATE: RUNNING");
    }

    #[test]
    fn test_parse_state_line() {
        assert_eq!(
            parse_state_line("*** STATE: STARTING PREPARING\r\n"),
            Some((RunnerState::Starting, Some(StartingSubstate::Preparing)))
        );
        assert_eq!(
            parse_state_line("*** STATE:   RUNNING  "),
            Some((RunnerState::Running, None))
        );
        assert_eq!(parse_state_line("*** STATE:RUNNING"), None);
        assert_eq!(parse_state_line("*** STATE: BOGUS"), None);
        assert_eq!(parse_state_line("*** STATE: RUNNING A B"), None);
        assert_eq!(parse_state_line("log line"), None);
    }

    #[test]
    fn test_retire_stamps_stop_time_once() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let mut status = GatewayStatus::default();
        let mut dev = PppDevice::new(1, 100, "l2tp1-1", t0);
        dev.stop_time = Some(t0);
        status.ppp_devices.push(dev);
        status.ppp_devices.push(PppDevice::new(2, 101, "l2tp2-2", t0));

        let retired = status.retire_where(t1, |_| true);
        assert_eq!(retired.len(), 2);
        assert!(status.ppp_devices.is_empty());
        assert_eq!(status.retired_ppp_devices[0].stop_time, Some(t0));
        assert_eq!(status.retired_ppp_devices[1].stop_time, Some(t1));
    }

    #[test]
    fn test_retired_history_is_capped() {
        let now = Utc::now();
        let mut status = GatewayStatus::default();
        for i in 0..(MAX_RETIRED_DEVICES as u64 + 5) {
            status
                .ppp_devices
                .push(PppDevice::new(i, i as i32, &format!("l2tp{}-{}", i, i), now));
            status.retire_where(now, |_| true);
        }
        assert_eq!(status.retired_ppp_devices.len(), MAX_RETIRED_DEVICES);
        assert_eq!(status.retired_ppp_devices[0].id, 5);
    }

    #[test]
    fn test_clear_runtime_keeps_devices() {
        let now = Utc::now();
        let mut status = GatewayStatus {
            state: Some(RunnerState::Running),
            process_health_check: Some(true),
            next_device_id: 7,
            ..Default::default()
        };
        status.ppp_devices.push(PppDevice::new(7, 1, "l2tp1-1", now));
        status.clear_runtime();
        assert_eq!(status.state, None);
        assert_eq!(status.process_health_check, None);
        assert_eq!(status.ppp_devices.len(), 1);
        assert_eq!(status.allocate_device_id(), 8);
    }
}
