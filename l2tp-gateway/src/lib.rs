// L2TP/IPsec Gateway Library
// Shared modules for the runner, the supervisor and the pppd/dhclient hooks

#![warn(missing_docs)]

//! L2TP/IPsec Gateway Library
//!
//! This library orchestrates an L2TP/IPsec remote access and site-to-site
//! VPN gateway: host network setup, the external daemons, per-tunnel
//! firewall policy and the health monitors that decide when the gateway
//! must be reinitialised.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and validation
//! - [`runner`]: Gateway runner state machine and main loop
//! - [`supervisor`]: Parent process that drives the runner through its state lines
//! - [`ppp`]: PPP device lifecycle for the pppd hooks
//! - [`restrictions`]: Per-connection restriction evaluation
//! - [`firewall`]: iptables rule generation and application
//! - [`network`]: Interface, route and DHCP lease handling
//! - [`daemons`]: External daemon start/stop and health checks
//! - [`monitor`], [`router_monitor`], [`s2s_monitor`]: Periodic health monitors
//! - [`dhcp_hook`]: dhclient event handler
//! - [`store`], [`status`]: Persisted gateway status

pub mod config;
pub mod daemons;
pub mod dhcp_hook;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod ipsec;
pub mod license;
pub mod monitor;
pub mod network;
pub mod ppp;
pub mod restrictions;
pub mod router_monitor;
pub mod runner;
pub mod s2s_client;
pub mod s2s_monitor;
pub mod state_file;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod types;
