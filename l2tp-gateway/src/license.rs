// License quota decisions and reconciliation

//! Binary "may this connection in" decisions derived from the configured
//! quotas, plus the periodic reconciliation of live device records
//! (stale pppd detection, traffic counters).

use crate::exec::Executor;
use crate::status::{GatewayStatus, PppDevice};
use crate::store::StatusStore;
use crate::types::LicenseConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// License facts consumed by the restriction evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseState {
    /// The license is valid at all
    pub valid: bool,
    /// Another normal user connection fits in the quota
    pub normal_access: bool,
    /// Another site-to-site connection fits in the quota
    pub site_to_site_access: bool,
}

/// Decide access for one more connection given the currently active devices
pub fn evaluate_access(cfg: &LicenseConfig, status: &GatewayStatus) -> LicenseState {
    let site_to_site = status
        .ppp_devices
        .iter()
        .filter(|d| d.connection_type.is_site_to_site())
        .count() as u64;
    let normal = status.ppp_devices.len() as u64 - site_to_site;

    // Normal users get a small leeway on top of the quota, site-to-site none
    let normal_limit = u64::from(cfg.max_normal_connections)
        + (f64::from(cfg.max_normal_connections) * cfg.connection_leeway).floor() as u64;
    let site_to_site_limit = u64::from(cfg.max_site_to_site_connections);

    LicenseState {
        valid: cfg.valid,
        normal_access: normal < normal_limit,
        site_to_site_access: site_to_site < site_to_site_limit,
    }
}

/// Device names of active records whose pppd no longer exists
pub fn stale_devices(status: &GatewayStatus, exec: &dyn Executor) -> Vec<String> {
    status
        .ppp_devices
        .iter()
        .filter(|d| !exec.is_alive(d.pppd_pid))
        .filter_map(|d| d.device_name.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    rx_bytes: u64,
    tx_bytes: u64,
    rx_packets: u64,
    tx_packets: u64,
}

fn read_counter(dir: &Path, name: &str) -> Option<u64> {
    fs::read_to_string(dir.join(name)).ok()?.trim().parse().ok()
}

fn read_counters(sysfs_net: &Path, device: &str) -> Option<Counters> {
    let dir = sysfs_net.join(device).join("statistics");
    Some(Counters {
        rx_bytes: read_counter(&dir, "rx_bytes")?,
        tx_bytes: read_counter(&dir, "tx_bytes")?,
        rx_packets: read_counter(&dir, "rx_packets")?,
        tx_packets: read_counter(&dir, "tx_packets")?,
    })
}

fn apply_counters(dev: &mut PppDevice, counters: Counters, now: DateTime<Utc>) {
    let since = dev.counters_updated.unwrap_or(dev.start_time);
    let elapsed = (now - since).num_milliseconds() as f64 / 1000.0;
    if elapsed > 0.0 {
        dev.rx_rate_current = counters.rx_bytes.saturating_sub(dev.rx_bytes) as f64 / elapsed;
        dev.tx_rate_current = counters.tx_bytes.saturating_sub(dev.tx_bytes) as f64 / elapsed;
        dev.rx_rate_maximum = dev.rx_rate_maximum.max(dev.rx_rate_current);
        dev.tx_rate_maximum = dev.tx_rate_maximum.max(dev.tx_rate_current);
    }
    dev.rx_bytes = counters.rx_bytes;
    dev.tx_bytes = counters.tx_bytes;
    dev.rx_packets = counters.rx_packets;
    dev.tx_packets = counters.tx_packets;
    dev.counters_updated = Some(now);
}

/// Refresh byte/packet counters and rates of active devices from sysfs.
/// Returns the number of devices updated.
pub fn refresh_counters(store: &StatusStore, sysfs_net: &Path, now: DateTime<Utc>) -> Result<usize> {
    let names: Vec<String> = store
        .snapshot()?
        .ppp_devices
        .iter()
        .filter_map(|d| d.device_name.clone())
        .collect();

    // Read outside the transaction
    let readings: Vec<(String, Counters)> = names
        .into_iter()
        .filter_map(|name| read_counters(sysfs_net, &name).map(|c| (name, c)))
        .collect();

    store.transact(|status| {
        let mut updated = 0;
        for (name, counters) in &readings {
            if let Some(dev) = status
                .ppp_devices
                .iter_mut()
                .find(|d| d.device_name.as_deref() == Some(name.as_str()))
            {
                apply_counters(dev, *counters, now);
                updated += 1;
            }
        }
        Ok(updated)
    })
}
