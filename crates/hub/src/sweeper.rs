//! Liveness eviction: drops devices that stopped pinging.

use tracing::info;

use crate::registry::{Device, DeviceRegistry};

/// Seconds a device may go without a matched ping before it is evicted.
pub const LIVENESS_WINDOW_SEC: i64 = 60;

/// A device is stale when it was not matched this tick and its last ping is
/// strictly older than the window.
pub fn is_stale(device: &Device, now: i64, window_sec: i64) -> bool {
    !device.seen_this_cycle && now - device.last_seen > window_sec
}

/// Remove every stale device and return what was removed. Must run after the
/// tick's pings have been reconciled.
pub fn sweep(registry: &mut DeviceRegistry, now: i64, window_sec: i64) -> Vec<Device> {
    let stale: Vec<u64> = registry
        .iter()
        .filter(|d| is_stale(d, now, window_sec))
        .map(|d| d.id)
        .collect();

    let mut evicted = Vec::with_capacity(stale.len());
    for id in stale {
        if let Some(device) = registry.remove(id) {
            info!(
                device_id = device.id,
                address = %device.address,
                silent_sec = now - device.last_seen,
                "sweeper: device evicted"
            );
            evicted.push(device);
        }
    }
    evicted
}

// ===========================================================================
// Tests
// ===========================================================================
