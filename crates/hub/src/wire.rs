//! Request bodies and plain-text formats exchanged with devices and the
//! admin caller.

use serde::Deserialize;
use std::fmt::Write as _;

use crate::registry::{Device, Position};

/// Largest ping body accepted, in bytes.
pub const MAX_PING_BODY: usize = 1024;

// ---------------------------------------------------------------------------
// Admin request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub plant_index: u32,
    pub position: Position,
}

#[derive(Debug, Deserialize)]
pub struct AddPlantRequest {
    pub name: String,
}

/// New cycle length, given either in seconds or in minutes.
#[derive(Debug, Deserialize)]
pub struct DurationRequest {
    #[serde(default)]
    pub seconds: Option<i64>,
    #[serde(default)]
    pub minutes: Option<i64>,
}

impl DurationRequest {
    /// Seconds requested. `None` when neither or both fields are set, or
    /// when minutes overflow.
    pub fn to_seconds(&self) -> Option<i64> {
        match (self.seconds, self.minutes) {
            (Some(s), None) => Some(s),
            (None, Some(m)) => m.checked_mul(60),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

// ---------------------------------------------------------------------------
// Ping body
// ---------------------------------------------------------------------------

/// Parse a device ping body: the device id as decimal text, surrounding
/// whitespace allowed.
pub fn parse_ping_body(body: &[u8]) -> Result<u64, String> {
    if body.len() > MAX_PING_BODY {
        return Err(format!("ping body exceeds {MAX_PING_BODY} bytes"));
    }
    let text = std::str::from_utf8(body).map_err(|_| "ping body is not UTF-8".to_string())?;
    let text = text.trim();
    if text.is_empty() {
        return Err("ping body is empty".to_string());
    }
    text.parse::<u64>()
        .map_err(|_| format!("invalid device id '{text}'"))
}

// ---------------------------------------------------------------------------
// Device table export
// ---------------------------------------------------------------------------

/// One line per device: `id,address,plant_ref,plant_name,position,last_seen,command`.
pub fn export_devices(devices: &[Device]) -> String {
    let mut out = String::new();
    for d in devices {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            d.id, d.address, d.plant_ref, d.plant_name, d.position, d.last_seen, d.pending_command
        );
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
