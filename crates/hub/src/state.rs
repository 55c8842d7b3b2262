use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use time::OffsetDateTime;

use crate::catalog::Plant;
use crate::registry::Device;
use crate::scheduler::{CycleStatus, CycleTimer};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Device,
    Plant,
    Cycle,
    Error,
    System,
}

/// Bounded log of notable hub events, oldest dropped first.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<HubEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<HubEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only copy of hub state, published after every tick and command.
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub started_at: Instant,
    /// Unix seconds at publication.
    pub taken_at: i64,
    pub devices: Vec<Device>,
    pub plants: Vec<Plant>,
    pub timer: CycleTimer,
    pub pending_pings: usize,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub snapshot_at: i64,
    pub devices: Vec<Device>,
    pub plants: Vec<Plant>,
    pub cycle: CycleStatus,
    pub pending_pings: usize,
    pub events: Vec<HubEvent>,
}

impl HubSnapshot {
    pub fn empty(timer: CycleTimer) -> Self {
        Self {
            started_at: Instant::now(),
            taken_at: 0,
            devices: Vec::new(),
            plants: Vec::new(),
            timer,
            pending_pings: 0,
            events: Vec::new(),
        }
    }

    /// Command queued for a device, `None` for unknown ids.
    pub fn device_command(&self, device_id: u64) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.pending_command.as_str())
    }

    pub fn cycle_status(&self, now: i64) -> CycleStatus {
        self.timer.status(now)
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: i64) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            snapshot_at: self.taken_at,
            devices: self.devices.clone(),
            plants: self.plants.clone(),
            cycle: self.cycle_status(now),
            pending_pings: self.pending_pings,
            events: self.events.clone(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use crate::scheduler::CycleState;

    #[test]
    fn event_log_is_bounded_and_newest_first() {
        let mut log = EventLog::new();
        for i in 0..(MAX_EVENTS + 25) {
            log.record(EventKind::System, format!("event {i}"));
        }
        assert_eq!(log.len(), MAX_EVENTS);
        let recent = log.recent();
        assert_eq!(recent[0].detail, format!("event {}", MAX_EVENTS + 24));
        assert_eq!(recent[MAX_EVENTS - 1].detail, "event 25");
    }

    #[test]
    fn event_serializes_rfc3339_and_lowercase_kind() {
        let mut log = EventLog::new();
        log.record(EventKind::Cycle, "fired");
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["kind"], "cycle");
        assert!(json["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn device_command_is_none_for_unknown_device() {
        let mut reg = DeviceRegistry::new();
        let id = reg.upsert_by_address("10.0.0.1", 1).id();
        reg.set_command(id, "CAPTURE").unwrap();

        let snap = HubSnapshot {
            devices: reg.list(),
            ..HubSnapshot::empty(CycleTimer::new(60))
        };

        assert_eq!(snap.device_command(id), Some("CAPTURE"));
        assert_eq!(snap.device_command(99), None);
    }

    #[test]
    fn status_reports_cycle_state() {
        let snap = HubSnapshot::empty(CycleTimer::with_anchor(1_000, 600));
        let status = snap.to_status(1_100);
        assert_eq!(status.cycle.remaining, 500);
        assert_eq!(status.cycle.state, CycleState::Running);
        assert!(status.devices.is_empty());
    }
}
