//! Global processing-cycle timer.
//!
//! A single timer decides, once per tick, whether every plant should be
//! processed again. The timer is pure: it never touches the registry or the
//! dispatcher, it only answers "fire or wait" and moves its own anchor.
//!
//! ## State machine
//!
//! ```text
//! NeverStarted ──[tick]──▶ fire, anchor = now ──▶ Active
//!                                                   │
//!      ┌──────────[0 <= elapsed < 5s]───────────────┤ fire, anchor = now
//!      │                                            │
//!      └──────────────[elapsed >= duration]──▶ Due ─┘ fire, anchor = now
//!
//! start()  ─▶ anchor = now    (debounce fires on the next tick)
//! reset()  ─▶ anchor = 0      (NeverStarted fires on the next tick)
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often the hub runs a tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Window after an anchor change during which a tick fires even though the
/// cycle is not due.
pub const DEBOUNCE_WINDOW_SEC: i64 = 5;

/// Cycle length used when nothing is persisted or configured.
pub const DEFAULT_CYCLE_DURATION_SEC: i64 = 3600;

/// Longest cycle accepted from an admin command or the config file (one year).
pub const MAX_CYCLE_DURATION_SEC: i64 = 365 * 86_400;

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTimer {
    /// Unix seconds when the current cycle started; 0 = never started.
    pub anchor: i64,
    /// Seconds between cycles.
    pub duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    NeverStarted,
    Active { elapsed: i64, remaining: i64 },
    Due,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireReason {
    /// Timer had never been started (or was reset).
    Initial,
    /// Configured duration elapsed.
    Due,
    /// Anchor changed within the last few seconds.
    Debounce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Fire(FireReason),
    Wait { remaining: i64 },
}

/// Label shown to admin callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    NotStarted,
    Running,
    Completed,
}

/// `get_cycle_status` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleStatus {
    pub anchor: i64,
    pub duration: i64,
    pub remaining: i64,
    pub state: CycleState,
}

impl CycleTimer {
    pub fn new(duration: i64) -> Self {
        Self {
            anchor: 0,
            duration,
        }
    }

    /// Timer restored from storage (or built in tests) with a given anchor.
    pub fn with_anchor(anchor: i64, duration: i64) -> Self {
        Self { anchor, duration }
    }

    pub fn state(&self, now: i64) -> TimerState {
        if self.anchor == 0 {
            return TimerState::NeverStarted;
        }
        let elapsed = now.saturating_sub(self.anchor);
        if elapsed >= self.duration {
            TimerState::Due
        } else {
            TimerState::Active {
                elapsed,
                remaining: self.duration.saturating_sub(elapsed),
            }
        }
    }

    /// Decide what this tick should do without changing anything.
    pub fn evaluate(&self, now: i64) -> Evaluation {
        match self.state(now) {
            TimerState::NeverStarted => Evaluation::Fire(FireReason::Initial),
            TimerState::Due => Evaluation::Fire(FireReason::Due),
            TimerState::Active { elapsed, .. } if (0..DEBOUNCE_WINDOW_SEC).contains(&elapsed) => {
                Evaluation::Fire(FireReason::Debounce)
            }
            TimerState::Active { remaining, .. } => Evaluation::Wait { remaining },
        }
    }

    /// Record a fire at `now`. Every fire, whatever its reason, starts a new
    /// cycle anchored at `now`.
    pub fn fire(&mut self, now: i64) {
        self.anchor = now;
    }

    /// Evaluate and, if the evaluation fires, apply it.
    pub fn tick(&mut self, now: i64) -> Evaluation {
        let evaluation = self.evaluate(now);
        if let Evaluation::Fire(_) = evaluation {
            self.fire(now);
        }
        evaluation
    }

    /// Change the cycle length; the running cycle keeps its anchor.
    pub fn set_duration(&mut self, seconds: i64) {
        self.duration = seconds;
    }

    pub fn start(&mut self, now: i64) {
        self.anchor = now;
    }

    pub fn reset(&mut self) {
        self.anchor = 0;
    }

    /// Seconds until the cycle is due, clamped at 0. A never-started timer
    /// reports 0.
    pub fn remaining(&self, now: i64) -> i64 {
        if self.anchor == 0 {
            return 0;
        }
        self.anchor
            .saturating_add(self.duration)
            .saturating_sub(now)
            .max(0)
    }

    pub fn status(&self, now: i64) -> CycleStatus {
        let remaining = self.remaining(now);
        let state = if self.anchor == 0 {
            CycleState::NotStarted
        } else if remaining == 0 {
            CycleState::Completed
        } else {
            CycleState::Running
        };
        CycleStatus {
            anchor: self.anchor,
            duration: self.duration,
            remaining,
            state,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ===========================================================================
// Tests
// ===========================================================================
