//! Job lifecycle states.
//!
//! ```text
//!   unqueued ──→ queued ──→ started ──→ succeeded
//!                              │  ↺         │
//!                              │ restart    ├──→ failed
//!                              │            │
//!                              └────────────┴──→ killed
//!
//!   unknown: materialized on lookup of an id never seen before
//! ```
//!
//! Every state owns a timestamp field that is written the first time a
//! record enters it. `unqueued` and `unknown` share `recorded_at`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StatusError;

/// Lifecycle phase of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Unqueued,
    Queued,
    Started,
    Succeeded,
    Failed,
    Killed,
    Unknown,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Unqueued,
        State::Queued,
        State::Started,
        State::Succeeded,
        State::Failed,
        State::Killed,
        State::Unknown,
    ];

    pub const COMPLETED: [State; 2] = [State::Succeeded, State::Failed];

    pub const INCOMPLETE: [State; 4] = [
        State::Unqueued,
        State::Queued,
        State::Started,
        State::Killed,
    ];

    /// Every distinct timestamp field name, in lifecycle order.
    pub const TIMESTAMP_NAMES: [&'static str; 6] = [
        "recorded_at",
        "queued_at",
        "started_at",
        "succeeded_at",
        "failed_at",
        "killed_at",
    ];

    pub fn name(self) -> &'static str {
        match self {
            State::Unqueued => "unqueued",
            State::Queued => "queued",
            State::Started => "started",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Killed => "killed",
            State::Unknown => "unknown",
        }
    }

    /// Name of the field recording the first entry into this state.
    pub fn timestamp_name(self) -> &'static str {
        match self {
            State::Unqueued | State::Unknown => "recorded_at",
            State::Queued => "queued_at",
            State::Started => "started_at",
            State::Succeeded => "succeeded_at",
            State::Failed => "failed_at",
            State::Killed => "killed_at",
        }
    }

    pub fn from_name(name: &str) -> Option<State> {
        State::ALL.into_iter().find(|state| state.name() == name)
    }

    pub fn is_timestamp_name(name: &str) -> bool {
        State::TIMESTAMP_NAMES.contains(&name)
    }

    /// Whether callers may transition into this state by name.
    pub fn is_enterable(self) -> bool {
        self != State::Unknown
    }

    pub fn is_completed(self) -> bool {
        State::COMPLETED.contains(&self)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for State {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::from_name(s).ok_or_else(|| StatusError::invalid(format!("'{s}' is not a valid state")))
    }
}
