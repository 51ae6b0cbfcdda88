//! Simulated actuator outputs for a misting controller.
//!
//! Obeys the hub's command payloads and reports what the outputs would look
//! like on real hardware:
//! - `{"power":"on"|"off"}` opens/closes a binary output
//! - `{"target":N}` positions a percentage output (open when N > 0)
//! - `{"action":"test","duration_seconds":N}` opens for N seconds, then closes
//! - `{"action":"start"|"stop"}` opens/closes, with an optional timer
//!
//! Anything else is refused; the output does not move.

use std::collections::BTreeMap;

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Power {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    Start,
    Stop,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerCmd {
    power: Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetCmd {
    target: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionCmd {
    action: Action,
    #[serde(default)]
    duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Power(PowerCmd),
    Target(TargetCmd),
    Action(ActionCmd),
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let cmd: Command = serde_json::from_slice(payload)
            .map_err(|e| format!("unrecognised command: {e}"))?;
        match cmd {
            Command::Target(TargetCmd { target }) if target > 100 => {
                Err(format!("target {target} out of range"))
            }
            Command::Action(ActionCmd {
                action: Action::Test,
                duration_seconds: None | Some(0),
            }) => Err("test needs a positive duration_seconds".to_string()),
            cmd => Ok(cmd),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Output {
    open: bool,
    close_at: Option<OffsetDateTime>,
}

/// All outputs wired to this controller, keyed by actuator_id.
#[derive(Debug, Default)]
pub struct Outputs {
    outputs: BTreeMap<String, Output>,
}

impl Outputs {
    pub fn new<I: IntoIterator<Item = String>>(actuator_ids: I) -> Self {
        Self {
            outputs: actuator_ids
                .into_iter()
                .map(|id| (id, Output::default()))
                .collect(),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.outputs.keys()
    }

    /// Apply a command. Returns the resulting open state, or `None` for an
    /// actuator this controller does not drive.
    pub fn apply(&mut self, actuator_id: &str, cmd: Command, now: OffsetDateTime) -> Option<bool> {
        let out = self.outputs.get_mut(actuator_id)?;
        let (open, timer) = match cmd {
            Command::Power(PowerCmd { power }) => (power == Power::On, None),
            Command::Target(TargetCmd { target }) => (target > 0, None),
            Command::Action(ActionCmd {
                action: Action::Stop,
                ..
            }) => (false, None),
            Command::Action(ActionCmd {
                duration_seconds, ..
            }) => (true, duration_seconds),
        };
        out.open = open;
        out.close_at = timer.map(|secs| now + Duration::seconds(i64::from(secs)));
        Some(open)
    }

    /// Close every output whose timer has run out. Returns their ids.
    pub fn expire(&mut self, now: OffsetDateTime) -> Vec<String> {
        let mut closed = Vec::new();
        for (id, out) in self.outputs.iter_mut() {
            if out.close_at.is_some_and(|at| at <= now) {
                out.open = false;
                out.close_at = None;
                closed.push(id.clone());
            }
        }
        closed
    }
}

/// Extract actuator_id from "actuator/<actuator_id>/set".
pub fn extract_actuator_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "actuator" && parts[2] == "set" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
