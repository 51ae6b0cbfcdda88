//! Command dispatcher: the single gate between control intent and the
//! outbound command channel.
//!
//! Every send records the *desired* state first-hand in the store. Publishing
//! is fire-and-forget; when the transport is down the caller gets a
//! `TransportError` straight away and the actuator stays marked pending until
//! `republish_pending` runs after reconnect.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::db::{Db, DesiredState};
use crate::error::{HubResult, StaleControllerError, TransportError, ValidationError};

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    /// On/off device: misting valve, pump, fan.
    Binary,
    /// Positionable device: vent, valve opener (0..=100).
    Percentage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actuator {
    pub actuator_id: String,
    pub controller_id: String,
    pub kind: ActuatorKind,
    pub command_topic: String,
    pub status_topic: String,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Test,
}

/// Closed set of outbound commands. Serialises to exactly one of
/// `{"power":"on"|"off"}`, `{"target":N}` or
/// `{"action":"start"|"stop"|"test","duration_seconds":N?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "wire::Command", try_from = "wire::Command")]
pub enum Command {
    Power(bool),
    Target(u8),
    Action {
        action: Action,
        duration_seconds: Option<u32>,
    },
}

impl Command {
    /// Default on/off command for an actuator kind.
    pub fn switch(kind: ActuatorKind, on: bool) -> Self {
        match kind {
            ActuatorKind::Binary => Self::Power(on),
            ActuatorKind::Percentage => Self::Target(if on { 100 } else { 0 }),
        }
    }

    pub fn test(duration_seconds: u32) -> Self {
        Self::Action {
            action: Action::Test,
            duration_seconds: Some(duration_seconds),
        }
    }

    /// Whether the command leaves the actuator driving (spraying, open).
    pub fn is_on(&self) -> bool {
        match self {
            Self::Power(on) => *on,
            Self::Target(t) => *t > 0,
            Self::Action { action, .. } => *action != Action::Stop,
        }
    }

    /// A timed test is a one-off and never the state to restore.
    pub fn is_steady(&self) -> bool {
        !matches!(
            self,
            Self::Action {
                action: Action::Test,
                ..
            }
        )
    }

    pub fn fits(&self, kind: ActuatorKind) -> bool {
        match (self, kind) {
            (Self::Power(_), ActuatorKind::Binary) => true,
            (Self::Target(_), ActuatorKind::Percentage) => true,
            (Self::Action { .. }, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power(on) => write!(f, "power {}", if *on { "on" } else { "off" }),
            Self::Target(t) => write!(f, "target {t}%"),
            Self::Action {
                action,
                duration_seconds: Some(d),
            } => write!(f, "{action:?} {d}s"),
            Self::Action { action, .. } => write!(f, "{action:?}"),
        }
    }
}

mod wire {
    use serde::{Deserialize, Serialize};

    use super::Action;

    #[derive(Clone, Copy, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Power {
        On,
        Off,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct PowerCmd {
        pub power: Power,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct TargetCmd {
        pub target: u8,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct ActionCmd {
        pub action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub duration_seconds: Option<u32>,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Command {
        Power(PowerCmd),
        Target(TargetCmd),
        Action(ActionCmd),
    }

    impl From<super::Command> for Command {
        fn from(c: super::Command) -> Self {
            match c {
                super::Command::Power(on) => Self::Power(PowerCmd {
                    power: if on { Power::On } else { Power::Off },
                }),
                super::Command::Target(target) => Self::Target(TargetCmd { target }),
                super::Command::Action {
                    action,
                    duration_seconds,
                } => Self::Action(ActionCmd {
                    action,
                    duration_seconds,
                }),
            }
        }
    }

    impl TryFrom<Command> for super::Command {
        type Error = String;

        fn try_from(c: Command) -> Result<Self, Self::Error> {
            match c {
                Command::Power(p) => Ok(Self::Power(matches!(p.power, Power::On))),
                Command::Target(t) if t.target > 100 => {
                    Err(format!("target {} out of range 0..=100", t.target))
                }
                Command::Target(t) => Ok(Self::Target(t.target)),
                Command::Action(a) => match (a.action, a.duration_seconds) {
                    (_, Some(0)) => Err("duration_seconds must be positive".to_string()),
                    (Action::Test, None) => Err("test needs duration_seconds".to_string()),
                    (action, duration_seconds) => Ok(Self::Action {
                        action,
                        duration_seconds,
                    }),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Narrow outbound side of the pub/sub broker. Must not block.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    db: Db,
    publisher: Arc<dyn Publisher>,
    actuators: HashMap<String, Actuator>,
    pending: HashSet<String>,
}

impl Dispatcher {
    pub fn new(db: Db, publisher: Arc<dyn Publisher>, actuators: Vec<Actuator>) -> Self {
        Self {
            db,
            publisher,
            actuators: actuators
                .into_iter()
                .map(|a| (a.actuator_id.clone(), a))
                .collect(),
            pending: HashSet::new(),
        }
    }

    /// Restore the pending set after a restart.
    pub async fn load_pending(&mut self) -> anyhow::Result<()> {
        self.pending = self
            .db
            .pending_desired()
            .await?
            .into_iter()
            .map(|d| d.actuator_id)
            .collect();
        Ok(())
    }

    pub fn actuator(&self, actuator_id: &str) -> Option<&Actuator> {
        self.actuators.get(actuator_id)
    }

    /// Actuator whose echo arrives on `topic`.
    pub fn by_status_topic(&self, topic: &str) -> Option<&Actuator> {
        self.actuators.values().find(|a| a.status_topic == topic)
    }

    pub fn actuators(&self) -> impl Iterator<Item = &Actuator> {
        self.actuators.values()
    }

    pub fn is_pending(&self, actuator_id: &str) -> bool {
        self.pending.contains(actuator_id)
    }

    /// Send on behalf of a zone bound to `controller_id`. The binding must
    /// match the controller that owns the actuator.
    pub async fn send_bound(
        &mut self,
        controller_id: Option<&str>,
        actuator_id: &str,
        command: Command,
        now: OffsetDateTime,
    ) -> HubResult<()> {
        let owner = self
            .actuators
            .get(actuator_id)
            .map(|a| a.controller_id.as_str());
        match (controller_id, owner) {
            (Some(bound), Some(owner)) if bound == owner => {}
            (None, _) => {
                return Err(StaleControllerError {
                    target: format!("actuator '{actuator_id}' (zone has no controller)"),
                }
                .into())
            }
            (Some(bound), _) => {
                return Err(StaleControllerError {
                    target: format!("actuator '{actuator_id}' on controller '{bound}'"),
                }
                .into())
            }
        }
        self.send(actuator_id, command, now).await
    }

    pub async fn send(&mut self, actuator_id: &str, command: Command, now: OffsetDateTime) -> HubResult<()> {
        let actuator = self
            .actuators
            .get(actuator_id)
            .ok_or_else(|| StaleControllerError {
                target: format!("actuator '{actuator_id}'"),
            })?;
        if !command.fits(actuator.kind) {
            return Err(ValidationError::new(format!(
                "{command} does not apply to {:?} actuator '{actuator_id}'",
                actuator.kind
            ))
            .into());
        }

        let payload = serde_json::to_vec(&command).context("encode command")?;
        let topic = actuator.command_topic.clone();

        match self.publisher.publish(&topic, payload) {
            Ok(()) => {
                self.db.record_desired(actuator_id, &command, now, false).await?;
                self.pending.remove(actuator_id);
                info!(actuator = %actuator_id, %topic, %command, "command published");
                Ok(())
            }
            Err(e) => {
                self.db.record_desired(actuator_id, &command, now, true).await?;
                self.pending.insert(actuator_id.to_string());
                warn!(actuator = %actuator_id, %command, "publish failed, desired state pending: {e}");
                Err(e.into())
            }
        }
    }

    /// Re-publish every pending desired state. Returns how many went out.
    pub async fn republish_pending(&mut self) -> anyhow::Result<usize> {
        let pending = self.db.pending_desired().await?;
        self.replay(pending).await
    }

    /// Re-publish the last desired state of every actuator on a controller,
    /// e.g. after it comes back online and may have reset its outputs.
    pub async fn replay_controller(&mut self, controller_id: &str) -> anyhow::Result<usize> {
        let mut ids: Vec<String> = self
            .actuators
            .values()
            .filter(|a| a.controller_id == controller_id)
            .map(|a| a.actuator_id.clone())
            .collect();
        ids.sort();

        let mut desired = Vec::new();
        for id in ids {
            match self.db.get_desired(&id).await? {
                Some(d) if d.command.is_steady() => desired.push(d),
                Some(d) => debug!(actuator = %id, command = %d.command, "one-off command not replayed"),
                None => {}
            }
        }
        self.replay(desired).await
    }

    async fn replay(&mut self, desired: Vec<DesiredState>) -> anyhow::Result<usize> {
        let mut sent = 0;
        for d in desired {
            let Some(actuator) = self.actuators.get(&d.actuator_id) else {
                warn!(actuator = %d.actuator_id, "desired state for unknown actuator, skipping");
                continue;
            };
            let payload = serde_json::to_vec(&d.command).context("encode command")?;
            match self.publisher.publish(&actuator.command_topic, payload) {
                Ok(()) => {
                    if d.pending {
                        self.db.set_pending(&d.actuator_id, false).await?;
                    }
                    self.pending.remove(&d.actuator_id);
                    info!(actuator = %d.actuator_id, command = %d.command, "desired state re-published");
                    sent += 1;
                }
                Err(e) => {
                    warn!(actuator = %d.actuator_id, "re-publish failed: {e}");
                    break;
                }
            }
        }
        Ok(sent)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
