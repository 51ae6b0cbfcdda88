use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::warn;

use crate::arbiter::ModeArbiter;
use crate::clock::Clock;
use crate::liveness::{LivenessMonitor, Transition};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Everything the MQTT loop, the tickers and the HTTP handlers share. One
/// write lock serialises operator actions and schedule ticks.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub clock: Arc<dyn Clock>,
    pub liveness: LivenessMonitor,
    pub arbiter: ModeArbiter,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Controller,
    Operator,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(clock: Arc<dyn Clock>, liveness: LivenessMonitor, arbiter: ModeArbiter) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            clock,
            liveness,
            arbiter,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Log a liveness flip; a controller coming back gets its last desired
    /// outputs re-published.
    pub async fn on_transition(&mut self, t: &Transition) {
        let verb = if t.online { "online" } else { "offline" };
        self.push_event(EventKind::Controller, format!("{} {verb}", t.controller_id));

        if !t.online {
            return;
        }
        match self
            .arbiter
            .dispatcher_mut()
            .replay_controller(&t.controller_id)
            .await
        {
            Ok(0) => {}
            Ok(n) => self.push_event(
                EventKind::Controller,
                format!("{}: re-published {n} desired state(s)", t.controller_id),
            ),
            Err(e) => {
                warn!(controller = %t.controller_id, "replay failed: {e:#}");
                self.record_error(format!("replay for {} failed: {e:#}", t.controller_id));
            }
        }
    }

    /// Record an operator action.
    pub fn record_operator(&mut self, detail: String) {
        self.push_event(EventKind::Operator, detail);
    }

    /// Record a scheduler event.
    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            now: self.now(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        let ts = self.now();
        self.events.push_back(SystemEvent { ts, kind, detail });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
