//! Controller liveness.
//!
//! Online is never stored: it is `now - last_seen < timeout`, evaluated on
//! demand. The monitor only remembers which state it last *reported* so that
//! `tick` can emit offline/online flips. Any inbound message from a
//! controller counts as a heartbeat.

use std::collections::BTreeMap;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::ClockAnomalyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Never heard from since the hub started.
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub controller_id: String,
    pub online: bool,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerView {
    pub controller_id: String,
    pub display_name: String,
    pub status: Liveness,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub last_seen_age_secs: Option<i64>,
}

struct ControllerRecord {
    display_name: String,
    last_seen: Option<OffsetDateTime>,
    ever_seen: bool,
    reported_online: bool,
}

impl ControllerRecord {
    fn new(display_name: String) -> Self {
        Self {
            display_name,
            last_seen: None,
            ever_seen: false,
            reported_online: false,
        }
    }
}

pub struct LivenessMonitor {
    timeout: Duration,
    controllers: BTreeMap<String, ControllerRecord>,
    /// Latest instant observed, for detecting a backward clock jump.
    high_water: Option<OffsetDateTime>,
    transitions: broadcast::Sender<Transition>,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            timeout,
            controllers: BTreeMap::new(),
            high_water: None,
            transitions,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pre-register a controller from config so it lists as unknown.
    pub fn register(&mut self, controller_id: &str, display_name: &str) {
        self.controllers
            .entry(controller_id.to_string())
            .or_insert_with(|| ControllerRecord::new(display_name.to_string()))
            .display_name = display_name.to_string();
    }

    /// Offline/online flips, fanned out to every subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn record_heartbeat(&mut self, controller_id: &str, ts: OffsetDateTime) -> Vec<Transition> {
        self.record_activity(controller_id, ts)
    }

    /// Any message from the controller. Creates the record on first sight.
    /// `ts` may lag the wall clock (retained messages), so clock anomalies are
    /// only judged in `tick`.
    pub fn record_activity(&mut self, controller_id: &str, ts: OffsetDateTime) -> Vec<Transition> {
        let mut out = Vec::new();

        let rec = self
            .controllers
            .entry(controller_id.to_string())
            .or_insert_with(|| ControllerRecord::new(controller_id.to_string()));
        rec.last_seen = Some(rec.last_seen.map_or(ts, |seen| seen.max(ts)));
        rec.ever_seen = true;
        if !rec.reported_online {
            rec.reported_online = true;
            info!(controller = %controller_id, "controller online");
            out.push(Transition {
                controller_id: controller_id.to_string(),
                online: true,
                at: ts,
            });
        }

        self.emit(&out);
        out
    }

    /// Explicit offline notice (last-will): drop liveness immediately.
    pub fn force_offline(&mut self, controller_id: &str, at: OffsetDateTime) -> Vec<Transition> {
        let mut out = Vec::new();
        if let Some(rec) = self.controllers.get_mut(controller_id) {
            rec.last_seen = None;
            rec.ever_seen = true;
            if rec.reported_online {
                rec.reported_online = false;
                info!(controller = %controller_id, "controller announced offline");
                out.push(Transition {
                    controller_id: controller_id.to_string(),
                    online: false,
                    at,
                });
            }
        }
        self.emit(&out);
        out
    }

    pub fn is_online(&self, controller_id: &str, now: OffsetDateTime) -> bool {
        self.controllers
            .get(controller_id)
            .is_some_and(|rec| self.fresh(rec, now))
    }

    pub fn status(&self, controller_id: &str, now: OffsetDateTime) -> Liveness {
        match self.controllers.get(controller_id) {
            None => Liveness::Unknown,
            Some(rec) if !rec.ever_seen => Liveness::Unknown,
            Some(rec) if self.fresh(rec, now) => Liveness::Online,
            Some(_) => Liveness::Offline,
        }
    }

    /// Periodic recompute. A controller only flips offline once it has
    /// missed heartbeats for the whole timeout window.
    pub fn tick(&mut self, now: OffsetDateTime) -> Vec<Transition> {
        let mut out = self.check_clock(now);

        let timeout = self.timeout;
        for (id, rec) in self.controllers.iter_mut() {
            let online = rec
                .last_seen
                .is_some_and(|seen| seen <= now && now - seen < timeout);
            if online != rec.reported_online {
                rec.reported_online = online;
                if online {
                    info!(controller = %id, "controller online");
                } else {
                    warn!(controller = %id, timeout_secs = timeout.whole_seconds(), "controller offline: heartbeat timeout");
                }
                out.push(Transition {
                    controller_id: id.clone(),
                    online,
                    at: now,
                });
            }
        }

        self.emit(&out);
        out
    }

    /// Broker connection lost: every controller must re-prove liveness.
    pub fn on_disconnect(&mut self, now: OffsetDateTime) -> Vec<Transition> {
        let out = self.clear_all(now);
        self.emit(&out);
        out
    }

    pub fn controllers(&self, now: OffsetDateTime) -> Vec<ControllerView> {
        self.controllers
            .iter()
            .map(|(id, rec)| ControllerView {
                controller_id: id.clone(),
                display_name: rec.display_name.clone(),
                status: self.status(id, now),
                last_seen: rec.last_seen,
                last_seen_age_secs: rec.last_seen.map(|seen| (now - seen).whole_seconds().max(0)),
            })
            .collect()
    }

    fn fresh(&self, rec: &ControllerRecord, now: OffsetDateTime) -> bool {
        rec.last_seen
            .is_some_and(|seen| seen <= now && now - seen < self.timeout)
    }

    /// A backward jump would make every delta meaningless: forget all
    /// heartbeats instead.
    fn check_clock(&mut self, now: OffsetDateTime) -> Vec<Transition> {
        match self.high_water {
            Some(hw) if now < hw => {
                let err = ClockAnomalyError {
                    seconds: (hw - now).whole_seconds(),
                };
                warn!("{err}");
                self.high_water = Some(now);
                self.clear_all(now)
            }
            _ => {
                self.high_water = Some(now);
                Vec::new()
            }
        }
    }

    fn clear_all(&mut self, now: OffsetDateTime) -> Vec<Transition> {
        let mut out = Vec::new();
        for (id, rec) in self.controllers.iter_mut() {
            rec.last_seen = None;
            if rec.reported_online {
                rec.reported_online = false;
                out.push(Transition {
                    controller_id: id.clone(),
                    online: false,
                    at: now,
                });
            }
        }
        out
    }

    fn emit(&self, transitions: &[Transition]) {
        for t in transitions {
            // No subscribers is fine.
            let _ = self.transitions.send(t.clone());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
