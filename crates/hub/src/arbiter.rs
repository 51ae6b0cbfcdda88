//! Mode arbiter: the only code allowed to change who drives an actuator.
//!
//! Each zone is in exactly one of OFF / MANUAL / AUTO. Within a zone the two
//! control paths are mutually exclusive:
//!
//! ```text
//!            manual_spray                         start
//!   ┌─────────────────────────┐     ┌───────────────────────────┐
//!   │ is_running := false     │     │ manual_on := false        │
//!   │ (flag flip only, no     │     │ publish stop              │
//!   │  stop for the schedule) │     │ is_running := true        │
//!   │ manual_on := true       │     │ engine drives from next   │
//!   │ publish on              │     │ tick                      │
//!   └─────────────────────────┘     └───────────────────────────┘
//! ```
//!
//! Logical state is updated and persisted before the command goes out; a
//! transport failure is reported to the caller but never rolls it back.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::{Db, ObservedState};
use crate::dispatch::{Command, Dispatcher};
use crate::error::{invalid, HubError, HubResult, StaleControllerError};
use crate::zone::{validate_saved_schedule, validate_zone, Mode, SavedSchedule, Zone, ZoneDef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub actuator_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneView {
    #[serde(flatten)]
    pub zone: Zone,
    pub actuator_on: bool,
    /// Desired state not yet delivered.
    pub pending: bool,
    pub observed: Option<ObservedState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: Group,
    pub spraying: bool,
}

pub struct ModeArbiter {
    db: Db,
    dispatcher: Dispatcher,
    zones: BTreeMap<String, Zone>,
    schedules: BTreeMap<String, SavedSchedule>,
    groups: BTreeMap<String, Group>,
    group_spraying: HashMap<String, bool>,
    observed: HashMap<String, ObservedState>,
}

impl ModeArbiter {
    /// Load persisted zones, schedules and echo state.
    pub async fn load(db: Db, mut dispatcher: Dispatcher, groups: Vec<Group>) -> anyhow::Result<Self> {
        dispatcher.load_pending().await?;

        let zones = db
            .load_zones()
            .await?
            .into_iter()
            .map(|z| (z.def.zone_id.clone(), z))
            .collect();
        let schedules = db
            .load_saved_schedules()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let observed = db.load_observed().await?;

        // Resume group phase from the last desired state so a restart does
        // not re-send commands that already went out.
        let mut group_spraying = HashMap::new();
        for g in &groups {
            let mut on = false;
            for a in &g.actuator_ids {
                if let Some(d) = db.get_desired(a).await? {
                    on |= d.command.is_on();
                }
            }
            group_spraying.insert(g.group_id.clone(), on);
        }

        Ok(Self {
            db,
            dispatcher,
            zones,
            schedules,
            groups: groups.into_iter().map(|g| (g.group_id.clone(), g)).collect(),
            group_spraying,
            observed,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn view(&self, zone: &Zone) -> ZoneView {
        ZoneView {
            zone: zone.clone(),
            actuator_on: zone.actuator_on(),
            pending: self.dispatcher.is_pending(&zone.def.actuator_id),
            observed: self.observed.get(&zone.def.actuator_id).copied(),
        }
    }

    pub fn zone(&self, zone_id: &str) -> Option<ZoneView> {
        self.zones.get(zone_id).map(|z| self.view(z))
    }

    pub fn zones(&self) -> Vec<ZoneView> {
        self.zones.values().map(|z| self.view(z)).collect()
    }

    pub fn schedules(&self) -> Vec<SavedSchedule> {
        self.schedules.values().cloned().collect()
    }

    pub fn groups(&self) -> Vec<GroupView> {
        self.groups
            .values()
            .map(|g| GroupView {
                group: g.clone(),
                spraying: self.group_spraying.get(&g.group_id).copied().unwrap_or(false),
            })
            .collect()
    }

    pub(crate) fn zone_records(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub(crate) fn schedule_records(&self) -> impl Iterator<Item = &SavedSchedule> {
        self.schedules.values()
    }

    fn get(&self, zone_id: &str) -> HubResult<Zone> {
        self.zones
            .get(zone_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("zone '{zone_id}'")))
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Reject a zone the dispatcher could not route before touching state.
    fn check_route(&self, zone: &Zone) -> HubResult<()> {
        let owner = self
            .dispatcher
            .actuator(&zone.def.actuator_id)
            .map(|a| a.controller_id.as_str());
        match (zone.def.controller_id.as_deref(), owner) {
            (Some(bound), Some(owner)) if bound == owner => Ok(()),
            (None, _) => Err(StaleControllerError {
                target: format!("zone '{}'", zone.id()),
            }
            .into()),
            (Some(bound), _) => Err(StaleControllerError {
                target: format!("zone '{}' (controller '{bound}')", zone.id()),
            }
            .into()),
        }
    }

    async fn commit(&mut self, zone: Zone) -> HubResult<()> {
        self.db.upsert_zone(&zone).await?;
        self.zones.insert(zone.def.zone_id.clone(), zone);
        Ok(())
    }

    async fn switch(&mut self, zone: &ZoneDef, on: bool, now: OffsetDateTime) -> HubResult<()> {
        let kind = self
            .dispatcher
            .actuator(&zone.actuator_id)
            .map(|a| a.kind)
            .ok_or_else(|| StaleControllerError {
                target: format!("actuator '{}'", zone.actuator_id),
            })?;
        self.dispatcher
            .send_bound(
                zone.controller_id.as_deref(),
                &zone.actuator_id,
                Command::switch(kind, on),
                now,
            )
            .await
    }

    /// Clear every control path. Returns true when the actuator was on.
    fn halt(zone: &mut Zone) -> bool {
        let was_on = zone.actuator_on();
        zone.is_running = false;
        zone.manual_on = false;
        zone.spraying = false;
        was_on
    }

    // -----------------------------------------------------------------------
    // Operator commands
    // -----------------------------------------------------------------------

    /// Select a mode. Leaving the current mode halts whatever path was
    /// driving the actuator; nothing starts until an explicit start action.
    pub async fn set_mode(&mut self, zone_id: &str, mode: Mode, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        if zone.mode() == mode {
            return Ok(());
        }
        if mode == Mode::Auto && !zone.def.has_basic_schedule() {
            return invalid("auto mode needs the day or night schedule enabled");
        }

        let was_on = Self::halt(&mut zone);
        let from = zone.mode();
        zone.def.mode = mode;
        let def = zone.def.clone();
        self.commit(zone).await?;
        info!(zone = %zone_id, from = from.as_str(), to = mode.as_str(), "mode changed");

        if was_on {
            self.switch(&def, false, now).await?;
        }
        Ok(())
    }

    pub async fn manual_spray(&mut self, zone_id: &str, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        self.check_route(&zone)?;
        if zone.manual_on && zone.mode() == Mode::Manual {
            return Ok(());
        }

        if zone.is_running {
            // Losing path gets no stop; the manual "on" below drives the actuator.
            info!(zone = %zone_id, "manual spray disables schedule");
        }
        zone.is_running = false;
        zone.spraying = false;
        zone.def.mode = Mode::Manual;
        zone.manual_on = true;
        let def = zone.def.clone();
        self.commit(zone).await?;

        self.switch(&def, true, now).await
    }

    pub async fn manual_stop(&mut self, zone_id: &str, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        if !zone.manual_on {
            return Ok(());
        }
        self.check_route(&zone)?;
        zone.manual_on = false;
        let def = zone.def.clone();
        self.commit(zone).await?;

        self.switch(&def, false, now).await
    }

    /// Enable the zone's schedule (AUTO). A manual valve that is on is forced
    /// off first; the engine takes over from the next tick.
    pub async fn start(&mut self, zone_id: &str, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        if !zone.def.has_basic_schedule() {
            return invalid("auto mode needs the day or night schedule enabled");
        }
        self.check_route(&zone)?;
        if zone.is_running && zone.mode() == Mode::Auto {
            return Ok(());
        }

        let stop_manual = zone.manual_on;
        zone.manual_on = false;
        zone.def.mode = Mode::Auto;
        zone.is_running = true;
        let def = zone.def.clone();
        self.commit(zone).await?;
        info!(zone = %zone_id, "schedule enabled");

        if stop_manual {
            info!(zone = %zone_id, "schedule start forces manual valve off");
            self.switch(&def, false, now).await?;
        }
        Ok(())
    }

    /// Halt whichever path is active. A no-op on a stopped zone.
    pub async fn stop(&mut self, zone_id: &str, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        if !zone.is_running && !zone.actuator_on() {
            return Ok(());
        }

        let was_on = Self::halt(&mut zone);
        let def = zone.def.clone();
        self.commit(zone).await?;
        info!(zone = %zone_id, "zone stopped");

        if was_on {
            self.switch(&def, false, now).await?;
        }
        Ok(())
    }

    /// Fixed-duration spray, independent of the configured cycle. Only
    /// allowed while no other path is driving the zone.
    pub async fn test(&mut self, zone_id: &str, duration_seconds: u32, now: OffsetDateTime) -> HubResult<()> {
        let zone = self.get(zone_id)?;
        if duration_seconds == 0 {
            return invalid("test duration must be positive");
        }
        if zone.is_running || zone.actuator_on() {
            return invalid("zone is running; stop it before a test spray");
        }
        self.check_route(&zone)?;

        info!(zone = %zone_id, duration_seconds, "test spray");
        self.dispatcher
            .send_bound(
                zone.def.controller_id.as_deref(),
                &zone.def.actuator_id,
                Command::test(duration_seconds),
                now,
            )
            .await
    }

    pub async fn save_zone(&mut self, def: ZoneDef, now: OffsetDateTime) -> HubResult<ZoneView> {
        validate_zone(&def)?;

        let Some(actuator) = self.dispatcher.actuator(&def.actuator_id) else {
            return invalid(format!("unknown actuator '{}'", def.actuator_id));
        };
        if let Some(ctl) = &def.controller_id {
            if *ctl != actuator.controller_id {
                return invalid(format!(
                    "actuator '{}' belongs to controller '{}', not '{ctl}'",
                    def.actuator_id, actuator.controller_id
                ));
            }
        }
        if let Some(other) = self
            .zones
            .values()
            .find(|z| z.def.actuator_id == def.actuator_id && z.def.zone_id != def.zone_id)
        {
            return invalid(format!(
                "actuator '{}' is already driven by zone '{}'",
                def.actuator_id,
                other.id()
            ));
        }
        if let Some(g) = self.groups.values().find(|g| g.actuator_ids.contains(&def.actuator_id)) {
            return invalid(format!(
                "actuator '{}' is already driven by group '{}'",
                def.actuator_id, g.group_id
            ));
        }

        let (mut zone, existed) = match self.zones.get(&def.zone_id) {
            Some(z) => (z.clone(), true),
            None => (Zone::new(def.clone()), false),
        };

        // Mode or wiring changed under a live zone: release the old actuator.
        let mut release = None;
        if existed
            && (zone.def.mode != def.mode
                || zone.def.actuator_id != def.actuator_id
                || zone.def.controller_id != def.controller_id)
        {
            let old = zone.def.clone();
            if Self::halt(&mut zone) {
                release = Some(old);
            }
        }

        zone.def = def;
        let zone_id = zone.def.zone_id.clone();
        self.commit(zone).await?;
        info!(zone = %zone_id, created = !existed, "zone saved");

        if let Some(old) = release {
            self.switch(&old, false, now).await?;
        }
        self.zone(&zone_id)
            .ok_or_else(|| HubError::NotFound(format!("zone '{zone_id}'")))
    }

    pub async fn delete_zone(&mut self, zone_id: &str, now: OffsetDateTime) -> HubResult<()> {
        let halted = self.stop(zone_id, now).await;
        if let Err(HubError::NotFound(_)) = halted {
            return halted;
        }
        self.zones.remove(zone_id);
        self.db.delete_zone(zone_id).await?;
        info!(zone = %zone_id, "zone deleted");
        halted
    }

    // -----------------------------------------------------------------------
    // Saved schedules
    // -----------------------------------------------------------------------

    /// Create or replace a saved schedule. Returns the ids of sibling basic
    /// schedules that were switched off.
    pub async fn save_schedule(&mut self, mut s: SavedSchedule) -> HubResult<Vec<String>> {
        validate_saved_schedule(&s)?;
        if !self.groups.contains_key(&s.group_id) {
            return invalid(format!("unknown group '{}'", s.group_id));
        }

        // Stored disabled first; the toggle below flips store and memory together.
        let enable = s.enabled;
        s.enabled = false;
        self.db.upsert_saved_schedule(&s).await?;
        let id = s.id.clone();
        let category = s.category;
        self.schedules.insert(id.clone(), s);
        info!(schedule = %id, category = category.as_str(), enabled = enable, "schedule saved");

        if enable {
            self.toggle_schedule(&id, true).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Enable or disable a saved schedule. Enabling a basic schedule
    /// disables its basic siblings in the same transaction.
    pub async fn toggle_schedule(&mut self, id: &str, enabled: bool) -> HubResult<Vec<String>> {
        let s = self
            .schedules
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("schedule '{id}'")))?;

        let disabled = self.db.set_schedule_enabled(&s, enabled).await?;
        for other in &disabled {
            if let Some(o) = self.schedules.get_mut(other) {
                o.enabled = false;
            }
            info!(schedule = %other, by = %id, "basic schedule disabled by sibling");
        }
        if let Some(me) = self.schedules.get_mut(id) {
            me.enabled = enabled;
        }
        Ok(disabled)
    }

    pub async fn delete_schedule(&mut self, id: &str) -> HubResult<()> {
        if self.schedules.remove(id).is_none() {
            return Err(HubError::NotFound(format!("schedule '{id}'")));
        }
        self.db.delete_saved_schedule(id).await?;
        info!(schedule = %id, "schedule deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schedule engine hooks
    // -----------------------------------------------------------------------

    /// Drive an AUTO zone to the phase the engine computed. Ignored unless
    /// the zone's schedule is live.
    pub async fn apply_zone_phase(&mut self, zone_id: &str, spray: bool, now: OffsetDateTime) -> HubResult<()> {
        let mut zone = self.get(zone_id)?;
        if zone.mode() != Mode::Auto || !zone.is_running || zone.spraying == spray {
            return Ok(());
        }
        if spray && zone.manual_on {
            warn!(zone = %zone_id, "schedule phase skipped: manual valve is on");
            return Ok(());
        }

        zone.spraying = spray;
        let def = zone.def.clone();
        self.commit(zone).await?;
        self.switch(&def, spray, now).await
    }

    pub async fn apply_group_phase(&mut self, group_id: &str, spray: bool, now: OffsetDateTime) -> HubResult<()> {
        let Some(group) = self.groups.get(group_id).cloned() else {
            return Err(HubError::NotFound(format!("group '{group_id}'")));
        };
        if self.group_spraying.get(group_id).copied().unwrap_or(false) == spray {
            return Ok(());
        }
        self.group_spraying.insert(group_id.to_string(), spray);

        let mut first_err = None;
        for actuator_id in &group.actuator_ids {
            let Some(kind) = self.dispatcher.actuator(actuator_id).map(|a| a.kind) else {
                warn!(group = %group_id, actuator = %actuator_id, "group actuator not configured");
                continue;
            };
            if let Err(e) = self
                .dispatcher
                .send(actuator_id, Command::switch(kind, spray), now)
                .await
            {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // -----------------------------------------------------------------------
    // Inbound echo
    // -----------------------------------------------------------------------

    /// OPEN/CLOSE from the actuator. Display only; desired state is untouched.
    pub async fn record_echo(&mut self, actuator_id: &str, open: bool, now: OffsetDateTime) -> anyhow::Result<()> {
        let state = ObservedState {
            open,
            observed_at: now.unix_timestamp(),
        };
        self.observed.insert(actuator_id.to_string(), state);
        self.db.record_observed(actuator_id, open, now).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
