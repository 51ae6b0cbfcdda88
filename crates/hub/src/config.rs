//! TOML config file loading, validation, and database seeding for
//! controllers, actuators, groups and zones.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use time::UtcOffset;

use crate::arbiter::Group;
use crate::db::Db;
use crate::dispatch::{Actuator, ActuatorKind};
use crate::zone::{validate_zone, ZoneDef};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub controllers: Vec<ControllerEntry>,
    #[serde(default)]
    pub actuators: Vec<ActuatorEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    /// Seed zones. Only inserted when the store has no record yet.
    #[serde(default)]
    pub zones: Vec<ZoneDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub liveness_timeout_secs: u64,
    pub liveness_tick_secs: u64,
    pub schedule_tick_secs: u64,
    /// Local time offset used for time-of-day schedules.
    pub utc_offset_minutes: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 30,
            liveness_tick_secs: 5,
            schedule_tick_secs: 1,
            utc_offset_minutes: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes.saturating_mul(60))
            .with_context(|| format!("utc_offset_minutes {} out of range", self.utc_offset_minutes))
    }
}

#[derive(Debug, Deserialize)]
pub struct ControllerEntry {
    pub controller_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ActuatorEntry {
    pub actuator_id: String,
    pub controller_id: String,
    #[serde(default = "binary")]
    pub kind: ActuatorKind,
    pub command_topic: Option<String>,
    pub status_topic: Option<String>,
}

fn binary() -> ActuatorKind {
    ActuatorKind::Binary
}

#[derive(Debug, Deserialize)]
pub struct GroupEntry {
    pub group_id: String,
    pub name: String,
    pub actuator_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

impl ActuatorEntry {
    pub fn to_actuator(&self) -> Actuator {
        Actuator {
            actuator_id: self.actuator_id.clone(),
            controller_id: self.controller_id.clone(),
            kind: self.kind,
            command_topic: self
                .command_topic
                .clone()
                .unwrap_or_else(|| format!("actuator/{}/set", self.actuator_id)),
            status_topic: self
                .status_topic
                .clone()
                .unwrap_or_else(|| format!("actuator/{}/state", self.actuator_id)),
        }
    }
}

impl Config {
    pub fn actuators(&self) -> Vec<Actuator> {
        self.actuators.iter().map(ActuatorEntry::to_actuator).collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups
            .iter()
            .map(|g| Group {
                group_id: g.group_id.clone(),
                name: g.name.clone(),
                actuator_ids: g.actuator_ids.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_runtime(&mut errors);
        self.validate_controllers(&mut errors);
        self.validate_actuators(&mut errors);
        self.validate_ownership(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        let r = &self.runtime;
        if r.liveness_timeout_secs == 0 {
            errors.push("runtime: liveness_timeout_secs must be positive".into());
        }
        if r.liveness_tick_secs == 0 {
            errors.push("runtime: liveness_tick_secs must be positive".into());
        } else if r.liveness_timeout_secs > 0 && r.liveness_tick_secs >= r.liveness_timeout_secs {
            errors.push(format!(
                "runtime: liveness_tick_secs ({}) must be shorter than liveness_timeout_secs ({})",
                r.liveness_tick_secs, r.liveness_timeout_secs
            ));
        }
        if r.schedule_tick_secs == 0 {
            errors.push("runtime: schedule_tick_secs must be positive".into());
        }
        if r.utc_offset().is_err() {
            errors.push(format!(
                "runtime: utc_offset_minutes {} out of range",
                r.utc_offset_minutes
            ));
        }
    }

    fn validate_controllers(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, c) in self.controllers.iter().enumerate() {
            if c.controller_id.trim().is_empty() {
                errors.push(format!("controllers[{i}]: controller_id is empty"));
            } else if !seen_ids.insert(&c.controller_id) {
                errors.push(format!("controller '{}': duplicate controller_id", c.controller_id));
            }
        }
    }

    fn validate_actuators(&self, errors: &mut Vec<String>) {
        let controller_ids: HashSet<&str> = self
            .controllers
            .iter()
            .map(|c| c.controller_id.as_str())
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut command_topics: HashMap<String, &str> = HashMap::new();
        let mut status_topics: HashMap<String, &str> = HashMap::new();

        for (i, a) in self.actuators.iter().enumerate() {
            let ctx = || {
                if a.actuator_id.is_empty() {
                    format!("actuators[{i}]")
                } else {
                    format!("actuator '{}'", a.actuator_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if a.actuator_id.trim().is_empty() {
                errors.push(format!("{}: actuator_id is empty", ctx()));
            } else if !seen_ids.insert(&a.actuator_id) {
                errors.push(format!("{}: duplicate actuator_id", ctx()));
            }

            if !controller_ids.contains(a.controller_id.as_str()) {
                errors.push(format!(
                    "{}: controller_id '{}' does not match any defined controller",
                    ctx(),
                    a.controller_id
                ));
            }

            // ── Topics ──────────────────────────────────────────
            let resolved = a.to_actuator();
            if let Some(other) = command_topics.insert(resolved.command_topic.clone(), &a.actuator_id) {
                errors.push(format!(
                    "{}: command_topic '{}' is already used by actuator '{other}'",
                    ctx(),
                    resolved.command_topic
                ));
            }
            if let Some(other) = status_topics.insert(resolved.status_topic.clone(), &a.actuator_id) {
                errors.push(format!(
                    "{}: status_topic '{}' is already used by actuator '{other}'",
                    ctx(),
                    resolved.status_topic
                ));
            }
            if resolved.command_topic == resolved.status_topic {
                errors.push(format!(
                    "{}: command_topic and status_topic are both '{}'",
                    ctx(),
                    resolved.command_topic
                ));
            }
        }
    }

    /// Every actuator is driven by at most one zone or group.
    fn validate_ownership(&self, errors: &mut Vec<String>) {
        let actuators: HashMap<&str, &ActuatorEntry> = self
            .actuators
            .iter()
            .map(|a| (a.actuator_id.as_str(), a))
            .collect();
        let mut owners: HashMap<&str, String> = HashMap::new();

        let mut seen_groups: HashSet<&str> = HashSet::new();
        for (i, g) in self.groups.iter().enumerate() {
            let ctx = if g.group_id.is_empty() {
                format!("groups[{i}]")
            } else {
                format!("group '{}'", g.group_id)
            };
            if g.group_id.trim().is_empty() {
                errors.push(format!("{ctx}: group_id is empty"));
            } else if !seen_groups.insert(&g.group_id) {
                errors.push(format!("{ctx}: duplicate group_id"));
            }
            if g.actuator_ids.is_empty() {
                errors.push(format!("{ctx}: actuator_ids is empty"));
            }
            for a in &g.actuator_ids {
                if !actuators.contains_key(a.as_str()) {
                    errors.push(format!("{ctx}: actuator '{a}' is not defined"));
                } else if let Some(prev) = owners.insert(a, ctx.clone()) {
                    errors.push(format!("{ctx}: actuator '{a}' is already driven by {prev}"));
                }
            }
        }

        let mut seen_zones: HashSet<&str> = HashSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            let ctx = if z.zone_id.is_empty() {
                format!("zones[{i}]")
            } else {
                format!("zone '{}'", z.zone_id)
            };
            if !z.zone_id.is_empty() && !seen_zones.insert(&z.zone_id) {
                errors.push(format!("{ctx}: duplicate zone_id"));
            }
            if let Err(e) = validate_zone(z) {
                errors.push(format!("{ctx}: {e}"));
            }

            match actuators.get(z.actuator_id.as_str()) {
                None => errors.push(format!(
                    "{ctx}: actuator '{}' is not defined",
                    z.actuator_id
                )),
                Some(a) => {
                    if let Some(ctl) = &z.controller_id {
                        if *ctl != a.controller_id {
                            errors.push(format!(
                                "{ctx}: actuator '{}' belongs to controller '{}', not '{ctl}'",
                                z.actuator_id, a.controller_id
                            ));
                        }
                    }
                    if let Some(prev) = owners.insert(&z.actuator_id, ctx.clone()) {
                        errors.push(format!(
                            "{ctx}: actuator '{}' is already driven by {prev}",
                            z.actuator_id
                        ));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed zones from the config. Zones the operator already saved are left
/// alone.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut seeded = 0;
    for z in &config.zones {
        if db
            .seed_zone(z)
            .await
            .with_context(|| format!("failed to seed zone '{}'", z.zone_id))?
        {
            seeded += 1;
        }
    }

    tracing::info!(
        controllers = config.controllers.len(),
        actuators = config.actuators.len(),
        groups = config.groups.len(),
        zones_seeded = seeded,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::zone::tests::zone_def;
    use crate::zone::Mode;

    const SAMPLE: &str = r#"
[runtime]
liveness_timeout_secs = 30
utc_offset_minutes = 120

[[controllers]]
controller_id = "ctl-1"
name = "Greenhouse A"

[[controllers]]
controller_id = "ctl-2"
name = "Fan bank"

[[actuators]]
actuator_id = "mist-z1"
controller_id = "ctl-1"

[[actuators]]
actuator_id = "fan-1"
controller_id = "ctl-2"

[[actuators]]
actuator_id = "vent-1"
controller_id = "ctl-2"
kind = "percentage"
command_topic = "vents/1/cmd"

[[groups]]
group_id = "fans"
name = "Fans"
actuator_ids = ["fan-1", "vent-1"]

[[zones]]
zone_id = "z1"
name = "Bench 1"
controller_id = "ctl-1"
actuator_id = "mist-z1"
mode = "AUTO"

[zones.day_schedule]
enabled = true
start_time = "06:00"
end_time = "18:00"
interval_minutes = 5
spray_seconds = 10
"#;

    fn valid_config() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let cfg = valid_config();
        assert_eq!(cfg.controllers.len(), 2);
        assert_eq!(cfg.runtime.liveness_tick_secs, 5);
        assert_eq!(cfg.runtime.utc_offset().unwrap().whole_minutes(), 120);
        assert_eq!(cfg.zones[0].mode, Mode::Auto);
        assert!(cfg.zones[0].day_schedule.enabled);
        assert!(!cfg.zones[0].night_schedule.enabled);
    }

    #[test]
    fn parse_empty_config() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.zones.is_empty());
        assert_eq!(cfg.runtime.liveness_timeout_secs, 30);
        assert_eq!(cfg.runtime.schedule_tick_secs, 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn actuator_topics_default_from_id() {
        let cfg = valid_config();
        let acts = cfg.actuators();
        assert_eq!(acts[0].command_topic, "actuator/mist-z1/set");
        assert_eq!(acts[0].status_topic, "actuator/mist-z1/state");
        assert_eq!(acts[2].command_topic, "vents/1/cmd");
        assert_eq!(acts[2].kind, ActuatorKind::Percentage);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn runtime_tick_must_be_shorter_than_timeout() {
        let mut cfg = valid_config();
        cfg.runtime.liveness_tick_secs = 30;
        assert_validation_err(&cfg, "must be shorter than liveness_timeout_secs");
    }

    #[test]
    fn runtime_offset_out_of_range() {
        let mut cfg = valid_config();
        cfg.runtime.utc_offset_minutes = 60 * 30;
        assert_validation_err(&cfg, "utc_offset_minutes 1800 out of range");
    }

    #[test]
    fn duplicate_controller_rejected() {
        let mut cfg = valid_config();
        cfg.controllers.push(ControllerEntry {
            controller_id: "ctl-1".into(),
            name: String::new(),
        });
        assert_validation_err(&cfg, "controller 'ctl-1': duplicate controller_id");
    }

    #[test]
    fn actuator_unknown_controller_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[0].controller_id = "ctl-9".into();
        assert_validation_err(&cfg, "controller_id 'ctl-9' does not match any defined controller");
    }

    #[test]
    fn actuator_topic_collision_rejected() {
        let mut cfg = valid_config();
        cfg.actuators[1].command_topic = Some("vents/1/cmd".into());
        assert_validation_err(&cfg, "command_topic 'vents/1/cmd' is already used by actuator 'fan-1'");
    }

    #[test]
    fn zone_and_group_may_not_share_actuator() {
        let mut cfg = valid_config();
        cfg.groups[0].actuator_ids.push("mist-z1".into());
        assert_validation_err(&cfg, "actuator 'mist-z1' is already driven by group 'fans'");
    }

    #[test]
    fn two_zones_may_not_share_actuator() {
        let mut cfg = valid_config();
        let mut z2 = zone_def("z2");
        z2.actuator_id = "mist-z1".into();
        cfg.zones.push(z2);
        assert_validation_err(&cfg, "actuator 'mist-z1' is already driven by zone 'z1'");
    }

    #[test]
    fn zone_controller_mismatch_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].controller_id = Some("ctl-2".into());
        assert_validation_err(&cfg, "belongs to controller 'ctl-1', not 'ctl-2'");
    }

    #[test]
    fn invalid_zone_schedule_reported_with_context() {
        let mut cfg = valid_config();
        cfg.zones[0].day_schedule.interval_minutes = 0;
        assert_validation_err(&cfg, "zone 'z1': day schedule needs a positive interval_minutes");
    }

    #[test]
    fn group_unknown_actuator_rejected() {
        let mut cfg = valid_config();
        cfg.groups[0].actuator_ids.push("pump-9".into());
        assert_validation_err(&cfg, "group 'fans': actuator 'pump-9' is not defined");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.runtime.schedule_tick_secs = 0;
        cfg.actuators[1].controller_id = "nope".into();
        cfg.groups[0].actuator_ids.clear();

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("schedule_tick_secs must be positive"));
        assert!(msg.contains("does not match any defined controller"));
        assert!(msg.contains("actuator_ids is empty"));
    }

    // -- Apply --------------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_without_clobbering() {
        let db = memory_db().await;
        let cfg = valid_config();
        apply(&cfg, &db).await.unwrap();
        assert_eq!(db.load_zones().await.unwrap().len(), 1);

        let mut edited = db.get_zone("z1").await.unwrap().unwrap();
        edited.def.name = "Operator name".into();
        db.upsert_zone(&edited).await.unwrap();

        apply(&cfg, &db).await.unwrap();
        assert_eq!(
            db.get_zone("z1").await.unwrap().unwrap().def.name,
            "Operator name"
        );
    }
}
