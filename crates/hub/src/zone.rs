//! Zone and saved-schedule definitions, plus the checks run when an operator
//! saves them. Nothing invalid ever reaches the schedule engine.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::schedule::{should_spray, Cycle, TimeOfDay, Window};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    Off,
    Manual,
    Auto,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "MANUAL" => Some(Self::Manual),
            "AUTO" => Some(Self::Auto),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule shapes
// ---------------------------------------------------------------------------

/// Day or night sub-schedule of a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub enabled: bool,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    #[serde(default)]
    pub interval_minutes: u32,
    #[serde(default)]
    pub spray_seconds: u32,
    #[serde(default = "yes")]
    pub infinite_repeat: bool,
}

impl ScheduleWindow {
    fn disabled(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            enabled: false,
            start_time: start,
            end_time: end,
            interval_minutes: 0,
            spray_seconds: 0,
            infinite_repeat: true,
        }
    }

    pub fn default_day() -> Self {
        Self::disabled(TimeOfDay::at_hour(6), TimeOfDay::at_hour(18))
    }

    pub fn default_night() -> Self {
        Self::disabled(TimeOfDay::at_hour(18), TimeOfDay::at_hour(6))
    }

    pub fn should_spray(&self, t: TimeOfDay) -> bool {
        self.enabled
            && should_spray(
                &Window::new(self.start_time, self.end_time),
                &Cycle {
                    spray_secs: self.spray_seconds,
                    idle_secs: self.interval_minutes.saturating_mul(60),
                    repeat: self.infinite_repeat,
                },
                t,
            )
    }
}

/// Independently configured window. Used for a zone's custom slots and for
/// the slots of a saved schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSlot {
    #[serde(default = "yes")]
    pub enabled: bool,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub spray_seconds: u32,
    #[serde(default)]
    pub interval_seconds: u32,
    #[serde(default = "yes")]
    pub infinite_repeat: bool,
}

impl CustomSlot {
    fn window(&self) -> Window {
        Window::new(self.start_time, self.end_time)
    }

    fn cycle(&self) -> Cycle {
        Cycle {
            spray_secs: self.spray_seconds,
            idle_secs: self.interval_seconds,
            repeat: self.infinite_repeat,
        }
    }

    pub fn should_spray(&self, t: TimeOfDay) -> bool {
        self.enabled && should_spray(&self.window(), &self.cycle(), t)
    }
}

fn yes() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

/// What an operator saves for a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDef {
    #[serde(default)]
    pub zone_id: String,
    pub name: String,
    #[serde(default)]
    pub controller_id: Option<String>,
    pub actuator_id: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "ScheduleWindow::default_day")]
    pub day_schedule: ScheduleWindow,
    #[serde(default = "ScheduleWindow::default_night")]
    pub night_schedule: ScheduleWindow,
    #[serde(default)]
    pub custom_slots: Vec<CustomSlot>,
}

impl ZoneDef {
    /// Any enabled sub-schedule in its spray phase.
    pub fn should_spray(&self, t: TimeOfDay) -> bool {
        self.day_schedule.should_spray(t)
            || self.night_schedule.should_spray(t)
            || self.custom_slots.iter().any(|s| s.should_spray(t))
    }

    pub fn has_basic_schedule(&self) -> bool {
        self.day_schedule.enabled || self.night_schedule.enabled
    }
}

/// Zone definition plus the runtime flags owned by the mode arbiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(flatten)]
    pub def: ZoneDef,
    /// Schedule toggle: AUTO evaluation is live.
    pub is_running: bool,
    /// Manual valve desired on.
    pub manual_on: bool,
    /// Schedule engine currently holds the actuator on.
    pub spraying: bool,
}

impl Zone {
    pub fn new(def: ZoneDef) -> Self {
        Self {
            def,
            is_running: false,
            manual_on: false,
            spraying: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.def.zone_id
    }

    pub fn mode(&self) -> Mode {
        self.def.mode
    }

    pub fn actuator_on(&self) -> bool {
        self.manual_on || self.spraying
    }
}

// ---------------------------------------------------------------------------
// Saved schedules (shared actuator groups)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Day,
    Night,
    Both,
    Custom,
}

impl Category {
    /// Basic schedules are mutually exclusive within a group.
    pub fn is_basic(self) -> bool {
        !matches!(self, Self::Custom)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Night => "night",
            Self::Both => "both",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSchedule {
    #[serde(default)]
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub slots: Vec<CustomSlot>,
}

impl SavedSchedule {
    pub fn should_spray(&self, t: TimeOfDay) -> bool {
        if !self.enabled {
            return false;
        }
        self.slots.iter().filter(|s| s.enabled).any(|s| {
            let window = match self.category {
                Category::Both => Window::all_day(s.start_time),
                _ => s.window(),
            };
            should_spray(&window, &s.cycle(), t)
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_window(label: &str, w: &ScheduleWindow, errors: &mut Vec<String>) {
    if !w.enabled {
        return;
    }
    if w.interval_minutes == 0 {
        errors.push(format!("{label} schedule needs a positive interval_minutes"));
    }
    if w.spray_seconds == 0 {
        errors.push(format!("{label} schedule needs a positive spray_seconds"));
    }
    if w.start_time == w.end_time {
        errors.push(format!("{label} schedule start and end time must differ"));
    }
}

fn check_slot_cycle(i: usize, s: &CustomSlot, errors: &mut Vec<String>) {
    if s.spray_seconds == 0 {
        errors.push(format!("slot {}: spray_seconds must be positive", i + 1));
    }
}

/// Custom slots: `start < end` on the same day, positive spray time, and no
/// two enabled slots overlapping on `[start, end)`.
fn check_custom_slots(slots: &[CustomSlot], errors: &mut Vec<String>) {
    for (i, s) in slots.iter().enumerate() {
        if s.start_time >= s.end_time {
            errors.push(format!(
                "slot {} ({}-{}): end time must be after start time",
                i + 1,
                s.start_time,
                s.end_time
            ));
        }
        check_slot_cycle(i, s, errors);
    }

    let enabled: Vec<(usize, &CustomSlot)> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.enabled && s.start_time < s.end_time)
        .collect();
    for (a, (i, x)) in enabled.iter().enumerate() {
        for (j, y) in enabled.iter().skip(a + 1) {
            if x.window().overlaps(&y.window()) {
                errors.push(format!(
                    "schedule overlaps: slot {} ({}-{}) and slot {} ({}-{})",
                    i + 1,
                    x.start_time,
                    x.end_time,
                    j + 1,
                    y.start_time,
                    y.end_time
                ));
            }
        }
    }
}

fn finish(errors: Vec<String>) -> Result<(), ValidationError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(errors.join("; ")))
    }
}

pub fn validate_zone(z: &ZoneDef) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if z.zone_id.trim().is_empty() {
        errors.push("zone_id is empty".to_string());
    }
    if z.name.trim().is_empty() {
        errors.push("name is empty".to_string());
    }
    if z.actuator_id.trim().is_empty() {
        errors.push("actuator_id is empty".to_string());
    }

    check_window("day", &z.day_schedule, &mut errors);
    check_window("night", &z.night_schedule, &mut errors);
    check_custom_slots(&z.custom_slots, &mut errors);

    if z.mode == Mode::Auto && !z.has_basic_schedule() {
        errors.push("auto mode needs the day or night schedule enabled".to_string());
    }

    finish(errors)
}

pub fn validate_saved_schedule(s: &SavedSchedule) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if s.id.trim().is_empty() {
        errors.push("schedule id is empty".to_string());
    }
    if s.name.trim().is_empty() {
        errors.push("schedule name is empty".to_string());
    }
    if s.slots.is_empty() {
        errors.push("schedule has no slots".to_string());
    }

    match s.category {
        Category::Custom => check_custom_slots(&s.slots, &mut errors),
        Category::Day | Category::Night => {
            for (i, slot) in s.slots.iter().enumerate() {
                if slot.start_time == slot.end_time {
                    errors.push(format!("slot {}: start and end time must differ", i + 1));
                }
                check_slot_cycle(i, slot, &mut errors);
            }
        }
        Category::Both => {
            for (i, slot) in s.slots.iter().enumerate() {
                check_slot_cycle(i, slot, &mut errors);
            }
        }
    }

    finish(errors)
}

// ===========================================================================
// Tests
// ===========================================================================
