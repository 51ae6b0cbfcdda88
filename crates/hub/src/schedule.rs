//! Stateless spray-cycle evaluation.
//!
//! Whether an actuator should be spraying is a pure function of the cycle
//! definition and the local time of day:
//!
//! ```text
//! window  [start ─────────────────────────── end)
//! cycle    |spray|  idle  |spray|  idle  |spray| ...
//! phase  = (now - start) mod (spray + idle)
//! on     = phase < spray
//! ```
//!
//! Nothing is remembered between ticks, so a restart mid-window resumes at
//! exactly the same phase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const SECS_PER_DAY: u32 = 86_400;

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Seconds since local midnight, written as `HH:MM` or `HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u32);

impl TimeOfDay {
    pub const fn at_hour(h: u32) -> Self {
        Self(h % 24 * 3600)
    }

    pub fn hms(h: u32, m: u32, s: u32) -> Option<Self> {
        (h < 24 && m < 60 && s < 60).then(|| Self(h * 3600 + m * 60 + s))
    }

    pub fn of(now: OffsetDateTime) -> Self {
        let (h, m, s) = now.time().as_hms();
        Self(u32::from(h) * 3600 + u32::from(m) * 60 + u32::from(s))
    }

    pub fn secs(self) -> u32 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid time of day '{s}' (expected HH:MM or HH:MM:SS)");
        let parts: Vec<&str> = s.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(bad());
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(bad());
            }
            *slot = part.parse().map_err(|_| bad())?;
        }
        Self::hms(nums[0], nums[1], nums[2]).ok_or_else(bad)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, m, s) = (self.0 / 3600, self.0 / 60 % 60, self.0 % 60);
        if s == 0 {
            write!(f, "{h:02}:{m:02}")
        } else {
            write!(f, "{h:02}:{m:02}:{s:02}")
        }
    }
}

// ---------------------------------------------------------------------------
// Windows and cycles
// ---------------------------------------------------------------------------

/// Half-open daily window `[start, end)`. `end < start` wraps past midnight;
/// `start == end` covers the whole day, anchored at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Window {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    pub fn all_day(anchor: TimeOfDay) -> Self {
        Self {
            start: anchor,
            end: anchor,
        }
    }

    pub fn contains(&self, t: TimeOfDay) -> bool {
        let (s, e, t) = (self.start.0, self.end.0, t.0);
        if s < e {
            s <= t && t < e
        } else if s > e {
            t >= s || t < e
        } else {
            true
        }
    }

    /// Seconds since the window opened, modulo one day.
    pub fn elapsed(&self, t: TimeOfDay) -> u32 {
        (t.0 + SECS_PER_DAY - self.start.0) % SECS_PER_DAY
    }

    /// Same-day, non-wrapping overlap on half-open intervals; touching ends
    /// do not overlap.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub spray_secs: u32,
    pub idle_secs: u32,
    pub repeat: bool,
}

impl Cycle {
    pub fn period(&self) -> u32 {
        self.spray_secs.saturating_add(self.idle_secs)
    }
}

/// True when the cycle is in its spray phase at `t`.
pub fn should_spray(window: &Window, cycle: &Cycle, t: TimeOfDay) -> bool {
    if !window.contains(t) || cycle.spray_secs == 0 {
        return false;
    }
    let elapsed = window.elapsed(t);
    if !cycle.repeat {
        return elapsed < cycle.spray_secs;
    }
    // Validation rejects a zero period; this only keeps the modulo total.
    match cycle.period() {
        0 => false,
        period => elapsed % period < cycle.spray_secs,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tod(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn day_cycle() -> (Window, Cycle) {
        (
            Window::new(tod("06:00"), tod("18:00")),
            Cycle {
                spray_secs: 10,
                idle_secs: 300,
                repeat: true,
            },
        )
    }

    // -- TimeOfDay ------------------------------------------------------------

    #[test]
    fn parses_hours_minutes_and_seconds() {
        assert_eq!(tod("06:00").secs(), 6 * 3600);
        assert_eq!(tod("23:59:59").secs(), SECS_PER_DAY - 1);
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
        assert!("6".parse::<TimeOfDay>().is_err());
        assert!("1:2:3:4".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn displays_compactly() {
        assert_eq!(tod("6:05").to_string(), "06:05");
        assert_eq!(tod("18:00:30").to_string(), "18:00:30");
    }

    #[test]
    fn deserializes_from_json_string() {
        let t: TimeOfDay = serde_json::from_str("\"07:30\"").unwrap();
        assert_eq!(t, tod("07:30"));
        assert!(serde_json::from_str::<TimeOfDay>("\"25:00\"").is_err());
    }

    // -- Window containment ----------------------------------------------------

    #[test]
    fn day_window_is_half_open() {
        let w = Window::new(tod("06:00"), tod("18:00"));
        assert!(w.contains(tod("06:00")));
        assert!(w.contains(tod("17:59:59")));
        assert!(!w.contains(tod("18:00")));
        assert!(!w.contains(tod("05:59:59")));
    }

    #[test]
    fn night_window_wraps_midnight() {
        let w = Window::new(tod("18:00"), tod("06:00"));
        assert!(w.contains(tod("23:59:59")));
        assert!(w.contains(tod("00:00:01")));
        assert!(!w.contains(tod("06:00:01")));
        assert!(!w.contains(tod("17:59:59")));
    }

    #[test]
    fn equal_bounds_cover_whole_day() {
        let w = Window::all_day(tod("00:00"));
        assert!(w.contains(tod("00:00")));
        assert!(w.contains(tod("12:34:56")));
        assert!(w.contains(tod("23:59:59")));
    }

    #[test]
    fn elapsed_counts_across_midnight() {
        let w = Window::new(tod("18:00"), tod("06:00"));
        assert_eq!(w.elapsed(tod("00:00:01")), 6 * 3600 + 1);
    }

    #[test]
    fn touching_windows_do_not_overlap() {
        let a = Window::new(tod("08:00"), tod("10:00"));
        assert!(a.overlaps(&Window::new(tod("09:00"), tod("11:00"))));
        assert!(!a.overlaps(&Window::new(tod("10:00"), tod("12:00"))));
    }

    // -- Cycle phase -------------------------------------------------------------

    #[test]
    fn sprays_at_start_of_cycle() {
        let (w, c) = day_cycle();
        assert!(should_spray(&w, &c, tod("06:00:05")));
    }

    #[test]
    fn idles_after_spray_phase() {
        let (w, c) = day_cycle();
        assert!(!should_spray(&w, &c, tod("06:05:00")));
    }

    #[test]
    fn repeats_every_period() {
        let (w, c) = day_cycle();
        // second cycle starts at 06:00 + 310s = 06:05:10
        assert!(should_spray(&w, &c, tod("06:05:10")));
        assert!(should_spray(&w, &c, tod("06:05:19")));
        assert!(!should_spray(&w, &c, tod("06:05:20")));
    }

    #[test]
    fn never_sprays_outside_window() {
        let (w, c) = day_cycle();
        assert!(!should_spray(&w, &c, tod("18:00:00")));
        assert!(!should_spray(&w, &c, tod("03:00:00")));
    }

    #[test]
    fn single_shot_sprays_once() {
        let (w, mut c) = day_cycle();
        c.repeat = false;
        assert!(should_spray(&w, &c, tod("06:00:09")));
        assert!(!should_spray(&w, &c, tod("06:05:10")));
    }

    #[test]
    fn night_cycle_continues_after_midnight() {
        let w = Window::new(tod("18:00"), tod("06:00"));
        let c = Cycle {
            spray_secs: 60,
            idle_secs: 3540,
            repeat: true,
        };
        // hourly cycle anchored at 18:00 → sprays in the first minute of each hour
        assert!(should_spray(&w, &c, tod("00:00:30")));
        assert!(!should_spray(&w, &c, tod("00:01:30")));
    }

    #[test]
    fn zero_period_never_sprays() {
        let w = Window::all_day(TimeOfDay::at_hour(0));
        let c = Cycle {
            spray_secs: 0,
            idle_secs: 0,
            repeat: true,
        };
        assert!(!should_spray(&w, &c, tod("12:00")));
    }
}
