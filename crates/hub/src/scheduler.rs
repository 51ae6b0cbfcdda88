//! Schedule engine: each tick turns "what time is it" into on/off phases for
//! every live AUTO zone and every group with an enabled saved schedule, and
//! hands the differences to the mode arbiter.
//!
//! The engine keeps no memory of its own. Phase comes from
//! `schedule::should_spray`; the only state consulted is the arbiter's
//! record of what it last drove, so a restart resumes mid-cycle without
//! replaying anything.
//!
//! Ticks run under the same write lock as operator commands, so an operator
//! transition that lands first is always seen by the next evaluation.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::arbiter::ModeArbiter;
use crate::error::HubError;
use crate::schedule::TimeOfDay;
use crate::state::{SharedState, SystemState};
use crate::zone::Mode;

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Plan {
    /// (zone_id, spray) for zones whose phase changed.
    pub(crate) zones: Vec<(String, bool)>,
    /// (group_id, spray) for groups whose phase changed.
    pub(crate) groups: Vec<(String, bool)>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.zones.is_empty() && self.groups.is_empty()
    }
}

/// Pure: compare the computed phase with what the arbiter last drove.
pub(crate) fn plan(arbiter: &ModeArbiter, t: TimeOfDay) -> Plan {
    let zones = arbiter
        .zone_records()
        .filter(|z| z.mode() == Mode::Auto && z.is_running)
        .filter_map(|z| {
            let spray = z.def.should_spray(t);
            (spray != z.spraying).then(|| (z.id().to_string(), spray))
        })
        .collect();

    let groups = arbiter
        .groups()
        .into_iter()
        .filter_map(|g| {
            let spray = arbiter
                .schedule_records()
                .filter(|s| s.group_id == g.group.group_id)
                .any(|s| s.should_spray(t));
            (spray != g.spraying).then_some((g.group.group_id, spray))
        })
        .collect();

    Plan { zones, groups }
}

/// One evaluation pass at the clock's current instant. Returns the number of
/// phase changes applied.
pub async fn tick(st: &mut SystemState) -> usize {
    let now = st.now();
    let plan = plan(&st.arbiter, TimeOfDay::of(now));
    if plan.is_empty() {
        return 0;
    }

    let mut applied = 0;
    for (zone_id, spray) in &plan.zones {
        let result = st.arbiter.apply_zone_phase(zone_id, *spray, now).await;
        applied += report(st, "zone", zone_id, *spray, now, result);
    }
    for (group_id, spray) in &plan.groups {
        let result = st.arbiter.apply_group_phase(group_id, *spray, now).await;
        applied += report(st, "group", group_id, *spray, now, result);
    }
    applied
}

fn report(
    st: &mut SystemState,
    what: &str,
    id: &str,
    spray: bool,
    now: OffsetDateTime,
    result: Result<(), HubError>,
) -> usize {
    let phase = if spray { "spray" } else { "idle" };
    match result {
        Ok(()) => {
            info!(target_kind = what, id = %id, phase, at = %TimeOfDay::of(now), "schedule phase change");
            st.record_scheduler(format!("{what} {id}: {phase}"));
            1
        }
        // Logical phase stands; the desired state is pending re-publish.
        Err(HubError::Transport(e)) => {
            warn!(target_kind = what, id = %id, phase, "schedule command not delivered: {e}");
            st.record_scheduler(format!("{what} {id}: {phase} (pending: {e})"));
            1
        }
        Err(e) => {
            error!(target_kind = what, id = %id, phase, "schedule phase rejected: {e}");
            st.record_error(format!("{what} {id}: {e}"));
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the engine loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(shared: SharedState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(tick_ms = every.as_millis() as u64, "scheduler started");
    {
        let mut st = shared.write().await;
        st.record_scheduler(format!("scheduler started (tick {}ms)", every.as_millis()));
    }

    loop {
        ticker.tick().await;
        let mut st = shared.write().await;
        tick(&mut st).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::tests::NOW;
    use crate::dispatch::tests::RecordingPublisher;
    use crate::state::tests::test_state;
    use crate::zone::tests::{slot, tod, zone_def};
    use crate::zone::{Category, SavedSchedule};
    use time::macros::datetime;

    fn payloads(p: &RecordingPublisher) -> Vec<String> {
        p.sent().into_iter().map(|(_, body)| body).collect()
    }

    // -- Zones -------------------------------------------------------------------

    #[tokio::test]
    async fn auto_zone_follows_cycle() {
        let (mut st, p, clock) = test_state().await;
        st.arbiter.start("z1", NOW).await.unwrap();

        // 06:00:05, 5s into a 10s spray
        assert_eq!(tick(&mut st).await, 1);
        clock.advance(Duration::from_secs(3));
        assert_eq!(tick(&mut st).await, 0);

        // 06:00:15, idle
        clock.advance(Duration::from_secs(7));
        assert_eq!(tick(&mut st).await, 1);
        assert_eq!(payloads(&p), vec![r#"{"power":"on"}"#, r#"{"power":"off"}"#]);
    }

    #[tokio::test]
    async fn idle_zone_is_not_evaluated() {
        let (mut st, p, _clock) = test_state().await;
        assert_eq!(tick(&mut st).await, 0);

        st.arbiter.set_mode("z1", Mode::Auto, NOW).await.unwrap();
        assert_eq!(tick(&mut st).await, 0);
        assert!(p.sent().is_empty());
    }

    #[tokio::test]
    async fn restart_resumes_mid_cycle() {
        let (mut st, p, clock) = test_state().await;
        st.arbiter.start("z1", NOW).await.unwrap();

        // period 310s: 06:05:10 starts the second spray
        clock.set(datetime!(2024-06-01 06:05:12 UTC));
        assert_eq!(tick(&mut st).await, 1);
        assert!(st.arbiter.zone("z1").unwrap().zone.spraying);
        assert_eq!(payloads(&p), vec![r#"{"power":"on"}"#]);
    }

    #[tokio::test]
    async fn night_window_wraps_midnight() {
        let (mut st, p, clock) = test_state().await;
        let mut def = zone_def("z1");
        def.day_schedule.enabled = false;
        def.night_schedule.enabled = true;
        def.night_schedule.start_time = tod("22:00");
        def.night_schedule.end_time = tod("02:00");
        def.night_schedule.interval_minutes = 1;
        def.night_schedule.spray_seconds = 20;
        st.arbiter.save_zone(def, NOW).await.unwrap();
        st.arbiter.start("z1", NOW).await.unwrap();

        // 00:30:05 is 9005s past 22:00; 9005 mod 80 = 45, idle
        clock.set(datetime!(2024-06-02 00:30:05 UTC));
        assert_eq!(tick(&mut st).await, 0);

        // 00:30:40 -> 9040 mod 80 = 0, spraying
        clock.set(datetime!(2024-06-02 00:30:40 UTC));
        assert_eq!(tick(&mut st).await, 1);

        // 02:00:00 is outside the window
        clock.set(datetime!(2024-06-02 02:00:00 UTC));
        assert_eq!(tick(&mut st).await, 1);
        assert_eq!(payloads(&p), vec![r#"{"power":"on"}"#, r#"{"power":"off"}"#]);
    }

    #[tokio::test]
    async fn operator_action_wins_over_next_tick() {
        let (mut st, p, _clock) = test_state().await;
        st.arbiter.start("z1", NOW).await.unwrap();
        st.arbiter.manual_spray("z1", NOW).await.unwrap();
        p.clear();

        assert_eq!(tick(&mut st).await, 0);
        assert!(p.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_still_advances_phase() {
        let (mut st, p, clock) = test_state().await;
        st.arbiter.start("z1", NOW).await.unwrap();
        p.set_down(true);

        assert_eq!(tick(&mut st).await, 1);
        let view = st.arbiter.zone("z1").unwrap();
        assert!(view.zone.spraying);
        assert!(view.pending);

        // not re-sent every tick
        clock.advance(Duration::from_secs(1));
        assert_eq!(tick(&mut st).await, 0);
        assert!(st.events.iter().any(|e| e.detail.contains("pending")));
    }

    // -- Groups ------------------------------------------------------------------

    #[tokio::test]
    async fn group_schedule_drives_all_members() {
        let (mut st, p, clock) = test_state().await;
        st.arbiter
            .save_schedule(SavedSchedule {
                id: "fans-day".into(),
                group_id: "fans".into(),
                name: "Fans by day".into(),
                category: Category::Day,
                enabled: true,
                slots: vec![slot("08:00", "10:00")],
            })
            .await
            .unwrap();

        assert_eq!(tick(&mut st).await, 0);

        clock.set(datetime!(2024-06-01 08:00:01 UTC));
        assert_eq!(tick(&mut st).await, 1);
        assert_eq!(payloads(&p), vec![r#"{"power":"on"}"#, r#"{"target":100}"#]);

        st.arbiter.toggle_schedule("fans-day", false).await.unwrap();
        assert_eq!(tick(&mut st).await, 1);
        assert_eq!(p.sent().len(), 4);
    }

    #[test]
    fn plan_is_empty_without_live_schedules() {
        assert!(Plan::default().is_empty());
    }
}
