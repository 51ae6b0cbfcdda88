//! State store: zone and saved-schedule records, desired state per actuator,
//! and the last observed echo. Liveness is never persisted.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::dispatch::Command;
use crate::zone::{SavedSchedule, Zone, ZoneDef};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    pub actuator_id: String,
    pub command: Command,
    pub recorded_at: i64,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub open: bool,
    pub observed_at: i64,
}

#[derive(FromRow)]
struct ZoneRow {
    definition: String,
    is_running: bool,
    manual_on: bool,
    spraying: bool,
}

impl ZoneRow {
    fn into_zone(self) -> Result<Zone> {
        let def: ZoneDef =
            serde_json::from_str(&self.definition).context("corrupt zone definition")?;
        Ok(Zone {
            def,
            is_running: self.is_running,
            manual_on: self.manual_on,
            spraying: self.spraying,
        })
    }
}

#[derive(FromRow)]
struct ScheduleRow {
    enabled: bool,
    definition: String,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<SavedSchedule> {
        let mut s: SavedSchedule =
            serde_json::from_str(&self.definition).context("corrupt schedule definition")?;
        s.enabled = self.enabled;
        Ok(s)
    }
}

#[derive(FromRow)]
struct DesiredRow {
    actuator_id: String,
    command: String,
    recorded_at: i64,
    pending: bool,
}

impl DesiredRow {
    fn into_desired(self) -> Result<DesiredState> {
        Ok(DesiredState {
            command: serde_json::from_str(&self.command)
                .with_context(|| format!("corrupt desired state for {}", self.actuator_id))?,
            actuator_id: self.actuator_id,
            recorded_at: self.recorded_at,
            pending: self.pending,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/misting/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to ":memory:" is a separate database.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        let definition = serde_json::to_string(&z.def).context("encode zone")?;
        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, definition, is_running, manual_on, spraying, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              definition=excluded.definition,
              is_running=excluded.is_running,
              manual_on=excluded.manual_on,
              spraying=excluded.spraying,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&z.def.zone_id)
        .bind(definition)
        .bind(z.is_running)
        .bind(z.manual_on)
        .bind(z.spraying)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    /// Insert a zone from config unless the operator already owns a record
    /// for it. Returns true when a row was created.
    pub async fn seed_zone(&self, def: &ZoneDef) -> Result<bool> {
        let definition = serde_json::to_string(def).context("encode zone")?;
        let done = sqlx::query(
            r#"
            INSERT INTO zones (zone_id, definition, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(zone_id) DO NOTHING
            "#,
        )
        .bind(&def.zone_id)
        .bind(definition)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await
        .context("seed_zone failed")?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows: Vec<ZoneRow> = sqlx::query_as(
            "SELECT definition, is_running, manual_on, spraying FROM zones ORDER BY zone_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zones failed")?;

        rows.into_iter().map(ZoneRow::into_zone).collect()
    }

    pub async fn delete_zone(&self, zone_id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM zones WHERE zone_id = ?")
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .context("delete_zone failed")?;
        Ok(done.rows_affected() > 0)
    }

    // ----------------------------
    // Saved schedules
    // ----------------------------

    pub async fn upsert_saved_schedule(&self, s: &SavedSchedule) -> Result<()> {
        let definition = serde_json::to_string(s).context("encode schedule")?;
        sqlx::query(
            r#"
            INSERT INTO saved_schedules (id, group_id, category, enabled, definition)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              group_id=excluded.group_id,
              category=excluded.category,
              enabled=excluded.enabled,
              definition=excluded.definition
            "#,
        )
        .bind(&s.id)
        .bind(&s.group_id)
        .bind(s.category.as_str())
        .bind(s.enabled)
        .bind(definition)
        .execute(&self.pool)
        .await
        .context("upsert_saved_schedule failed")?;
        Ok(())
    }

    pub async fn load_saved_schedules(&self) -> Result<Vec<SavedSchedule>> {
        let rows: Vec<ScheduleRow> =
            sqlx::query_as("SELECT enabled, definition FROM saved_schedules ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .context("load_saved_schedules failed")?;

        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    pub async fn delete_saved_schedule(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM saved_schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_saved_schedule failed")?;
        Ok(done.rows_affected() > 0)
    }

    /// Set `enabled` on one schedule. Enabling a basic (day/night/both)
    /// schedule disables every other basic schedule of its group in the same
    /// transaction. Returns the ids that were switched off.
    pub async fn set_schedule_enabled(&self, s: &SavedSchedule, enabled: bool) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        let mut disabled = Vec::new();
        if enabled && s.category.is_basic() {
            disabled = sqlx::query_scalar::<_, String>(
                r#"
                SELECT id FROM saved_schedules
                WHERE group_id = ? AND id <> ? AND category <> 'custom' AND enabled = 1
                ORDER BY id
                "#,
            )
            .bind(&s.group_id)
            .bind(&s.id)
            .fetch_all(&mut *tx)
            .await
            .context("select siblings failed")?;

            sqlx::query(
                r#"
                UPDATE saved_schedules SET enabled = 0
                WHERE group_id = ? AND id <> ? AND category <> 'custom'
                "#,
            )
            .bind(&s.group_id)
            .bind(&s.id)
            .execute(&mut *tx)
            .await
            .context("disable siblings failed")?;
        }

        sqlx::query("UPDATE saved_schedules SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(&s.id)
            .execute(&mut *tx)
            .await
            .context("set_schedule_enabled failed")?;

        tx.commit().await.context("commit failed")?;
        Ok(disabled)
    }

    // ----------------------------
    // Desired / observed state
    // ----------------------------

    pub async fn record_desired(
        &self,
        actuator_id: &str,
        command: &Command,
        at: OffsetDateTime,
        pending: bool,
    ) -> Result<()> {
        let encoded = serde_json::to_string(command).context("encode command")?;
        sqlx::query(
            r#"
            INSERT INTO desired_state (actuator_id, command, recorded_at, pending)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actuator_id) DO UPDATE SET
              command=excluded.command,
              recorded_at=excluded.recorded_at,
              pending=excluded.pending
            "#,
        )
        .bind(actuator_id)
        .bind(encoded)
        .bind(at.unix_timestamp())
        .bind(pending)
        .execute(&self.pool)
        .await
        .context("record_desired failed")?;
        Ok(())
    }

    pub async fn set_pending(&self, actuator_id: &str, pending: bool) -> Result<()> {
        sqlx::query("UPDATE desired_state SET pending = ? WHERE actuator_id = ?")
            .bind(pending)
            .bind(actuator_id)
            .execute(&self.pool)
            .await
            .context("set_pending failed")?;
        Ok(())
    }

    pub async fn get_desired(&self, actuator_id: &str) -> Result<Option<DesiredState>> {
        let row: Option<DesiredRow> = sqlx::query_as(
            "SELECT actuator_id, command, recorded_at, pending FROM desired_state WHERE actuator_id = ?",
        )
        .bind(actuator_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_desired failed")?;

        row.map(DesiredRow::into_desired).transpose()
    }

    pub async fn pending_desired(&self) -> Result<Vec<DesiredState>> {
        let rows: Vec<DesiredRow> = sqlx::query_as(
            r#"
            SELECT actuator_id, command, recorded_at, pending
            FROM desired_state WHERE pending = 1
            ORDER BY recorded_at, actuator_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("pending_desired failed")?;

        rows.into_iter().map(DesiredRow::into_desired).collect()
    }

    pub async fn record_observed(&self, actuator_id: &str, open: bool, at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO observed_state (actuator_id, open, observed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(actuator_id) DO UPDATE SET
              open=excluded.open,
              observed_at=excluded.observed_at
            "#,
        )
        .bind(actuator_id)
        .bind(open)
        .bind(at.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("record_observed failed")?;
        Ok(())
    }

    pub async fn load_observed(&self) -> Result<HashMap<String, ObservedState>> {
        let rows: Vec<(String, bool, i64)> =
            sqlx::query_as("SELECT actuator_id, open, observed_at FROM observed_state")
                .fetch_all(&self.pool)
                .await
                .context("load_observed failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, open, observed_at)| (id, ObservedState { open, observed_at }))
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::zone::tests::{slot, zone_def};
    use crate::zone::Category;
    use time::macros::datetime;

    pub(crate) async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    impl Db {
        pub(crate) async fn get_zone(&self, zone_id: &str) -> Result<Option<Zone>> {
            let row: Option<ZoneRow> = sqlx::query_as(
                "SELECT definition, is_running, manual_on, spraying FROM zones WHERE zone_id = ?",
            )
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_zone failed")?;

            row.map(ZoneRow::into_zone).transpose()
        }

        /// Shut the pool so every later query fails.
        pub(crate) async fn close(&self) {
            self.pool.close().await;
        }
    }

    fn schedule(id: &str, category: Category, enabled: bool) -> SavedSchedule {
        SavedSchedule {
            id: id.into(),
            group_id: "fans".into(),
            name: id.to_uppercase(),
            category,
            enabled,
            slots: vec![slot("08:00", "10:00")],
        }
    }

    #[tokio::test]
    async fn zone_round_trips_with_runtime_flags() {
        let db = memory_db().await;
        let mut z = Zone::new(zone_def("z1"));
        z.is_running = true;
        db.upsert_zone(&z).await.unwrap();

        let loaded = db.get_zone("z1").await.unwrap().unwrap();
        assert_eq!(loaded, z);
        assert_eq!(db.load_zones().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_does_not_clobber_operator_edits() {
        let db = memory_db().await;
        let mut z = Zone::new(zone_def("z1"));
        z.def.name = "Edited".into();
        db.upsert_zone(&z).await.unwrap();

        assert!(!db.seed_zone(&zone_def("z1")).await.unwrap());
        assert_eq!(db.get_zone("z1").await.unwrap().unwrap().def.name, "Edited");
        assert!(db.seed_zone(&zone_def("z2")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_zone_reports_missing() {
        let db = memory_db().await;
        db.upsert_zone(&Zone::new(zone_def("z1"))).await.unwrap();
        assert!(db.delete_zone("z1").await.unwrap());
        assert!(!db.delete_zone("z1").await.unwrap());
        assert!(db.get_zone("z1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enabling_basic_schedule_disables_basic_siblings_only() {
        let db = memory_db().await;
        let day = schedule("day", Category::Day, true);
        let night = schedule("night", Category::Night, false);
        let custom = schedule("custom", Category::Custom, true);
        for s in [&day, &night, &custom] {
            db.upsert_saved_schedule(s).await.unwrap();
        }

        let off = db.set_schedule_enabled(&night, true).await.unwrap();
        assert_eq!(off, vec!["day".to_string()]);

        let all: HashMap<String, bool> = db
            .load_saved_schedules()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.id, s.enabled))
            .collect();
        assert!(!all["day"]);
        assert!(all["night"]);
        assert!(all["custom"]);
    }

    #[tokio::test]
    async fn enabling_custom_schedule_touches_nothing_else() {
        let db = memory_db().await;
        let day = schedule("day", Category::Day, true);
        let custom = schedule("custom", Category::Custom, false);
        db.upsert_saved_schedule(&day).await.unwrap();
        db.upsert_saved_schedule(&custom).await.unwrap();

        let off = db.set_schedule_enabled(&custom, true).await.unwrap();
        assert!(off.is_empty());
        assert!(db.load_saved_schedules().await.unwrap().iter().all(|s| s.enabled));
    }

    #[tokio::test]
    async fn desired_state_tracks_pending() {
        let db = memory_db().await;
        let at = datetime!(2024-06-01 06:00:00 UTC);
        db.record_desired("mist-1", &Command::Power(true), at, true)
            .await
            .unwrap();
        db.record_desired("mist-2", &Command::Target(40), at, false)
            .await
            .unwrap();

        let pending = db.pending_desired().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].actuator_id, "mist-1");
        assert_eq!(pending[0].command, Command::Power(true));

        db.set_pending("mist-1", false).await.unwrap();
        assert!(db.pending_desired().await.unwrap().is_empty());
        assert_eq!(
            db.get_desired("mist-2").await.unwrap().unwrap().recorded_at,
            at.unix_timestamp()
        );
    }

    #[tokio::test]
    async fn observed_state_keeps_latest_echo() {
        let db = memory_db().await;
        let at = datetime!(2024-06-01 06:00:00 UTC);
        db.record_observed("mist-1", true, at).await.unwrap();
        db.record_observed("mist-1", false, at).await.unwrap();
        let observed = db.load_observed().await.unwrap();
        assert!(!observed["mist-1"].open);
    }
}
