//! Durable job storage — SQLite rows sufficient to rebuild a live,
//! fireable job after a restart.
//!
//! Rows are plain data only: a kind tag, trigger fields, the delivery
//! target, and the display payload. No callbacks or runtime handles are
//! ever serialized; [`crate::scheduler::JobRuntime::restore`] rebinds
//! firing logic by kind on reload.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{params, Connection};

/// Discriminates the two job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// One-shot: fires once at an absolute time, then is discarded.
    Timer,
    /// Recurring: fires daily at a fixed local time until cancelled.
    Alarm,
}

impl JobKind {
    fn as_str(self) -> &'static str {
        match self {
            JobKind::Timer => "timer",
            JobKind::Alarm => "alarm",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timer" => Ok(JobKind::Timer),
            "alarm" => Ok(JobKind::Alarm),
            other => anyhow::bail!("unknown job kind tag: {other}"),
        }
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Absolute one-shot fire time.
    At(DateTime<Utc>),
    /// Local time-of-day, every day, in the configured timezone.
    Daily(NaiveTime),
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Namespaced unique name (`"timer:<n>"` / `"alarm:<n>"`).
    pub name: String,
    pub kind: JobKind,
    pub trigger: Trigger,
    /// Delivery target chat.
    pub chat_id: i64,
    /// User-facing name (the part after the namespace prefix).
    pub display_name: String,
    /// Free-text description, may be empty.
    pub description: String,
    /// Original duration in minutes (timers only; used in the fire text).
    pub minutes: Option<f64>,
    /// Suppress the raw platform notification on fire (alarms only).
    pub silent: bool,
}

/// SQLite-backed store for scheduled jobs.
///
/// All access goes through a single `Mutex<Connection>` — SQLite does not
/// tolerate uncoordinated multi-threaded writers, so every mutation is
/// funnelled through this one handle.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (or create) the job database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open job database {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                name         TEXT PRIMARY KEY,
                kind         TEXT NOT NULL,
                fire_at      TEXT,
                daily_time   TEXT,
                chat_id      INTEGER NOT NULL,
                display_name TEXT NOT NULL,
                description  TEXT NOT NULL DEFAULT '',
                minutes      REAL,
                silent       INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the row for `record.name`. Replace-by-name is a
    /// single atomic statement.
    pub fn persist(&self, record: &JobRecord) -> Result<()> {
        let conn = self.conn.lock().expect("job store poisoned");
        let (fire_at, daily_time) = match &record.trigger {
            Trigger::At(t) => (Some(t.to_rfc3339()), None),
            Trigger::Daily(t) => (None, Some(t.format("%H:%M").to_string())),
        };
        conn.execute(
            "INSERT OR REPLACE INTO jobs
                (name, kind, fire_at, daily_time, chat_id, display_name, description, minutes, silent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.name,
                record.kind.as_str(),
                fire_at,
                daily_time,
                record.chat_id,
                record.display_name,
                record.description,
                record.minutes,
                record.silent as i64,
            ],
        )?;
        Ok(())
    }

    /// Update an existing record. Same upsert as [`persist`](Self::persist);
    /// kept distinct for call-site clarity.
    pub fn update(&self, record: &JobRecord) -> Result<()> {
        self.persist(record)
    }

    /// Delete the row for `name`. Returns whether a row was deleted.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("job store poisoned");
        let deleted = conn.execute("DELETE FROM jobs WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    /// Fetch a single record by name.
    pub fn get(&self, name: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt = conn.prepare(
            "SELECT name, kind, fire_at, daily_time, chat_id, display_name, description, minutes, silent
             FROM jobs WHERE name = ?1",
        )?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Load every persisted record.
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt = conn.prepare(
            "SELECT name, kind, fire_at, daily_time, chat_id, display_name, description, minutes, silent
             FROM jobs ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<JobRecord> {
    let name: String = row.get(0)?;
    let kind = JobKind::from_str(&row.get::<_, String>(1)?)?;
    let trigger = match kind {
        JobKind::Timer => {
            let raw: String = row
                .get::<_, Option<String>>(2)?
                .with_context(|| format!("timer row '{name}' has no fire_at"))?;
            let fire_at = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("timer row '{name}' has malformed fire_at"))?
                .with_timezone(&Utc);
            Trigger::At(fire_at)
        }
        JobKind::Alarm => {
            let raw: String = row
                .get::<_, Option<String>>(3)?
                .with_context(|| format!("alarm row '{name}' has no daily_time"))?;
            let time = NaiveTime::parse_from_str(&raw, "%H:%M")
                .with_context(|| format!("alarm row '{name}' has malformed daily_time"))?;
            Trigger::Daily(time)
        }
    };

    Ok(JobRecord {
        name,
        kind,
        trigger,
        chat_id: row.get(4)?,
        display_name: row.get(5)?,
        description: row.get(6)?,
        minutes: row.get(7)?,
        silent: row.get::<_, i64>(8)? != 0,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(&dir.path().join("jobs.db")).unwrap();
        (dir, store)
    }

    fn timer_record(name: &str, fire_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            name: format!("timer:{name}"),
            kind: JobKind::Timer,
            trigger: Trigger::At(fire_at),
            chat_id: 42,
            display_name: name.into(),
            description: "steep the tea".into(),
            minutes: Some(5.0),
            silent: false,
        }
    }

    fn alarm_record(name: &str, time: NaiveTime) -> JobRecord {
        JobRecord {
            name: format!("alarm:{name}"),
            kind: JobKind::Alarm,
            trigger: Trigger::Daily(time),
            chat_id: 42,
            display_name: name.into(),
            description: String::new(),
            minutes: None,
            silent: true,
        }
    }

    #[test]
    fn round_trip_timer_and_alarm() {
        let (_dir, store) = temp_store();
        // RFC3339 keeps sub-second precision, but compare at whole seconds
        // to stay independent of formatting.
        let fire_at = Utc::now() + Duration::seconds(300);
        let fire_at = fire_at - Duration::nanoseconds(fire_at.timestamp_subsec_nanos() as i64);

        let timer = timer_record("tea", fire_at);
        let alarm = alarm_record("wake", NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        store.persist(&timer).unwrap();
        store.persist(&alarm).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], alarm); // ordered by name
        assert_eq!(all[1], timer);
    }

    #[test]
    fn persist_replaces_by_name() {
        let (_dir, store) = temp_store();
        let first = timer_record("tea", Utc::now());
        let mut second = first.clone();
        second.description = "second steeping".into();

        store.persist(&first).unwrap();
        store.persist(&second).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "second steeping");
    }

    #[test]
    fn remove_reports_whether_found() {
        let (_dir, store) = temp_store();
        store.persist(&timer_record("tea", Utc::now())).unwrap();

        assert!(store.remove("timer:tea").unwrap());
        assert!(!store.remove("timer:tea").unwrap());
        assert!(!store.remove("timer:never-existed").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn get_by_name() {
        let (_dir, store) = temp_store();
        let alarm = alarm_record("wake", NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        store.persist(&alarm).unwrap();

        assert_eq!(store.get("alarm:wake").unwrap(), Some(alarm));
        assert_eq!(store.get("alarm:missing").unwrap(), None);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");

        let store = JobStore::open(&db_path).unwrap();
        store
            .persist(&alarm_record("wake", NaiveTime::from_hms_opt(7, 0, 0).unwrap()))
            .unwrap();
        drop(store);

        let store = JobStore::open(&db_path).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "alarm:wake");
        assert!(all[0].silent);
    }
}
