use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use tasklane_core::{Fields, JobRecord};
use tracing::debug;

use crate::{db::init_db, error::Result};

/// Durable home for persisted job records.
///
/// The engine calls `save` after every state-affecting mutation of a job whose
/// record has `persisted` set, and `remove` once the job terminates. Failures
/// are logged by the engine and never fail the job itself.
pub trait JobStore: Send + Sync {
    fn save(&self, record: &JobRecord) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
    /// Every stored row, oldest first, undecoded.
    fn load_all(&self) -> Result<Vec<StoredJob>>;
}

/// One raw row of the store. Decoding is deferred so a malformed row can be
/// reported and dropped on its own.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub id: String,
    pub job_type: String,
    /// JSON object of flat record fields.
    pub record: String,
}

impl StoredJob {
    pub fn decode(&self) -> Result<JobRecord> {
        let fields: Fields = serde_json::from_str(&self.record)?;
        Ok(JobRecord::from_fields(&fields)?)
    }
}

/// [`JobStore`] over a SQLite `queued_jobs` table.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("job store connection poisoned")
    }
}

impl JobStore for SqliteJobStore {
    fn save(&self, record: &JobRecord) -> Result<()> {
        let encoded = serde_json::to_string(&record.to_fields())?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let created = record
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        self.conn().execute(
            "INSERT INTO queued_jobs (id, job_type, job_group, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record,
                                           updated_at = excluded.updated_at",
            rusqlite::params![
                record.id,
                record.job_type,
                record.group,
                encoded,
                created,
                now
            ],
        )?;
        debug!(job_id = %record.id, run_count = record.run_count, "job record saved");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM queued_jobs WHERE id = ?1", [id])?;
        if n > 0 {
            debug!(job_id = %id, "job record removed");
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<StoredJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, job_type, record FROM queued_jobs ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredJob {
                    id: row.get(0)?,
                    job_type: row.get(1)?,
                    record: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
