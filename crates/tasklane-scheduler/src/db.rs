use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job store schema in `conn`.
///
/// Creates the `queued_jobs` table (idempotent). Each row holds one persisted
/// job as its flat record, JSON-encoded, plus the columns needed to list and
/// order rows without decoding them.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queued_jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            job_type    TEXT    NOT NULL,
            job_group   TEXT    NOT NULL,
            record      TEXT    NOT NULL,   -- JSON object of flat record fields
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        -- Rehydration replays jobs in submission order.
        CREATE INDEX IF NOT EXISTS idx_queued_jobs_created ON queued_jobs (created_at);
        ",
    )?;
    Ok(())
}
