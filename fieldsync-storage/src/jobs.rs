//! Job records.

use crate::error::StorageResult;
use crate::store::{SyncStore, fmt_ts, parse_label, parse_opt_ts, parse_ts};
use chrono::{DateTime, Utc};
use fieldsync_types::{Job, JobId};
use rusqlite::{Connection, OptionalExtension, Row, params};

const JOB_COLUMNS: &str = "id, status, worker_id, started_at, updated_at, server_updated_at, \
                           requires_sync, locked, needs_refresh";

impl SyncStore {
    /// Inserts or replaces a job record.
    pub fn upsert_job(&self, job: &Job) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO jobs (
                id, status, worker_id, started_at, updated_at, server_updated_at,
                requires_sync, locked, needs_refresh
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                job.id.to_string(),
                job.status.as_str(),
                job.worker_id,
                job.started_at.as_ref().map(fmt_ts),
                fmt_ts(&job.updated_at),
                job.server_updated_at.as_ref().map(fmt_ts),
                job.requires_sync,
                job.locked,
                job.needs_refresh,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &JobId) -> StorageResult<Option<Job>> {
        let conn = self.conn();
        load_job(&conn, job_id)
    }

    /// Jobs that still have undelivered operations.
    pub fn jobs_requiring_sync(&self) -> StorageResult<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE requires_sync = 1 ORDER BY updated_at"
        ))?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Records the server version acknowledged for a job's last delivered write.
    pub fn record_server_version(&self, job_id: &JobId, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE jobs SET server_updated_at = ? WHERE id = ?",
            params![fmt_ts(&at), job_id.to_string()],
        )?;
        Ok(())
    }
}

pub(crate) fn load_job(conn: &Connection, job_id: &JobId) -> StorageResult<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"),
            params![job_id.to_string()],
            JobRow::from_row,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

struct JobRow {
    id: String,
    status: String,
    worker_id: Option<String>,
    started_at: Option<String>,
    updated_at: String,
    server_updated_at: Option<String>,
    requires_sync: bool,
    locked: bool,
    needs_refresh: bool,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            worker_id: row.get(2)?,
            started_at: row.get(3)?,
            updated_at: row.get(4)?,
            server_updated_at: row.get(5)?,
            requires_sync: row.get(6)?,
            locked: row.get(7)?,
            needs_refresh: row.get(8)?,
        })
    }

    fn into_job(self) -> StorageResult<Job> {
        Ok(Job {
            id: parse_label(&self.id)?,
            status: parse_label(&self.status)?,
            worker_id: self.worker_id,
            started_at: parse_opt_ts(self.started_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            server_updated_at: parse_opt_ts(self.server_updated_at)?,
            requires_sync: self.requires_sync,
            locked: self.locked,
            needs_refresh: self.needs_refresh,
        })
    }
}
