//! The durable operation queue.

use crate::error::{StorageError, StorageResult};
use crate::jobs::load_job;
use crate::store::{SyncStore, fmt_ts, parse_label, parse_ts};
use chrono::{DateTime, Utc};
use fieldsync_types::{
    FailurePolicy, JobId, Operation, OperationId, OperationPayload, OperationStatus,
    OperationType,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use tracing::debug;

const OPERATION_COLUMNS: &str =
    "id, job_id, payload_json, status, attempts, last_error, created_at, updated_at";

/// Queue size broken down by status and, for undelivered work, by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub by_status: BTreeMap<OperationStatus, usize>,
    /// Operations not yet completed, keyed by type.
    pub by_type: BTreeMap<OperationType, usize>,
}

impl QueueCounts {
    pub fn status(&self, status: OperationStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }
}

impl SyncStore {
    /// Queues an operation for a job and flags the job as requiring sync,
    /// in one transaction.
    ///
    /// Job-mutating operations are refused once the job is locked. Queueing
    /// `start` moves the job in progress; queueing `complete` locks it.
    pub fn enqueue(&self, job_id: &JobId, payload: OperationPayload) -> StorageResult<Operation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| StorageError::NotFound(format!("job {job_id}")))?;
        let op_type = payload.op_type();
        if job.locked && op_type.mutates_job() {
            return Err(StorageError::JobLocked(*job_id));
        }

        let op = Operation::new(*job_id, payload);
        let now = fmt_ts(&op.created_at);
        tx.execute(
            r#"
            INSERT INTO operations (
                id, job_id, op_type, sequence, payload_json, status,
                attempts, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
            params![
                op.id.to_string(),
                job_id.to_string(),
                op_type.as_str(),
                op_type.sequence(),
                serde_json::to_string(&op.payload)?,
                op.status.as_str(),
                now,
                now,
            ],
        )?;

        match &op.payload {
            OperationPayload::Start(report) => {
                tx.execute(
                    "UPDATE jobs SET status = 'in_progress', \
                     started_at = COALESCE(started_at, ?), requires_sync = 1, updated_at = ? \
                     WHERE id = ?",
                    params![fmt_ts(&report.started_at), now, job_id.to_string()],
                )?;
            }
            OperationPayload::Complete(_) => {
                tx.execute(
                    "UPDATE jobs SET status = 'completed', locked = 1, requires_sync = 1, \
                     updated_at = ? WHERE id = ?",
                    params![now, job_id.to_string()],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE jobs SET requires_sync = 1, updated_at = ? WHERE id = ?",
                    params![now, job_id.to_string()],
                )?;
            }
        }

        tx.commit()?;
        debug!("queued {} operation {} for job {}", op_type, op.id, job_id);
        Ok(op)
    }

    pub fn get_operation(&self, id: &OperationId) -> StorageResult<Option<Operation>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?"),
                params![id.to_string()],
                OperationRow::from_row,
            )
            .optional()?;
        row.map(OperationRow::into_operation).transpose()
    }

    /// All live operations of a job in sequence order.
    pub fn operations_for_job(&self, job_id: &JobId) -> StorageResult<Vec<Operation>> {
        let conn = self.conn();
        query_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM operations \
                 WHERE job_id = ? AND deleted_at IS NULL ORDER BY sequence, created_at"
            ),
            params![job_id.to_string()],
        )
    }

    /// Pending operations plus failed ones still below `max_attempts`.
    pub fn sync_candidates(&self, max_attempts: u32) -> StorageResult<Vec<Operation>> {
        let conn = self.conn();
        query_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM operations \
                 WHERE deleted_at IS NULL \
                 AND (status = 'pending' OR (status = 'failed' AND attempts < ?)) \
                 ORDER BY job_id, sequence, created_at"
            ),
            params![max_attempts],
        )
    }

    pub fn count_sync_candidates(&self, max_attempts: u32) -> StorageResult<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE deleted_at IS NULL \
             AND (status = 'pending' OR (status = 'failed' AND attempts < ?))",
            params![max_attempts],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Per job, the earliest failed operation that used up `max_attempts`
    /// and whose failure halts the rest of its job.
    pub fn exhausted_halts(&self, max_attempts: u32) -> StorageResult<BTreeMap<JobId, Operation>> {
        let conn = self.conn();
        let exhausted = query_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM operations \
                 WHERE deleted_at IS NULL AND status = 'failed' AND attempts >= ? \
                 ORDER BY job_id, sequence, created_at"
            ),
            params![max_attempts],
        )?;

        let mut halts = BTreeMap::new();
        for op in exhausted {
            if op.op_type().failure_policy() == FailurePolicy::HaltJob {
                halts.entry(op.job_id).or_insert(op);
            }
        }
        Ok(halts)
    }

    pub fn queue_counts(&self) -> StorageResult<QueueCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, op_type, COUNT(*) FROM operations \
             WHERE deleted_at IS NULL GROUP BY status, op_type",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = QueueCounts::default();
        for (status, op_type, count) in rows {
            let status: OperationStatus = parse_label(&status)?;
            let op_type: OperationType = parse_label(&op_type)?;
            *counts.by_status.entry(status).or_default() += count as usize;
            if status != OperationStatus::Completed {
                *counts.by_type.entry(op_type).or_default() += count as usize;
            }
        }
        Ok(counts)
    }

    pub fn mark_in_progress(&self, id: &OperationId) -> StorageResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'in_progress', updated_at = ? \
             WHERE id = ? AND status != 'completed'",
            params![fmt_ts(&Utc::now()), id.to_string()],
        )?;
        ensure_changed(&conn, id, changed)
    }

    pub fn mark_completed(&self, id: &OperationId) -> StorageResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'completed', last_error = NULL, updated_at = ? \
             WHERE id = ? AND status != 'completed'",
            params![fmt_ts(&Utc::now()), id.to_string()],
        )?;
        ensure_changed(&conn, id, changed)
    }

    /// Records a failed attempt and returns the new attempt count.
    pub fn mark_failed(&self, id: &OperationId, error: &str) -> StorageResult<u32> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'failed', attempts = attempts + 1, \
             last_error = ?, updated_at = ? WHERE id = ? AND status != 'completed'",
            params![error, fmt_ts(&Utc::now()), id.to_string()],
        )?;
        ensure_changed(&conn, id, changed)?;
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM operations WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Puts operations left `in_progress` by an interrupted pass back to
    /// `pending`. Attempt counts are untouched.
    pub fn recover_in_progress(&self) -> StorageResult<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'pending', updated_at = ? WHERE status = 'in_progress'",
            params![fmt_ts(&Utc::now())],
        )?;
        Ok(changed)
    }

    /// Moves retry-eligible failed operations back to `pending`.
    pub fn reset_failed(&self, max_attempts: u32) -> StorageResult<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'pending', updated_at = ? \
             WHERE status = 'failed' AND attempts < ? AND deleted_at IS NULL",
            params![fmt_ts(&Utc::now()), max_attempts],
        )?;
        Ok(changed)
    }

    /// Clears `requires_sync` on every given job whose live operations are
    /// all completed. Returns the jobs that were cleared.
    pub fn finalize_synced_jobs(&self, job_ids: &[JobId]) -> StorageResult<Vec<JobId>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut cleared = Vec::new();
        for job_id in job_ids {
            let outstanding: i64 = tx.query_row(
                "SELECT COUNT(*) FROM operations \
                 WHERE job_id = ? AND deleted_at IS NULL AND status != 'completed'",
                params![job_id.to_string()],
                |row| row.get(0),
            )?;
            if outstanding == 0 {
                tx.execute(
                    "UPDATE jobs SET requires_sync = 0 WHERE id = ?",
                    params![job_id.to_string()],
                )?;
                cleared.push(*job_id);
            }
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Retention sweep: deletes completed operations of fully synced jobs,
    /// and discarded ones, last touched before `before`.
    pub fn purge_completed(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            r#"
            DELETE FROM operations
            WHERE updated_at < ?1
              AND (
                deleted_at IS NOT NULL
                OR (status = 'completed'
                    AND job_id NOT IN (SELECT id FROM jobs WHERE requires_sync = 1))
              )
            "#,
            params![fmt_ts(&before)],
        )?;
        Ok(removed)
    }
}

fn ensure_changed(conn: &Connection, id: &OperationId, changed: usize) -> StorageResult<()> {
    if changed > 0 {
        return Ok(());
    }
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM operations WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        Some("completed") => Err(StorageError::OperationCompleted(*id)),
        _ => Err(StorageError::NotFound(format!("operation {id}"))),
    }
}

fn query_operations(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StorageResult<Vec<Operation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, OperationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(OperationRow::into_operation).collect()
}

struct OperationRow {
    id: String,
    job_id: String,
    payload_json: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            payload_json: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_operation(self) -> StorageResult<Operation> {
        Ok(Operation {
            id: parse_label(&self.id)?,
            job_id: parse_label(&self.job_id)?,
            payload: serde_json::from_str(&self.payload_json)?,
            status: parse_label(&self.status)?,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
