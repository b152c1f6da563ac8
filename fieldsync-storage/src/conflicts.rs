//! The durable conflict store.

use crate::error::{StorageError, StorageResult};
use crate::store::{SyncStore, fmt_ts, parse_label, parse_opt_ts, parse_ts};
use chrono::Utc;
use fieldsync_types::{Conflict, ConflictId, ConflictType, JobId, Resolution};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

const CONFLICT_COLUMNS: &str = "id, job_id, conflict_type, reason, local_snapshot, \
                                server_snapshot, resolution, resolved, created_at, resolved_at";

impl SyncStore {
    /// Stores an unresolved conflict.
    pub fn insert_conflict(&self, conflict: &Conflict) -> StorageResult<()> {
        self.record_conflict(conflict, None).map(|_| ())
    }

    /// Stores a conflict and, when `resolution` is given, settles it in the
    /// same transaction. Returns the number of operations discarded.
    pub fn record_conflict(
        &self,
        conflict: &Conflict,
        resolution: Option<Resolution>,
    ) -> StorageResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_in(&tx, conflict)?;
        let discarded = match resolution {
            Some(resolution) => settle_in(&tx, conflict, resolution)?,
            None => 0,
        };
        tx.commit()?;

        match resolution {
            Some(resolution) => info!(
                "conflict {} ({}) on job {} settled as {}, {} operation(s) discarded",
                conflict.id, conflict.conflict_type, conflict.job_id, resolution, discarded
            ),
            None => info!(
                "conflict {} ({}) on job {} left for review",
                conflict.id, conflict.conflict_type, conflict.job_id
            ),
        }
        Ok(discarded)
    }

    pub fn get_conflict(&self, id: &ConflictId) -> StorageResult<Option<Conflict>> {
        let conn = self.conn();
        load_conflict(&conn, id)
    }

    pub fn unresolved_conflicts(&self) -> StorageResult<Vec<Conflict>> {
        let conn = self.conn();
        query_conflicts(
            &conn,
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE resolved = 0 ORDER BY created_at"
            ),
            params![],
        )
    }

    pub fn conflicts_for_job(&self, job_id: &JobId) -> StorageResult<Vec<Conflict>> {
        let conn = self.conn();
        query_conflicts(
            &conn,
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE job_id = ? ORDER BY created_at"
            ),
            params![job_id.to_string()],
        )
    }

    pub fn has_unresolved_conflict(&self, job_id: &JobId) -> StorageResult<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE job_id = ? AND resolved = 0",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Settles a stored conflict. Returns the number of undelivered
    /// operations discarded, which is non-zero only for `ServerWins`.
    ///
    /// `ServerWins` runs as one transaction: the job stops requiring sync, is
    /// flagged for refresh from the server, its undelivered operations are
    /// soft-deleted, and for a cancellation it is locked as cancelled.
    pub fn settle_conflict(&self, id: &ConflictId, resolution: Resolution) -> StorageResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let conflict = load_conflict(&tx, id)?
            .ok_or_else(|| StorageError::NotFound(format!("conflict {id}")))?;
        if conflict.resolved {
            return Err(StorageError::ConflictResolved(*id));
        }
        let discarded = settle_in(&tx, &conflict, resolution)?;
        tx.commit()?;

        info!(
            "conflict {} ({}) on job {} settled as {}, {} operation(s) discarded",
            id, conflict.conflict_type, conflict.job_id, resolution, discarded
        );
        Ok(discarded)
    }
}

fn insert_in(conn: &Connection, conflict: &Conflict) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO conflicts (
            id, job_id, conflict_type, reason, local_snapshot, server_snapshot,
            resolution, resolved, created_at, resolved_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            conflict.id.to_string(),
            conflict.job_id.to_string(),
            conflict.conflict_type.as_str(),
            conflict.reason,
            serde_json::to_string(&conflict.local_snapshot)?,
            serde_json::to_string(&conflict.server_snapshot)?,
            conflict.resolution.map(|r| r.as_str()),
            conflict.resolved,
            fmt_ts(&conflict.created_at),
            conflict.resolved_at.as_ref().map(fmt_ts),
        ],
    )?;
    Ok(())
}

fn settle_in(conn: &Connection, conflict: &Conflict, resolution: Resolution) -> StorageResult<usize> {
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "UPDATE conflicts SET resolution = ?, resolved = 1, resolved_at = ? \
         WHERE id = ? AND resolved = 0",
        params![resolution.as_str(), now, conflict.id.to_string()],
    )?;

    if resolution != Resolution::ServerWins {
        return Ok(0);
    }

    let job_id = conflict.job_id.to_string();
    conn.execute(
        "UPDATE jobs SET requires_sync = 0, needs_refresh = 1 WHERE id = ?",
        params![job_id],
    )?;
    if conflict.conflict_type == ConflictType::Cancellation {
        conn.execute(
            "UPDATE jobs SET status = 'cancelled', locked = 1 WHERE id = ?",
            params![job_id],
        )?;
    }
    let discarded = conn.execute(
        "UPDATE operations SET deleted_at = ?, updated_at = ? \
         WHERE job_id = ? AND status != 'completed' AND deleted_at IS NULL",
        params![now, now, job_id],
    )?;
    Ok(discarded)
}

fn load_conflict(conn: &Connection, id: &ConflictId) -> StorageResult<Option<Conflict>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?"),
            params![id.to_string()],
            ConflictRow::from_row,
        )
        .optional()?;
    row.map(ConflictRow::into_conflict).transpose()
}

fn query_conflicts(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StorageResult<Vec<Conflict>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, ConflictRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ConflictRow::into_conflict).collect()
}

struct ConflictRow {
    id: String,
    job_id: String,
    conflict_type: String,
    reason: Option<String>,
    local_snapshot: String,
    server_snapshot: String,
    resolution: Option<String>,
    resolved: bool,
    created_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            conflict_type: row.get(2)?,
            reason: row.get(3)?,
            local_snapshot: row.get(4)?,
            server_snapshot: row.get(5)?,
            resolution: row.get(6)?,
            resolved: row.get(7)?,
            created_at: row.get(8)?,
            resolved_at: row.get(9)?,
        })
    }

    fn into_conflict(self) -> StorageResult<Conflict> {
        Ok(Conflict {
            id: parse_label(&self.id)?,
            job_id: parse_label(&self.job_id)?,
            conflict_type: parse_label(&self.conflict_type)?,
            reason: self.reason,
            local_snapshot: serde_json::from_str(&self.local_snapshot)?,
            server_snapshot: serde_json::from_str(&self.server_snapshot)?,
            resolution: self.resolution.as_deref().map(parse_label).transpose()?,
            resolved: self.resolved,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
        })
    }
}
