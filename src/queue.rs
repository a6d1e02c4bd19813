//! Durable FIFO of writes the backend has not acknowledged yet.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::PosResult;
use crate::models::{PendingSyncOperation, SyncOperationKind};

/// Queue a write for the backend. Never fails the caller: a queue write
/// failure is logged and `None` is returned.
pub fn enqueue<T: Serialize>(
    conn: &Connection,
    kind: SyncOperationKind,
    payload: &T,
) -> Option<i64> {
    let body = match serde_json::to_string(payload) {
        Ok(b) => b,
        Err(e) => {
            error!(kind = %kind, "Failed to serialize sync payload: {e}");
            return None;
        }
    };
    match insert(conn, kind.as_str(), &body) {
        Ok(id) => {
            debug!(queue_id = id, kind = %kind, "Queued sync operation");
            Some(id)
        }
        Err(e) => {
            error!(kind = %kind, "Failed to queue sync operation: {e}");
            None
        }
    }
}

fn insert(conn: &Connection, kind: &str, payload: &str) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO pending_sync (kind, payload) VALUES (?1, ?2)",
        params![kind, payload],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Oldest entries first, at most `limit`.
pub fn pending(conn: &Connection, limit: u32) -> PosResult<Vec<PendingSyncOperation>> {
    pending_after(conn, 0, limit)
}

/// Entries with an id above `after_id`, oldest first.
pub fn pending_after(
    conn: &Connection,
    after_id: i64,
    limit: u32,
) -> PosResult<Vec<PendingSyncOperation>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, payload, retry_count, created_at
         FROM pending_sync WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![after_id, limit], |row| {
            Ok(PendingSyncOperation {
                id: row.get(0)?,
                kind: row.get(1)?,
                payload: row.get(2)?,
                retry_count: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn pending_count(conn: &Connection) -> PosResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_sync", [], |row| row.get(0))?)
}

/// Delete an acknowledged entry.
pub fn remove(conn: &Connection, id: i64) -> PosResult<()> {
    conn.execute("DELETE FROM pending_sync WHERE id = ?1", params![id])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Kept with the new retry count.
    Retrying(u32),
    /// Reached the ceiling and was deleted.
    Dropped,
}

/// Count a non-network failure against an entry. The entry is deleted once
/// its retry count reaches `max_retries`.
pub fn record_failure(
    conn: &Connection,
    id: i64,
    error_msg: &str,
    max_retries: u32,
) -> PosResult<FailureOutcome> {
    let current: Option<u32> = conn
        .query_row(
            "SELECT retry_count FROM pending_sync WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        return Ok(FailureOutcome::Dropped);
    };

    let next = current + 1;
    if next >= max_retries {
        conn.execute("DELETE FROM pending_sync WHERE id = ?1", params![id])?;
        warn!(
            queue_id = id,
            attempts = next,
            "Sync operation exceeded retry ceiling, dropping: {error_msg}"
        );
        return Ok(FailureOutcome::Dropped);
    }

    conn.execute(
        "UPDATE pending_sync SET retry_count = ?2, last_error = ?3 WHERE id = ?1",
        params![id, next, error_msg],
    )?;
    Ok(FailureOutcome::Retrying(next))
}
