//! Per-repo reconciliation cursors (§3). All advance monotonically on success; a
//! caller that rereads before a write lands simply reconciles the same range twice.
//!
//! Stored as one row per `(repo, kind)` with a JSON payload — the shapes differ enough
//! per kind (and are small enough) that a dedicated table per cursor would just be
//! more migrations for no query benefit.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueSyncCursor {
    pub last_sync_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneReconcileCursor {
    pub last_merged_at: Option<String>,
    pub last_pr_number: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InBotReconcileCursor {
    pub bot_branch: Option<String>,
    pub last_merged_at: Option<String>,
    pub last_pr_number: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationCommentCheckState {
    pub last_checked_at: Option<i64>,
    pub last_seen_updated_at: Option<String>,
    pub last_resolved_comment_id: Option<i64>,
    pub last_resolved_comment_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelWriteState {
    pub blocked_until_ms: Option<i64>,
    pub last_error: Option<String>,
}

fn get<T: Default + for<'de> Deserialize<'de>>(
    conn: &Connection,
    repo: &str,
    kind: &str,
) -> Result<T, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT payload_json FROM cursors WHERE repo = ?1 AND kind = ?2",
            params![repo, kind],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e).context("corrupt cursor json")))?),
        None => Ok(T::default()),
    }
}

fn set<T: Serialize>(
    conn: &Connection,
    repo: &str,
    kind: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)
        .map_err(|e| StoreError::Other(anyhow::anyhow!(e).context("failed to serialize cursor")))?;
    conn.execute(
        "INSERT INTO cursors (repo, kind, payload_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(repo, kind) DO UPDATE SET payload_json = ?3",
        params![repo, kind, json],
    )?;
    Ok(())
}

pub fn get_issue_sync(conn: &Connection, repo: &str) -> Result<IssueSyncCursor, StoreError> {
    get(conn, repo, "issue_sync")
}

pub fn set_issue_sync(
    conn: &Connection,
    repo: &str,
    cursor: &IssueSyncCursor,
) -> Result<(), StoreError> {
    set(conn, repo, "issue_sync", cursor)
}

pub fn get_done_reconcile(conn: &Connection, repo: &str) -> Result<DoneReconcileCursor, StoreError> {
    get(conn, repo, "done_reconcile")
}

pub fn set_done_reconcile(
    conn: &Connection,
    repo: &str,
    cursor: &DoneReconcileCursor,
) -> Result<(), StoreError> {
    set(conn, repo, "done_reconcile", cursor)
}

pub fn get_in_bot_reconcile(
    conn: &Connection,
    repo: &str,
) -> Result<InBotReconcileCursor, StoreError> {
    get(conn, repo, "in_bot_reconcile")
}

pub fn set_in_bot_reconcile(
    conn: &Connection,
    repo: &str,
    cursor: &InBotReconcileCursor,
) -> Result<(), StoreError> {
    set(conn, repo, "in_bot_reconcile", cursor)
}

pub fn get_escalation_comment_check_state(
    conn: &Connection,
    repo: &str,
) -> Result<EscalationCommentCheckState, StoreError> {
    get(conn, repo, "escalation_comment_check")
}

pub fn set_escalation_comment_check_state(
    conn: &Connection,
    repo: &str,
    state: &EscalationCommentCheckState,
) -> Result<(), StoreError> {
    set(conn, repo, "escalation_comment_check", state)
}

pub fn get_label_write_state(conn: &Connection, repo: &str) -> Result<LabelWriteState, StoreError> {
    get(conn, repo, "label_write")
}

pub fn set_label_write_state(
    conn: &Connection,
    repo: &str,
    state: &LabelWriteState,
) -> Result<(), StoreError> {
    set(conn, repo, "label_write", state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn unset_cursor_reads_back_as_default() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let cursor = get_issue_sync(&conn, "acme/widgets").unwrap();
        assert_eq!(cursor, IssueSyncCursor::default());
    }

    #[test]
    fn issue_sync_cursor_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        set_issue_sync(&conn, "acme/widgets", &IssueSyncCursor { last_sync_at: 42 }).unwrap();
        assert_eq!(get_issue_sync(&conn, "acme/widgets").unwrap().last_sync_at, 42);
    }

    #[test]
    fn cursors_are_scoped_per_repo() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        set_issue_sync(&conn, "acme/widgets", &IssueSyncCursor { last_sync_at: 1 }).unwrap();
        set_issue_sync(&conn, "acme/gizmos", &IssueSyncCursor { last_sync_at: 2 }).unwrap();
        assert_eq!(get_issue_sync(&conn, "acme/widgets").unwrap().last_sync_at, 1);
        assert_eq!(get_issue_sync(&conn, "acme/gizmos").unwrap().last_sync_at, 2);
    }

    #[test]
    fn label_write_state_round_trips_with_error() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let state = LabelWriteState {
            blocked_until_ms: Some(123456),
            last_error: Some("secondary rate limit".into()),
        };
        set_label_write_state(&conn, "acme/widgets", &state).unwrap();
        let back = get_label_write_state(&conn, "acme/widgets").unwrap();
        assert_eq!(back, state);
    }
}
