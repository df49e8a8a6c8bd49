//! Idempotency ledger (§3, §4.A): `(key PK, scope, createdAt, payloadJson?)`.
//!
//! Used anywhere an external side-effect must happen at most once per logical event
//! (label mutation already applied, comment already posted, rollup PR already opened).

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;

/// `claim` is an atomic insert-or-false: the first caller for a given key wins, every
/// later caller observes the row already exists and gets `false` back.
pub fn claim(conn: &Connection, key: &str, scope: &str) -> Result<bool, StoreError> {
    let now = crate::util::now_unix_ms();
    let changed = conn.execute(
        "INSERT INTO idempotency_ledger (key, scope, created_at, payload_json)
         VALUES (?1, ?2, ?3, NULL)
         ON CONFLICT(key) DO NOTHING",
        params![key, scope, now],
    )?;
    Ok(changed > 0)
}

pub fn has(conn: &Connection, key: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM idempotency_ledger WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn payload(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT payload_json FROM idempotency_ledger WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(StoreError::from)
}

pub fn upsert_payload(
    conn: &Connection,
    key: &str,
    scope: &str,
    payload_json: &str,
) -> Result<(), StoreError> {
    let now = crate::util::now_unix_ms();
    conn.execute(
        "INSERT INTO idempotency_ledger (key, scope, created_at, payload_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET payload_json = ?4",
        params![key, scope, now, payload_json],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM idempotency_ledger WHERE key = ?1",
        params![key],
    )?;
    Ok(())
}
