//!
//! Ledger
//! ------
//! Append-only log of balance transfers. Every entry is written in the same
//! transaction as the pair of balance mutations it describes (source −amount,
//! destination +amount), so no entry is ever visible without its balance
//! effect and vice versa. Entries are immutable once written.
//!
//! Amounts are signed and unvalidated here; the add/remove helpers lean on
//! that by moving points against the reserved system account. Callers own any
//! domain-level sign checks.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::store::schema::SYSTEM_ACCOUNT_ID;
use crate::store::Store;

/// Immutable record of one balance transfer between two accounts.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub from_id: i64,
    pub to_id: i64,
    pub amount: i64,
    /// Server-assigned epoch milliseconds, non-decreasing across the store.
    pub created_at: i64,
    pub reason: Option<String>,
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        from_id: row.get(1)?,
        to_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
        reason: row.get(5)?,
    })
}

/// Next entry timestamp: wall clock, clamped so it never runs behind the
/// latest committed entry.
fn next_timestamp(tx: &Transaction, entries: &str) -> AppResult<i64> {
    let last: i64 = tx.query_row(
        &format!("SELECT COALESCE(MAX(created_at), 0) FROM {}", entries),
        [],
        |row| row.get(0),
    )?;
    Ok(last.max(Utc::now().timestamp_millis()))
}

/// Append one entry inside an already-open transaction. The caller is
/// responsible for having applied (or deliberately skipped) the matching
/// balance mutations in the same transaction.
pub(crate) fn append_entry_in(
    tx: &Transaction,
    entries: &str,
    from_id: i64,
    to_id: i64,
    amount: i64,
    reason: Option<&str>,
) -> AppResult<LedgerEntry> {
    let created_at = next_timestamp(tx, entries)?;
    tx.execute(
        &format!(
            "INSERT INTO {} (from_id, to_id, amount, created_at, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
            entries
        ),
        params![from_id, to_id, amount, created_at, reason],
    )?;
    Ok(LedgerEntry {
        id: tx.last_insert_rowid(),
        from_id,
        to_id,
        amount,
        created_at,
        reason: reason.map(|s| s.to_string()),
    })
}

/// Debit, credit and append inside an already-open transaction.
pub(crate) fn transfer_in(
    tx: &Transaction,
    users: &str,
    entries: &str,
    from_id: i64,
    to_id: i64,
    amount: i64,
    reason: Option<&str>,
) -> AppResult<LedgerEntry> {
    for id in [from_id, to_id] {
        let known: Option<i64> = tx
            .query_row(&format!("SELECT id FROM {} WHERE id = ?1", users), params![id], |row| row.get(0))
            .optional()?;
        if known.is_none() {
            return Err(AppError::not_found("unknown_account", format!("no account with id {}", id)));
        }
    }
    tx.execute(
        &format!("UPDATE {} SET qpoints = qpoints - ?1 WHERE id = ?2", users),
        params![amount, from_id],
    )?;
    tx.execute(
        &format!("UPDATE {} SET qpoints = qpoints + ?1 WHERE id = ?2", users),
        params![amount, to_id],
    )?;
    append_entry_in(tx, entries, from_id, to_id, amount, reason)
}

/// Atomically move `amount` qpoints from one account to the other and record
/// the entry. Fails without mutation when either endpoint is unknown.
pub fn transfer(store: &Store, from_id: i64, to_id: i64, amount: i64, reason: Option<&str>) -> AppResult<LedgerEntry> {
    let users = store.table("users");
    let entries = store.table("qpoints_transactions");
    store.with_tx(|tx| transfer_in(tx, &users, &entries, from_id, to_id, amount, reason))
}

/// Grant points from the reserved system account.
pub fn add_points(store: &Store, to_id: i64, amount: i64, reason: Option<&str>) -> AppResult<LedgerEntry> {
    transfer(store, SYSTEM_ACCOUNT_ID, to_id, amount, reason)
}

/// Take points back into the reserved system account.
pub fn remove_points(store: &Store, from_id: i64, amount: i64, reason: Option<&str>) -> AppResult<LedgerEntry> {
    transfer(store, from_id, SYSTEM_ACCOUNT_ID, amount, reason)
}

/// Entries touching the given account at or after `since_ms`, oldest first.
pub fn entries_for(store: &Store, account_id: i64, since_ms: i64) -> AppResult<Vec<LedgerEntry>> {
    let entries = store.table("qpoints_transactions");
    store.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, from_id, to_id, amount, created_at, reason FROM {} \
             WHERE (from_id = ?1 OR to_id = ?1) AND created_at >= ?2 \
             ORDER BY created_at ASC, id ASC",
            entries
        ))?;
        let rows = stmt.query_map(params![account_id, since_ms], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
}
