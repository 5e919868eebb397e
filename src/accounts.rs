//!
//! Account store
//! -------------
//! Resolves and mutates the accounts that hold qpoints balances. An account is
//! addressed either by its stable numeric id or by an external platform handle
//! (twitch or discord); lookups by handle create the account lazily. Balance
//! mutations always go through the ledger so the transaction log and the
//! balances stay mutually consistent, with one exception: `reset_all` zeroes
//! balances without compensating entries, matching the service's historical
//! behavior.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::store::Store;

pub use crate::store::schema::SYSTEM_ACCOUNT_ID;

/// External platform namespaces an account can be addressed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Twitch,
    Discord,
}

impl Platform {
    pub fn column(self) -> &'static str {
        match self {
            Platform::Twitch => "twitch_id",
            Platform::Discord => "discord_id",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Discord => "discord",
        }
    }
}

/// An account holding a qpoints balance, optionally linked to platform handles.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub twitch_id: Option<String>,
    pub discord_id: Option<String>,
    pub qpoints: i64,
}

/// Requested balance change for one entry of a bulk adjustment.
///
/// Add/Remove are evaluated against the current balance inside the batch
/// transaction, so concurrent requests cannot interleave the read and the
/// write.
#[derive(Debug, Clone, Copy)]
pub enum BalanceChange {
    Set(i64),
    Add(i64),
    Remove(i64),
}

/// One entry of a bulk adjustment: an account selector plus a change.
#[derive(Debug, Clone)]
pub struct BulkOp {
    pub platform: Platform,
    pub handle: String,
    pub change: BalanceChange,
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        twitch_id: row.get(1)?,
        discord_id: row.get(2)?,
        qpoints: row.get(3)?,
    })
}

fn select_by_handle(tx: &Transaction, users: &str, platform: Platform, handle: &str) -> AppResult<Option<Account>> {
    let sql = format!(
        "SELECT id, twitch_id, discord_id, qpoints FROM {} WHERE {} = ?1",
        users,
        platform.column()
    );
    Ok(tx.query_row(&sql, params![handle], account_from_row).optional()?)
}

fn select_by_id(tx: &Transaction, users: &str, id: i64) -> AppResult<Option<Account>> {
    let sql = format!("SELECT id, twitch_id, discord_id, qpoints FROM {} WHERE id = ?1", users);
    Ok(tx.query_row(&sql, params![id], account_from_row).optional()?)
}

/// Find-or-create inside an already-open transaction. The UNIQUE constraint on
/// the handle column arbitrates duplicate-create races; the conflict-tolerant
/// insert plus re-select means both racers observe the single surviving row.
fn resolve_in(tx: &Transaction, users: &str, platform: Platform, handle: &str) -> AppResult<Account> {
    if let Some(acc) = select_by_handle(tx, users, platform, handle)? {
        return Ok(acc);
    }
    tx.execute(
        &format!("INSERT INTO {} ({}) VALUES (?1) ON CONFLICT DO NOTHING", users, platform.column()),
        params![handle],
    )?;
    select_by_handle(tx, users, platform, handle)?.ok_or_else(|| {
        AppError::store(
            "resolve",
            format!("account for {}:{} vanished during create", platform.as_str(), handle),
        )
    })
}

/// Return the account for (platform, handle), creating it with a zero balance
/// if it does not exist yet.
pub fn resolve(store: &Store, platform: Platform, handle: &str) -> AppResult<Account> {
    let users = store.table("users");
    store.with_tx(|tx| resolve_in(tx, &users, platform, handle))
}

/// Point lookup by numeric id.
pub fn resolve_by_id(store: &Store, id: i64) -> AppResult<Account> {
    let users = store.table("users");
    store.with_conn(|conn| {
        conn.query_row(
            &format!("SELECT id, twitch_id, discord_id, qpoints FROM {} WHERE id = ?1", users),
            params![id],
            account_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("unknown_account", format!("no account with id {}", id)))
    })
}

/// Return the reserved system counterparty, creating it on first use.
pub fn system_account(store: &Store) -> AppResult<Account> {
    let users = store.table("users");
    store.with_tx(|tx| {
        tx.execute(
            &format!("INSERT OR IGNORE INTO {} (id, qpoints) VALUES (?1, 0)", users),
            params![SYSTEM_ACCOUNT_ID],
        )?;
        select_by_id(tx, &users, SYSTEM_ACCOUNT_ID)?
            .ok_or_else(|| AppError::store("system", "reserved account missing after seed"))
    })
}

/// Merge the discord account into the twitch account: move the discord handle
/// onto the target, fold the source balance in through a compensating ledger
/// entry, and delete the source row. One transaction; any precondition failure
/// leaves both accounts untouched.
pub fn link_platforms(store: &Store, twitch_handle: &str, discord_handle: &str) -> AppResult<Account> {
    let users = store.table("users");
    let entries = store.table("qpoints_transactions");
    store.with_tx(|tx| {
        let target = resolve_in(tx, &users, Platform::Twitch, twitch_handle)?;
        let source = resolve_in(tx, &users, Platform::Discord, discord_handle)?;
        if source.id == target.id {
            return Err(AppError::conflict("self_link", "cannot link an account to itself"));
        }
        if target.discord_id.is_some() {
            return Err(AppError::conflict("already_linked", "target account already carries a discord handle"));
        }
        if source.twitch_id.is_some() {
            return Err(AppError::conflict("already_linked", "source account already carries a twitch handle"));
        }

        ledger::transfer_in(
            tx,
            &users,
            &entries,
            source.id,
            target.id,
            source.qpoints,
            Some("link discord to twitch account"),
        )?;
        // Delete the source before taking over its handle so the UNIQUE
        // constraint on discord_id never sees both rows at once.
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", users), params![source.id])?;
        tx.execute(
            &format!("UPDATE {} SET discord_id = ?1 WHERE id = ?2", users),
            params![source.discord_id, target.id],
        )?;
        select_by_id(tx, &users, target.id)?
            .ok_or_else(|| AppError::store("link", "target account vanished during link"))
    })
}

fn list(store: &Store, limit: Option<u32>) -> AppResult<Vec<Account>> {
    let users = store.table("users");
    store.with_conn(|conn| {
        let mut sql = format!(
            "SELECT id, twitch_id, discord_id, qpoints FROM {} ORDER BY qpoints DESC, id ASC",
            users
        );
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], account_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
}

/// Top-n accounts by balance, ties broken by ascending id.
pub fn list_top(store: &Store, n: u32) -> AppResult<Vec<Account>> { list(store, Some(n)) }

/// Every account, highest balance first.
pub fn list_all(store: &Store) -> AppResult<Vec<Account>> { list(store, None) }

/// Zero every balance. Historical ledger entries are left as-is, so the
/// reconciliation invariant only holds between resets.
pub fn reset_all(store: &Store) -> AppResult<usize> {
    let users = store.table("users");
    store.with_conn(|conn| Ok(conn.execute(&format!("UPDATE {} SET qpoints = 0", users), [])?))
}

/// Apply a batch of balance adjustments as one all-or-nothing transaction.
///
/// Existing accounts get their balance set to the resolved target and one
/// ledger entry for the delta, sourced from the reserved account. Missing
/// accounts are created with the target balance and one entry for the full
/// amount. A failure on any entry rolls back the whole batch.
pub fn bulk_apply(store: &Store, ops: &[BulkOp]) -> AppResult<Vec<Account>> {
    let users = store.table("users");
    let entries = store.table("qpoints_transactions");
    store.with_tx(|tx| {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let applied = match select_by_handle(tx, &users, op.platform, &op.handle)? {
                Some(existing) => {
                    let target = match op.change {
                        BalanceChange::Set(n) => n,
                        BalanceChange::Add(n) => existing.qpoints + n,
                        BalanceChange::Remove(n) => existing.qpoints - n,
                    };
                    let delta = target - existing.qpoints;
                    tx.execute(
                        &format!("UPDATE {} SET qpoints = ?1 WHERE id = ?2", users),
                        params![target, existing.id],
                    )?;
                    ledger::append_entry_in(tx, &entries, SYSTEM_ACCOUNT_ID, existing.id, delta, None)?;
                    Account { qpoints: target, ..existing }
                }
                None => {
                    let target = match op.change {
                        BalanceChange::Set(n) | BalanceChange::Add(n) => n,
                        BalanceChange::Remove(n) => -n,
                    };
                    tx.execute(
                        &format!("INSERT INTO {} ({}, qpoints) VALUES (?1, ?2)", users, op.platform.column()),
                        params![op.handle, target],
                    )?;
                    let id = tx.last_insert_rowid();
                    ledger::append_entry_in(tx, &entries, SYSTEM_ACCOUNT_ID, id, target, None)?;
                    select_by_id(tx, &users, id)?
                        .ok_or_else(|| AppError::store("bulk", "created account vanished during batch"))?
                }
            };
            out.push(applied);
        }
        Ok(out)
    })
}
