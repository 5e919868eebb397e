//! Schema creation for the three core relations. All statements are
//! idempotent so startup can run them unconditionally.
//!
//! The REFERENCES clauses document intent only: foreign keys stay unenforced
//! so that ledger entries survive the deletion of a merged-away account.

use rusqlite::Connection;

use crate::error::AppResult;

/// Reserved counterparty account for non-peer-to-peer adjustments.
pub const SYSTEM_ACCOUNT_ID: i64 = 1;

pub fn init_schema(conn: &Connection, prefix: &str) -> AppResult<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {p}users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            twitch_id   TEXT UNIQUE,
            discord_id  TEXT UNIQUE,
            qpoints     INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS {p}qpoints_transactions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            from_id     INTEGER NOT NULL REFERENCES {p}users(id),
            to_id       INTEGER NOT NULL REFERENCES {p}users(id),
            amount      INTEGER NOT NULL,
            created_at  INTEGER NOT NULL,
            reason      TEXT
        );
        CREATE INDEX IF NOT EXISTS {p}qpoints_transactions_from ON {p}qpoints_transactions(from_id);
        CREATE INDEX IF NOT EXISTS {p}qpoints_transactions_to ON {p}qpoints_transactions(to_id);

        CREATE TABLE IF NOT EXISTS {p}access_tokens (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            hash        TEXT NOT NULL,
            linked_user INTEGER NOT NULL UNIQUE REFERENCES {p}users(id),
            permissions INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO {p}users (id, qpoints) VALUES ({system}, 0);
        "#,
        p = prefix,
        system = SYSTEM_ACCOUNT_ID,
    ))?;
    Ok(())
}
