//! Credential directory: one hashed secret plus permission bitmask per
//! account, read on every authenticated request through a bounded-lifetime
//! cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::store::Store;
use crate::tprintln;

use super::permission::{mask_of, Permission};

/// Cache entries expire this long after they were written, regardless of how
/// often they are read. Credential mutations do not invalidate the cache; the
/// staleness window is bounded by this TTL alone.
pub const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// A stored credential: hashed secret, owning account, permission mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub hash: String,
    pub linked_account: i64,
    pub permissions: u32,
}

/// Digest of a raw secret as stored and compared. Unsalted SHA-256 over the
/// raw bytes, hex-encoded.
pub fn digest(raw_secret: &str) -> String {
    hex::encode(Sha256::digest(raw_secret.as_bytes()))
}

struct CacheEntry {
    credential: Credential,
    inserted_at: Instant,
}

/// Point lookup of credentials by account id, fronted by an expire-after-write
/// cache shared across the process.
pub struct CredentialDirectory {
    cache: RwLock<HashMap<i64, CacheEntry>>,
    ttl: Duration,
}

impl Default for CredentialDirectory {
    fn default() -> Self { Self::new() }
}

impl CredentialDirectory {
    pub fn new() -> Self { Self::with_ttl(CACHE_TTL) }

    /// Directory with a custom cache lifetime. Used by tests; operators can
    /// tighten the staleness window the same way.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { cache: RwLock::new(HashMap::new()), ttl }
    }

    /// Create a credential for an account. Fails with Conflict when the
    /// account already has one (UNIQUE on the account reference), and with
    /// NotFound when the account itself is missing.
    pub fn create(
        &self,
        store: &Store,
        account_id: i64,
        raw_secret: &str,
        perms: &[Permission],
    ) -> AppResult<Credential> {
        crate::accounts::resolve_by_id(store, account_id)?;
        let tokens = store.table("access_tokens");
        let hash = digest(raw_secret);
        let mask = mask_of(perms);
        let created = store.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {} (hash, linked_user, permissions) VALUES (?1, ?2, ?3)", tokens),
                params![hash, account_id, mask as i64],
            )?;
            Ok(Credential {
                id: conn.last_insert_rowid(),
                hash: hash.clone(),
                linked_account: account_id,
                permissions: mask,
            })
        })?;
        tprintln!("credentials.create account={} mask={:#x}", account_id, mask);
        Ok(created)
    }

    /// Credential for an account, from cache when fresh, otherwise from the
    /// store (populating the cache on a hit).
    pub fn lookup(&self, store: &Store, account_id: i64) -> AppResult<Option<Credential>> {
        if let Some(entry) = self.cache.read().get(&account_id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(Some(entry.credential.clone()));
            }
        }
        let tokens = store.table("access_tokens");
        let fetched = store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT id, hash, linked_user, permissions FROM {} WHERE linked_user = ?1",
                        tokens
                    ),
                    params![account_id],
                    |row| {
                        Ok(Credential {
                            id: row.get(0)?,
                            hash: row.get(1)?,
                            linked_account: row.get(2)?,
                            permissions: row.get::<_, i64>(3)? as u32,
                        })
                    },
                )
                .optional()?)
        })?;
        let mut cache = self.cache.write();
        match fetched {
            Some(credential) => {
                cache.insert(account_id, CacheEntry { credential: credential.clone(), inserted_at: Instant::now() });
                Ok(Some(credential))
            }
            None => {
                cache.remove(&account_id);
                Ok(None)
            }
        }
    }

    /// Resolve and check a presented credential. Unknown id hint, missing
    /// credential and digest mismatch all produce the same rejection, so a
    /// caller cannot tell which one failed.
    pub fn validate(&self, store: &Store, id_hint: &str, raw_secret: &str) -> AppResult<Credential> {
        let account_id: i64 = id_hint.parse().map_err(|_| no_principal())?;
        let credential = self.lookup(store, account_id)?.ok_or_else(no_principal)?;
        if credential.hash != digest(raw_secret) {
            return Err(no_principal());
        }
        Ok(credential)
    }
}

/// The uniform rejection for every authentication failure.
pub(crate) fn no_principal() -> AppError {
    AppError::auth("no_principal", "no principal")
}
