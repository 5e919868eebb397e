use std::sync::Arc;

use super::*;
use crate::accounts::{self, BalanceChange, BulkOp, Platform, SYSTEM_ACCOUNT_ID};
use crate::error::AppError;
use crate::ledger;

fn mem_store() -> Store {
    Store::open_in_memory("").unwrap()
}

fn entry_count(store: &Store) -> i64 {
    store
        .with_conn(|conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", store.table("qpoints_transactions")),
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap()
}

#[test]
fn schema_is_idempotent_and_seeds_reserved_account() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(tmp.path(), "").unwrap();
    let system = accounts::system_account(&store).unwrap();
    assert_eq!(system.id, SYSTEM_ACCOUNT_ID);
    assert_eq!(system.qpoints, 0);
    drop(store);

    // Reopening runs the same DDL again without clobbering anything
    let store = Store::open(tmp.path(), "").unwrap();
    let system = accounts::system_account(&store).unwrap();
    assert_eq!(system.id, SYSTEM_ACCOUNT_ID);
}

#[test]
fn table_prefix_is_applied() {
    let store = Store::open_in_memory("qp_").unwrap();
    accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    let found: i64 = store
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'qp_users'",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(found, 1);
}

#[test]
fn resolve_creates_lazily_and_is_idempotent() {
    let store = mem_store();
    let first = accounts::resolve(&store, Platform::Discord, "U1").unwrap();
    assert_eq!(first.qpoints, 0);
    assert_eq!(first.discord_id.as_deref(), Some("U1"));
    let second = accounts::resolve(&store, Platform::Discord, "U1").unwrap();
    assert_eq!(first.id, second.id);
}

#[test]
fn resolve_by_id_unknown_is_not_found() {
    let store = mem_store();
    let err = accounts::resolve_by_id(&store, 424242).unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[test]
fn transfer_round_trip_restores_balances() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    let bob = accounts::resolve(&store, Platform::Twitch, "bob").unwrap();
    ledger::add_points(&store, alice.id, 100, None).unwrap();

    ledger::transfer(&store, alice.id, bob.id, 40, Some("loan")).unwrap();
    assert_eq!(accounts::resolve_by_id(&store, alice.id).unwrap().qpoints, 60);
    assert_eq!(accounts::resolve_by_id(&store, bob.id).unwrap().qpoints, 40);

    ledger::transfer(&store, bob.id, alice.id, 40, Some("payback")).unwrap();
    assert_eq!(accounts::resolve_by_id(&store, alice.id).unwrap().qpoints, 100);
    assert_eq!(accounts::resolve_by_id(&store, bob.id).unwrap().qpoints, 0);
}

#[test]
fn transfer_fails_closed_on_unknown_account() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    ledger::add_points(&store, alice.id, 10, None).unwrap();
    let before = entry_count(&store);

    let err = ledger::transfer(&store, alice.id, 9999, 5, None).unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
    // the failed unit left no partial mutation behind
    assert_eq!(accounts::resolve_by_id(&store, alice.id).unwrap().qpoints, 10);
    assert_eq!(entry_count(&store), before);
}

#[test]
fn balances_reconcile_with_entry_sums() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    let bob = accounts::resolve(&store, Platform::Discord, "bob").unwrap();

    ledger::add_points(&store, alice.id, 120, None).unwrap();
    ledger::add_points(&store, bob.id, 30, None).unwrap();
    ledger::transfer(&store, alice.id, bob.id, 45, None).unwrap();
    ledger::transfer(&store, bob.id, alice.id, 5, Some("refund")).unwrap();
    ledger::remove_points(&store, alice.id, 17, None).unwrap();

    let entries = store.table("qpoints_transactions");
    for id in [alice.id, bob.id, SYSTEM_ACCOUNT_ID] {
        let expected: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    &format!(
                        "SELECT COALESCE(SUM(CASE WHEN to_id = ?1 THEN amount ELSE 0 END), 0) \
                         - COALESCE(SUM(CASE WHEN from_id = ?1 THEN amount ELSE 0 END), 0) FROM {}",
                        entries
                    ),
                    rusqlite::params![id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        let balance = accounts::resolve_by_id(&store, id).unwrap().qpoints;
        assert_eq!(balance, expected, "account {} out of balance with its entries", id);
    }
}

#[test]
fn concurrent_transfers_do_not_lose_updates() {
    let store = Arc::new(mem_store());
    let sink = accounts::resolve(&store, Platform::Twitch, "sink").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let sink_id = sink.id;
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                ledger::add_points(&store, sink_id, 1, None).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(accounts::resolve_by_id(&store, sink.id).unwrap().qpoints, 200);
    assert_eq!(accounts::resolve_by_id(&store, SYSTEM_ACCOUNT_ID).unwrap().qpoints, -200);
}

#[test]
fn concurrent_resolve_creates_exactly_one_account() {
    let store = Arc::new(mem_store());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            accounts::resolve(&store, Platform::Discord, "race").unwrap().id
        }));
    }
    let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "racers saw different accounts: {:?}", ids);

    let rows: i64 = store
        .with_conn(|conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE discord_id = 'race'", store.table("users")),
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(rows, 1);
}

#[test]
fn bulk_set_writes_delta_entries_from_reserved_account() {
    let store = mem_store();
    let account = accounts::resolve(&store, Platform::Discord, "U1").unwrap();
    assert_eq!(account.qpoints, 0);

    let op = |n| BulkOp { platform: Platform::Discord, handle: "U1".into(), change: BalanceChange::Set(n) };
    accounts::bulk_apply(&store, &[op(50)]).unwrap();
    assert_eq!(accounts::resolve_by_id(&store, account.id).unwrap().qpoints, 50);

    accounts::bulk_apply(&store, &[op(30)]).unwrap();
    assert_eq!(accounts::resolve_by_id(&store, account.id).unwrap().qpoints, 30);

    let entries = ledger::entries_for(&store, account.id, 0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].amount, 50);
    assert_eq!(entries[1].amount, -20);
    assert!(entries.iter().all(|e| e.from_id == SYSTEM_ACCOUNT_ID && e.to_id == account.id));
}

#[test]
fn bulk_creates_missing_accounts_with_full_amount_entries() {
    let store = mem_store();
    let applied = accounts::bulk_apply(
        &store,
        &[
            BulkOp { platform: Platform::Twitch, handle: "new1".into(), change: BalanceChange::Set(25) },
            BulkOp { platform: Platform::Discord, handle: "new2".into(), change: BalanceChange::Remove(5) },
        ],
    )
    .unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].qpoints, 25);
    // removing from an account that does not exist yet leaves it negative
    assert_eq!(applied[1].qpoints, -5);

    let first = ledger::entries_for(&store, applied[0].id, 0).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].amount, 25);
}

#[test]
fn bulk_add_and_remove_adjust_the_current_balance() {
    let store = mem_store();
    let set = |n| BulkOp { platform: Platform::Twitch, handle: "carol".into(), change: BalanceChange::Set(n) };
    let add = |n| BulkOp { platform: Platform::Twitch, handle: "carol".into(), change: BalanceChange::Add(n) };
    let remove = |n| BulkOp { platform: Platform::Twitch, handle: "carol".into(), change: BalanceChange::Remove(n) };

    accounts::bulk_apply(&store, &[set(10)]).unwrap();
    accounts::bulk_apply(&store, &[add(5)]).unwrap();
    let after = accounts::bulk_apply(&store, &[remove(3)]).unwrap();
    assert_eq!(after[0].qpoints, 12);

    let amounts: Vec<i64> = ledger::entries_for(&store, after[0].id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.amount)
        .collect();
    assert_eq!(amounts, vec![10, 5, -3]);
}

#[test]
fn link_moves_balance_and_handle_and_deletes_source() {
    let store = mem_store();
    let target = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    let source = accounts::resolve(&store, Platform::Discord, "alice#1").unwrap();
    ledger::add_points(&store, target.id, 40, None).unwrap();
    ledger::add_points(&store, source.id, 10, None).unwrap();

    let merged = accounts::link_platforms(&store, "alice", "alice#1").unwrap();
    assert_eq!(merged.id, target.id);
    assert_eq!(merged.twitch_id.as_deref(), Some("alice"));
    assert_eq!(merged.discord_id.as_deref(), Some("alice#1"));
    assert_eq!(merged.qpoints, 50);

    let err = accounts::resolve_by_id(&store, source.id).unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    // the moved balance is backed by a compensating entry
    let entries = ledger::entries_for(&store, target.id, 0).unwrap();
    assert!(entries
        .iter()
        .any(|e| e.from_id == source.id && e.to_id == target.id && e.amount == 10));
}

#[test]
fn link_fails_when_target_already_carries_discord_handle() {
    let store = mem_store();
    accounts::link_platforms(&store, "alice", "alice#1").unwrap();
    let before = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();

    let err = accounts::link_platforms(&store, "alice", "other#2").unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
    let after = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    assert_eq!(before, after);
}

#[test]
fn link_fails_when_source_already_carries_twitch_handle() {
    let store = mem_store();
    accounts::link_platforms(&store, "alice", "alice#1").unwrap();

    // "alice#1" now addresses the merged account, which holds a twitch handle
    let err = accounts::link_platforms(&store, "bob", "alice#1").unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
}

#[test]
fn link_to_self_is_rejected() {
    let store = mem_store();
    accounts::link_platforms(&store, "alice", "alice#1").unwrap();
    let err = accounts::link_platforms(&store, "alice", "alice#1").unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
}

#[test]
fn reset_zeroes_balances_and_keeps_historical_entries() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    ledger::add_points(&store, alice.id, 75, None).unwrap();
    let before = entry_count(&store);

    accounts::reset_all(&store).unwrap();
    assert_eq!(accounts::resolve_by_id(&store, alice.id).unwrap().qpoints, 0);
    assert_eq!(accounts::resolve_by_id(&store, SYSTEM_ACCOUNT_ID).unwrap().qpoints, 0);
    // no compensating entries are written; the log keeps its history as-is
    assert_eq!(entry_count(&store), before);
}

#[test]
fn list_top_orders_by_balance_then_id() {
    let store = mem_store();
    accounts::bulk_apply(
        &store,
        &[
            BulkOp { platform: Platform::Twitch, handle: "a".into(), change: BalanceChange::Set(50) },
            BulkOp { platform: Platform::Twitch, handle: "b".into(), change: BalanceChange::Set(50) },
            BulkOp { platform: Platform::Twitch, handle: "c".into(), change: BalanceChange::Set(20) },
        ],
    )
    .unwrap();

    let top = accounts::list_top(&store, 2).unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].twitch_id.as_deref(), Some("a"));
    assert_eq!(top[1].twitch_id.as_deref(), Some("b"));

    let all = accounts::list_all(&store).unwrap();
    // system account (balance 0) sorts after the funded ones
    assert_eq!(all.len(), 4);
    assert_eq!(all[2].twitch_id.as_deref(), Some("c"));
}

#[test]
fn entry_timestamps_are_monotonic_non_decreasing() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    for _ in 0..5 {
        ledger::add_points(&store, alice.id, 1, None).unwrap();
    }
    let entries = ledger::entries_for(&store, alice.id, 0).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[test]
fn entries_for_filters_by_account_and_time() {
    let store = mem_store();
    let alice = accounts::resolve(&store, Platform::Twitch, "alice").unwrap();
    let bob = accounts::resolve(&store, Platform::Twitch, "bob").unwrap();
    ledger::add_points(&store, alice.id, 5, None).unwrap();
    ledger::transfer(&store, alice.id, bob.id, 2, None).unwrap();

    let for_alice = ledger::entries_for(&store, alice.id, 0).unwrap();
    assert_eq!(for_alice.len(), 2);
    let for_bob = ledger::entries_for(&store, bob.id, 0).unwrap();
    assert_eq!(for_bob.len(), 1);

    let future = ledger::entries_for(&store, alice.id, i64::MAX).unwrap();
    assert!(future.is_empty());
}
