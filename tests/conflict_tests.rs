//! Conflict lifecycle tests
//!
//! Exercises the four resolution strategies, the one-open-conflict-per-key
//! invariant, and the atomic resolve path that writes the chosen value back
//! into the local store.

use offsync::{ConflictStrategy, EventBus, LocalStore, SyncError, SyncEvent};
use serde_json::json;
use tempfile::TempDir;

use offsync::ConflictResolver;

fn create_test_env() -> (LocalStore, ConflictResolver, EventBus, TempDir) {
    let _ = tracing_subscriber::fmt::try_init();
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let events = EventBus::default();
    let store = LocalStore::open(tmp_dir.path(), events.clone()).expect("Failed to open store");
    let resolver = ConflictResolver::new(store.clone(), events.clone());
    (store, resolver, events, tmp_dir)
}

#[test]
fn test_local_strategy_keeps_local() {
    let (_store, resolver, _events, _tmp) = create_test_env();
    let local = json!({"status": "active"});
    let remote = json!({"status": "terminated"});

    let winner = resolver
        .handle_sync_conflict("employees", "42", &local, &remote, ConflictStrategy::Local)
        .unwrap();
    assert_eq!(winner, local);
    assert!(resolver.pending_conflicts().unwrap().is_empty());
}

#[test]
fn test_remote_strategy_adopts_remote() {
    let (_store, resolver, _events, _tmp) = create_test_env();
    let local = json!({"status": "active"});
    let remote = json!({"status": "terminated"});

    let winner = resolver
        .handle_sync_conflict("employees", "42", &local, &remote, ConflictStrategy::Remote)
        .unwrap();
    assert_eq!(winner, remote);
}

#[test]
fn test_merge_strategy_merges() {
    let (_store, resolver, _events, _tmp) = create_test_env();
    let local = json!({"name": "Alice", "lastModified": 100});
    let remote = json!({"email": "alice@example.com", "lastModified": 200});

    let winner = resolver
        .handle_sync_conflict("employees", "42", &local, &remote, ConflictStrategy::Merge)
        .unwrap();
    assert_eq!(winner["name"], "Alice");
    assert_eq!(winner["email"], "alice@example.com");
    assert_eq!(winner["lastModified"], 200);
}

#[test]
fn test_prompt_persists_conflict_and_returns_local() {
    let (_store, resolver, events, _tmp) = create_test_env();
    let mut rx = events.subscribe();
    let local = json!({"status": "active", "lastModified": 100});
    let remote = json!({"status": "terminated", "lastModified": 200});

    let interim = resolver
        .handle_sync_conflict("employees", "42", &local, &remote, ConflictStrategy::Prompt)
        .unwrap();
    assert_eq!(interim, local, "local stays authoritative until resolution");

    let pending = resolver.pending_conflicts().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "employees:42");
    assert_eq!(pending[0].local_data, local);
    assert_eq!(pending[0].remote_data, remote);
    assert_eq!(pending[0].last_local_update, 100);
    assert_eq!(pending[0].last_remote_update, 200);

    let mut detected = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::ConflictDetected { conflict } = event {
            assert_eq!(conflict.key, "employees:42");
            detected = true;
        }
    }
    assert!(detected);
}

#[test]
fn test_second_conflict_overwrites_pending_one() {
    let (_store, resolver, _events, _tmp) = create_test_env();
    let local = json!({"v": 1});

    resolver
        .handle_sync_conflict("employees", "42", &local, &json!({"v": 2}), ConflictStrategy::Prompt)
        .unwrap();
    resolver
        .handle_sync_conflict("employees", "42", &local, &json!({"v": 3}), ConflictStrategy::Prompt)
        .unwrap();

    let pending = resolver.pending_conflicts().unwrap();
    assert_eq!(pending.len(), 1, "at most one open conflict per key");
    assert_eq!(pending[0].remote_data, json!({"v": 3}));
}

#[test]
fn test_resolve_conflict_writes_back_and_clears() {
    let (store, resolver, events, _tmp) = create_test_env();
    store
        .store_data("employees", "42", &json!({"status": "active"}), false)
        .unwrap();
    resolver
        .handle_sync_conflict(
            "employees",
            "42",
            &json!({"status": "active"}),
            &json!({"status": "terminated"}),
            ConflictStrategy::Prompt,
        )
        .unwrap();
    let mut rx = events.subscribe();

    let resolved_value = json!({"status": "on_leave"});
    resolver
        .resolve_conflict("employees:42", &resolved_value)
        .unwrap();

    assert!(resolver.pending_conflicts().unwrap().is_empty());
    assert_eq!(
        store.get_data("employees", "42").unwrap(),
        Some(resolved_value.clone())
    );

    let mut resolved = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::ConflictResolved { key, resolved: value } = event {
            assert_eq!(key, "employees:42");
            assert_eq!(value, resolved_value);
            resolved = true;
        }
    }
    assert!(resolved);
}

#[test]
fn test_resolve_keeps_record_encrypted() {
    let (store, resolver, _events, _tmp) = create_test_env();
    store
        .store_data("payroll", "42", &json!({"salary": 90000}), true)
        .unwrap();
    resolver
        .handle_sync_conflict(
            "payroll",
            "42",
            &json!({"salary": 90000}),
            &json!({"salary": 95000}),
            ConflictStrategy::Prompt,
        )
        .unwrap();

    let resolved_value = json!({"salary": 92000});
    resolver
        .resolve_conflict("payroll:42", &resolved_value)
        .unwrap();

    let record = store.get_record("payroll", "42").unwrap().unwrap();
    assert!(
        record.encrypted,
        "resolution must not rewrite an encrypted record in plaintext"
    );
    assert_ne!(
        record.payload,
        serde_json::to_vec(&resolved_value).unwrap(),
        "payload on disk must not be the plaintext serialization"
    );
    assert_eq!(
        store.get_data("payroll", "42").unwrap(),
        Some(resolved_value)
    );
}

#[test]
fn test_resolve_unknown_conflict_fails() {
    let (_store, resolver, _events, _tmp) = create_test_env();
    let err = resolver
        .resolve_conflict("employees:404", &json!({}))
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictNotFound(_)));
}

#[test]
fn test_conflicts_are_tracked_per_key() {
    let (_store, resolver, _events, _tmp) = create_test_env();

    resolver
        .handle_sync_conflict("employees", "1", &json!(1), &json!(2), ConflictStrategy::Prompt)
        .unwrap();
    resolver
        .handle_sync_conflict("departments", "hr", &json!(1), &json!(2), ConflictStrategy::Prompt)
        .unwrap();

    assert_eq!(resolver.pending_conflicts().unwrap().len(), 2);

    resolver.resolve_conflict("employees:1", &json!(2)).unwrap();
    let remaining = resolver.pending_conflicts().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, "departments:hr");
}
