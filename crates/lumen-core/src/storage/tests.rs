//! Backend-conformance tests shared by both store implementations.

use tempfile::TempDir;

use super::*;

fn exercise_store(store: &dyn KeyValueStore) {
    // read-your-writes
    store.set(Scope::Record, b"alpha", b"1").expect("set");
    assert_eq!(
        store.get(Scope::Record, b"alpha").expect("get"),
        Some(b"1".to_vec())
    );

    // scopes are disjoint
    assert_eq!(store.get(Scope::Index, b"alpha").expect("get"), None);

    // overwrite replaces
    store.set(Scope::Record, b"alpha", b"2").expect("set");
    assert_eq!(
        store.get(Scope::Record, b"alpha").expect("get"),
        Some(b"2".to_vec())
    );

    // delete is idempotent
    store.delete(Scope::Record, b"alpha").expect("delete");
    store.delete(Scope::Record, b"alpha").expect("delete");
    assert_eq!(store.get(Scope::Record, b"alpha").expect("get"), None);
}

fn exercise_scan(store: &dyn KeyValueStore) {
    store.set(Scope::Index, &[1, 0, 7], b"a").expect("set");
    store.set(Scope::Index, &[1, 0, 9], b"b").expect("set");
    store.set(Scope::Index, &[1, 1, 0], b"c").expect("set");
    store.set(Scope::Index, &[2, 0, 0], b"d").expect("set");
    store.set(Scope::Record, &[1, 0, 8], b"x").expect("set");

    let hits = store.scan_prefix(Scope::Index, &[1, 0]).expect("scan");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0], (vec![1, 0, 7], b"a".to_vec()));
    assert_eq!(hits[1], (vec![1, 0, 9], b"b".to_vec()));

    let all = store.scan_prefix(Scope::Index, &[]).expect("scan all");
    assert_eq!(all.len(), 4);

    let none = store.scan_prefix(Scope::Index, &[9]).expect("scan miss");
    assert!(none.is_empty());
}

#[test]
fn memory_store_conformance() {
    let store = MemoryStore::new();
    exercise_store(&store);
    exercise_scan(&store);
}

#[test]
fn sqlite_store_conformance() {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteStore::open(&dir.path().join("kv.db")).expect("open");
    exercise_store(&store);
    exercise_scan(&store);
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("kv.db");
    {
        let store = SqliteStore::open(&path).expect("open");
        store.set(Scope::JetKeeper, b"cursor", b"65537").expect("set");
    }
    let store = SqliteStore::open(&path).expect("reopen");
    assert_eq!(
        store.get(Scope::JetKeeper, b"cursor").expect("get"),
        Some(b"65537".to_vec())
    );
}

#[test]
fn sqlite_in_memory_scan_with_ff_prefix() {
    let store = SqliteStore::in_memory().expect("open");
    store.set(Scope::Blob, &[0xff, 0xff, 1], b"v").expect("set");
    let hits = store.scan_prefix(Scope::Blob, &[0xff, 0xff]).expect("scan");
    assert_eq!(hits.len(), 1);
}
