//! JSON file store persistence: state written by one handle must be visible
//! to every other handle on the same path, and conditional inserts must hold
//! across handles.

use fv_core::types::InsertOutcome;
use fv_store::{JsonFileStore, KeyStore, RecordStore, RowColumns, ScopeKeyRecord, UserKeyRecord};
use std::sync::Arc;
use tempfile::TempDir;

fn user(id: &str) -> UserKeyRecord {
    UserKeyRecord {
        user_id: id.into(),
        kdf_salt: "\\x0102".into(),
        kdf_params: r#"{"algorithm":"argon2id","memory_kib":1024,"time_cost":1,"parallelism":1}"#
            .into(),
        wrapped_master_key: Some("\\xaa".into()),
        wrapped_master_key_iv: Some("\\xbb".into()),
    }
}

fn scope(user_id: &str, name: &str) -> ScopeKeyRecord {
    seeded_scope(user_id, name, "\\xcc")
}

fn seeded_scope(user_id: &str, name: &str, seed: &str) -> ScopeKeyRecord {
    ScopeKeyRecord {
        user_id: user_id.into(),
        scope: name.into(),
        wrapped_seed: seed.into(),
        seed_iv: "\\xdd".into(),
        created_at: 1_700_000_000,
    }
}

#[tokio::test]
async fn state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested/store.json");

    {
        let store = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            store.put_user_if_vacant(user("u1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        store
            .insert_scope_if_absent(scope("u1", "accounts"))
            .await
            .unwrap();
        store
            .upsert_columns(
                "u1",
                "accounts",
                "abc-123",
                RowColumns::from([
                    ("name_enc".to_string(), "\\x00".to_string()),
                    ("name_iv".to_string(), "\\x01".to_string()),
                ]),
            )
            .await
            .unwrap();
    }

    assert!(path.exists());
    assert!(
        !tmp.path().join("nested/store.json.tmp").exists(),
        "temp file must be renamed away"
    );

    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert_eq!(reopened.load_user("u1").await.unwrap(), Some(user("u1")));
    assert_eq!(
        reopened.load_scope("u1", "accounts").await.unwrap(),
        Some(scope("u1", "accounts"))
    );
    let row = reopened
        .load_row("u1", "accounts", "abc-123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("name_enc").map(String::as_str), Some("\\x00"));
}

#[tokio::test]
async fn conditional_inserts_are_respected() {
    let tmp = TempDir::new().unwrap();
    let store = JsonFileStore::open(&tmp.path().join("store.json")).await.unwrap();

    store.put_user_if_vacant(user("u1")).await.unwrap();
    assert_eq!(
        store.put_user_if_vacant(user("u1")).await.unwrap(),
        InsertOutcome::AlreadyExists
    );

    store.insert_scope_if_absent(scope("u1", "s")).await.unwrap();
    let mut second = scope("u1", "s");
    second.wrapped_seed = "\\xee".into();
    assert_eq!(
        store.insert_scope_if_absent(second).await.unwrap(),
        InsertOutcome::AlreadyExists
    );
    assert_eq!(
        store.load_scope("u1", "s").await.unwrap().unwrap().wrapped_seed,
        "\\xcc"
    );
}

#[tokio::test]
async fn deletes_are_persisted() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("store.json");
    let store = JsonFileStore::open(&path).await.unwrap();

    store.put_user_if_vacant(user("u1")).await.unwrap();
    store.insert_scope_if_absent(scope("u1", "a")).await.unwrap();
    store.insert_scope_if_absent(scope("u1", "b")).await.unwrap();
    for row in ["r1", "r2"] {
        store
            .upsert_columns("u1", "t", row, RowColumns::from([("x_enc".into(), "AA==".into())]))
            .await
            .unwrap();
    }

    assert_eq!(store.delete_rows("u1").await.unwrap(), 2);
    assert_eq!(store.delete_scopes("u1").await.unwrap(), 2);
    assert!(store.clear_master_key("u1").await.unwrap());
    drop(store);

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let user = reopened.load_user("u1").await.unwrap().unwrap();
    assert!(!user.has_master_key());
    assert!(reopened.load_scope("u1", "a").await.unwrap().is_none());
    assert!(reopened.load_row("u1", "t", "r1").await.unwrap().is_none());
}

#[tokio::test]
async fn handles_on_one_path_share_conditional_inserts() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("store.json");
    let a = JsonFileStore::open(&path).await.unwrap();
    let b = JsonFileStore::open(&path).await.unwrap();

    assert_eq!(
        a.insert_scope_if_absent(seeded_scope("u1", "accounts", "\\xaa"))
            .await
            .unwrap(),
        InsertOutcome::Inserted
    );
    a.upsert_columns("u1", "accounts", "r1", RowColumns::from([("x_enc".into(), "\\x01".into())]))
        .await
        .unwrap();

    // b was opened before a wrote anything and must still lose
    assert_eq!(
        b.insert_scope_if_absent(seeded_scope("u1", "accounts", "\\xbb"))
            .await
            .unwrap(),
        InsertOutcome::AlreadyExists
    );
    assert_eq!(
        b.load_scope("u1", "accounts").await.unwrap().unwrap().wrapped_seed,
        "\\xaa"
    );
    b.upsert_columns("u1", "accounts", "r2", RowColumns::from([("x_enc".into(), "\\x02".into())]))
        .await
        .unwrap();

    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert_eq!(
        reopened.load_scope("u1", "accounts").await.unwrap().unwrap().wrapped_seed,
        "\\xaa"
    );
    assert!(reopened.load_row("u1", "accounts", "r1").await.unwrap().is_some());
    assert!(reopened.load_row("u1", "accounts", "r2").await.unwrap().is_some());
    assert_eq!(a.lock_path(), tmp.path().join("store.json.lock"));
    assert!(a.lock_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_handles_elect_one_scope_seed() {
    const CONTENDERS: usize = 8;
    let tmp = TempDir::new().unwrap();
    let path = Arc::new(tmp.path().join("store.json"));

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let path = path.clone();
            tokio::spawn(async move {
                let store = JsonFileStore::open(&path).await.unwrap();
                let seed = format!("\\x{i:02x}");
                let outcome = store
                    .insert_scope_if_absent(seeded_scope("u1", "accounts", &seed))
                    .await
                    .unwrap();
                (seed, outcome)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        let (seed, outcome) = handle.await.unwrap();
        if outcome == InsertOutcome::Inserted {
            winners.push(seed);
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = JsonFileStore::open(&path)
        .await
        .unwrap()
        .load_scope("u1", "accounts")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.wrapped_seed, winners[0]);
}

#[tokio::test]
async fn failed_write_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("store.json");
    let store = JsonFileStore::open(&path).await.unwrap();
    store.put_user_if_vacant(user("u1")).await.unwrap();

    // A directory squatting on the temp path makes the next write fail
    let blocker = tmp.path().join("store.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(store.insert_scope_if_absent(scope("u1", "accounts")).await.is_err());
    assert!(store.load_scope("u1", "accounts").await.unwrap().is_none());

    std::fs::remove_dir(&blocker).unwrap();
    assert_eq!(
        store.insert_scope_if_absent(scope("u1", "accounts")).await.unwrap(),
        InsertOutcome::Inserted
    );
    assert!(store.load_user("u1").await.unwrap().is_some());
}

#[tokio::test]
async fn cleared_columns_are_persisted() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("store.json");
    let store = JsonFileStore::open(&path).await.unwrap();

    store
        .upsert_columns(
            "u1",
            "contacts",
            "c-1",
            RowColumns::from([
                ("name_enc".to_string(), "\\x00".to_string()),
                ("name_iv".to_string(), "\\x01".to_string()),
                ("name_bi".to_string(), "ab".repeat(32)),
            ]),
        )
        .await
        .unwrap();
    store
        .clear_columns("u1", "contacts", "c-1", &["name_bi".to_string()])
        .await
        .unwrap();
    // Clearing a row that does not exist is a no-op
    store
        .clear_columns("u1", "contacts", "c-2", &["name_bi".to_string()])
        .await
        .unwrap();

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let row = reopened.load_row("u1", "contacts", "c-1").await.unwrap().unwrap();
    assert!(!row.contains_key("name_bi"));
    assert_eq!(row.len(), 2);
    assert!(reopened
        .find_rows("u1", "contacts", "name_bi", &"ab".repeat(32))
        .await
        .unwrap()
        .is_empty());
}
