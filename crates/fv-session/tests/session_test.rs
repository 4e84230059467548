//! End-to-end session behavior against the in-memory store: unlock, field
//! encryption bound to its row, blind indexes, locking and batch decryption.

use fv_core::config::StorageEncoding;
use fv_core::types::{FieldColumns, FieldValue};
use fv_core::FvError;
use fv_crypto::KdfParams;
use fv_session::{Session, SessionState};
use fv_store::{MemoryStore, RecordStore, RowColumns};
use secrecy::SecretString;
use std::sync::Arc;

fn fast() -> KdfParams {
    KdfParams::argon2id(1024, 1, 1)
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

async fn provisioned(store: &Arc<MemoryStore>, user: &str, pw: &str) -> Session<MemoryStore> {
    let session = Session::new(store.clone(), user, StorageEncoding::Hex);
    session.provision(&secret(pw), &fast()).await.unwrap();
    session
}

#[tokio::test]
async fn field_is_bound_to_its_row() {
    let store = Arc::new(MemoryStore::new());
    provisioned(&store, "alice", "Tr0ub4dor&3").await.lock();

    // Fresh session, unlocked from the stored record
    let session = Session::new(store.clone(), "alice", StorageEncoding::Hex);
    session.unlock(&secret("Tr0ub4dor&3")).await.unwrap();
    assert_eq!(session.state(), SessionState::Unlocked);

    let stored = session
        .encrypt_field("accounts", "accounts", "abc-123", "name", "Bar Sport")
        .await
        .unwrap();
    assert!(stored.enc.starts_with("\\x"));
    assert!(stored.bi.is_none());

    let plain = session
        .decrypt_field("accounts", "accounts", "abc-123", "name", &stored.enc, &stored.iv)
        .await
        .unwrap();
    assert_eq!(plain, "Bar Sport");

    // Same ciphertext copied onto another row
    let moved = session
        .decrypt_field("accounts", "accounts", "xyz-999", "name", &stored.enc, &stored.iv)
        .await;
    assert!(matches!(moved, Err(FvError::AuthenticationFailed)));

    // Nothing stored for the field at all
    let missing = session
        .decrypt_field("accounts", "accounts", "abc-123", "email", "", &stored.iv)
        .await;
    assert!(matches!(missing, Err(FvError::MissingField(f)) if f == "email"));

    // ...or read back as another field
    let swapped = session
        .decrypt_field("accounts", "accounts", "abc-123", "email", &stored.enc, &stored.iv)
        .await;
    assert!(matches!(swapped, Err(FvError::AuthenticationFailed)));
}

#[tokio::test]
async fn wrong_passphrase_stays_locked() {
    let store = Arc::new(MemoryStore::new());
    provisioned(&store, "alice", "Tr0ub4dor&3").await;

    let session = Session::new(store, "alice", StorageEncoding::Hex);
    let result = session.unlock(&secret("tr0ub4dor&3")).await;

    assert!(matches!(result, Err(FvError::AuthenticationFailed)));
    assert_eq!(session.state(), SessionState::Locked);
    assert!(matches!(
        session.scope_keys("accounts").await,
        Err(FvError::Locked)
    ));
}

#[tokio::test]
async fn locked_session_refuses_field_operations() {
    let session = Session::new(Arc::new(MemoryStore::new()), "nobody", StorageEncoding::Hex);

    assert!(matches!(
        session.encrypt_field("s", "t", "r", "f", "x").await,
        Err(FvError::Locked)
    ));
    assert!(matches!(
        session.compute_blind_index("s", "x").await,
        Err(FvError::Locked)
    ));
    assert!(matches!(
        session.unlock(&secret("pw")).await,
        Err(FvError::NotProvisioned(_))
    ));
}

#[tokio::test]
async fn lock_clears_keys_and_unlock_restores_access() {
    let store = Arc::new(MemoryStore::new());
    let session = provisioned(&store, "alice", "pw").await;

    let stored = session
        .encrypt_field("accounts", "accounts", "abc-123", "name", "Bar Sport")
        .await
        .unwrap();
    assert_eq!(session.cached_scopes(), 1);

    session.lock();
    assert_eq!(session.state(), SessionState::Locked);
    assert_eq!(session.cached_scopes(), 0);
    assert!(matches!(
        session
            .decrypt_field("accounts", "accounts", "abc-123", "name", &stored.enc, &stored.iv)
            .await,
        Err(FvError::Locked)
    ));

    session.unlock(&secret("pw")).await.unwrap();
    let plain = session
        .decrypt_field("accounts", "accounts", "abc-123", "name", &stored.enc, &stored.iv)
        .await
        .unwrap();
    assert_eq!(plain, "Bar Sport");
}

#[tokio::test]
async fn searchable_field_matches_normalized_query() {
    let store = Arc::new(MemoryStore::new());
    let session = provisioned(&store, "alice", "pw").await;

    let stored = session
        .encrypt_searchable_field("contacts", "contacts", "c-1", "name", "  Mario Rossi ")
        .await
        .unwrap();
    let cols = FieldColumns::for_field("name");
    store
        .upsert_columns(
            "alice",
            "contacts",
            "c-1",
            RowColumns::from([
                (cols.enc.clone(), stored.enc.clone()),
                (cols.iv.clone(), stored.iv.clone()),
                (cols.bi.clone(), stored.bi.clone().unwrap()),
            ]),
        )
        .await
        .unwrap();

    let query = session
        .compute_blind_index("contacts", "mario rossi")
        .await
        .unwrap();
    assert_eq!(stored.bi.as_deref(), Some(query.as_str()));
    assert_eq!(query.len(), 64);

    let hits = store
        .find_rows("alice", "contacts", &cols.bi, &query)
        .await
        .unwrap();
    assert_eq!(hits, vec!["c-1"]);

    // The same value in another scope does not match
    let other = session
        .compute_blind_index("accounts", "mario rossi")
        .await
        .unwrap();
    assert_ne!(other, query);

    // Plaintext keeps its original spacing
    let plain = session
        .decrypt_field("contacts", "contacts", "c-1", "name", &stored.enc, &stored.iv)
        .await
        .unwrap();
    assert_eq!(plain, "  Mario Rossi ");
}

#[tokio::test]
async fn users_cannot_read_each_other() {
    let store = Arc::new(MemoryStore::new());
    let alice = provisioned(&store, "alice", "same-pw").await;
    let bob = provisioned(&store, "bob", "same-pw").await;

    let stored = alice
        .encrypt_field("accounts", "accounts", "r1", "name", "secret")
        .await
        .unwrap();

    assert!(matches!(
        bob.decrypt_field("accounts", "accounts", "r1", "name", &stored.enc, &stored.iv)
            .await,
        Err(FvError::AuthenticationFailed)
    ));

    let a = alice.compute_blind_index("accounts", "secret").await.unwrap();
    let b = bob.compute_blind_index("accounts", "secret").await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn batch_decrypt_isolates_failures() {
    let store = Arc::new(MemoryStore::new());
    let session = provisioned(&store, "alice", "pw").await;

    let name = session
        .encrypt_field("accounts", "accounts", "r1", "name", "Bar Sport")
        .await
        .unwrap();
    let email = session
        .encrypt_field("accounts", "accounts", "r1", "email", "bar@example.com")
        .await
        .unwrap();

    // Flip the last hex digit of the email ciphertext
    let mut tampered = email.enc.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });

    let name_iv_copy = name.iv.clone();
    let columns = RowColumns::from([
        ("name_enc".to_string(), name.enc),
        ("name_iv".to_string(), name.iv),
        ("email_enc".to_string(), tampered),
        ("email_iv".to_string(), email.iv),
        ("phone_enc".to_string(), String::new()),
        // IV left behind without its ciphertext
        ("fax_iv".to_string(), name_iv_copy),
    ]);

    let fields = ["name", "email", "phone", "notes", "fax"];
    let values = session
        .decrypt_fields("accounts", "accounts", "r1", &columns, &fields)
        .await
        .unwrap();

    assert_eq!(values["name"].as_present(), Some("Bar Sport"));
    assert!(matches!(
        values["email"],
        FieldValue::Failed(FvError::AuthenticationFailed)
    ));
    assert!(values["phone"].is_absent());
    assert!(values["notes"].is_absent());
    assert!(matches!(values["fax"], FieldValue::Failed(FvError::Corruption(_))));
}

#[tokio::test]
async fn base64_columns_remain_readable() {
    let store = Arc::new(MemoryStore::new());
    let writer = Session::new(store.clone(), "alice", StorageEncoding::Base64);
    writer.provision(&secret("pw"), &fast()).await.unwrap();
    let stored = writer
        .encrypt_field("accounts", "accounts", "r1", "name", "Bar Sport")
        .await
        .unwrap();
    assert!(!stored.enc.starts_with("\\x"));

    let reader = Session::new(store, "alice", StorageEncoding::Hex);
    reader.unlock(&secret("pw")).await.unwrap();
    let plain = reader
        .decrypt_field("accounts", "accounts", "r1", "name", &stored.enc, &stored.iv)
        .await
        .unwrap();
    assert_eq!(plain, "Bar Sport");
}
