//! fv-store: persistence boundary for wrapped keys and encrypted rows
//!
//! Everything that crosses this boundary is already encrypted or public
//! (salts, KDF parameters). Stores never see a passphrase, a master key,
//! scope keys or plaintext.
//!
//! Two backends implement both traits:
//!   - **Memory** (`MemoryStore`): tests and embedding.
//!   - **JSON file** (`JsonFileStore`): whole-state JSON, re-read and
//!     flushed atomically via temp+rename under a cross-process file lock on
//!     every mutation.
//!
//! Scope key creation relies on `insert_scope_if_absent` being atomic; a
//! relational backend maps it to `INSERT ... ON CONFLICT DO NOTHING`.

pub mod json;
pub mod memory;
pub mod state;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use fv_core::types::InsertOutcome;
use fv_core::FvResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-user key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyRecord {
    pub user_id: String,
    /// Stored-encoded salt
    pub kdf_salt: String,
    /// JSON-encoded KDF parameters (algorithm id + costs)
    pub kdf_params: String,
    /// Stored-encoded wrapped master key; `None` after a reset
    pub wrapped_master_key: Option<String>,
    /// Stored-encoded IV of the wrapped master key; `None` after a reset
    pub wrapped_master_key_iv: Option<String>,
}

impl UserKeyRecord {
    /// Whether a master key is currently provisioned
    pub fn has_master_key(&self) -> bool {
        self.wrapped_master_key.is_some() && self.wrapped_master_key_iv.is_some()
    }
}

/// Per-(user, scope) wrapped seed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeKeyRecord {
    pub user_id: String,
    pub scope: String,
    /// Stored-encoded wrapped scope seed
    pub wrapped_seed: String,
    /// Stored-encoded IV of the wrapped seed
    pub seed_iv: String,
    /// Unix timestamp of creation
    pub created_at: u64,
}

/// Column name → stored text for one row; a missing column is NULL
pub type RowColumns = BTreeMap<String, String>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_user(&self, user_id: &str) -> FvResult<Option<UserKeyRecord>>;

    /// Store `record` unless the user already has a provisioned master key.
    async fn put_user_if_vacant(&self, record: UserKeyRecord) -> FvResult<InsertOutcome>;

    /// Null the wrapped master key fields. Returns whether a key was present.
    async fn clear_master_key(&self, user_id: &str) -> FvResult<bool>;

    async fn load_scope(&self, user_id: &str, scope: &str) -> FvResult<Option<ScopeKeyRecord>>;

    /// Atomic insert-if-absent keyed by (user_id, scope).
    async fn insert_scope_if_absent(&self, record: ScopeKeyRecord) -> FvResult<InsertOutcome>;

    /// Delete every scope record of a user, returning how many were removed.
    async fn delete_scopes(&self, user_id: &str) -> FvResult<u64>;

    /// Lightest possible round trip to the backend.
    async fn health_check(&self) -> FvResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Merge `columns` into the row, creating it if needed.
    async fn upsert_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: RowColumns,
    ) -> FvResult<()>;

    /// Set `columns` of the row to NULL. A missing row is not an error.
    async fn clear_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: &[String],
    ) -> FvResult<()>;

    async fn load_row(&self, user_id: &str, table: &str, row_id: &str)
        -> FvResult<Option<RowColumns>>;

    /// Row ids of `table` whose `column` equals `value` exactly.
    async fn find_rows(
        &self,
        user_id: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> FvResult<Vec<String>>;

    /// Delete every row of a user across all tables, returning the count.
    async fn delete_rows(&self, user_id: &str) -> FvResult<u64>;
}
