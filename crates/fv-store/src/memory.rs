//! In-memory store backend

use async_trait::async_trait;
use fv_core::types::InsertOutcome;
use fv_core::{FvError, FvResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::state::StoreState;
use crate::{KeyStore, RecordStore, RowColumns, ScopeKeyRecord, UserKeyRecord};

/// Thread-safe in-memory store. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    /// Number of upcoming calls that fail with `TransientStore`
    unavailable_for: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` store operations fail as if the backend were
    /// unreachable.
    pub fn fail_next(&self, calls: u32) {
        self.unavailable_for.store(calls, Ordering::SeqCst);
    }

    /// Snapshot of the full state, for inspection
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    fn check_available(&self) -> FvResult<()> {
        let remaining = self
            .unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(FvError::TransientStore("memory store unavailable".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn load_user(&self, user_id: &str) -> FvResult<Option<UserKeyRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.load_user(user_id))
    }

    async fn put_user_if_vacant(&self, record: UserKeyRecord) -> FvResult<InsertOutcome> {
        self.check_available()?;
        Ok(self.state.write().await.put_user_if_vacant(record))
    }

    async fn clear_master_key(&self, user_id: &str) -> FvResult<bool> {
        self.check_available()?;
        Ok(self.state.write().await.clear_master_key(user_id))
    }

    async fn load_scope(&self, user_id: &str, scope: &str) -> FvResult<Option<ScopeKeyRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.load_scope(user_id, scope))
    }

    async fn insert_scope_if_absent(&self, record: ScopeKeyRecord) -> FvResult<InsertOutcome> {
        self.check_available()?;
        Ok(self.state.write().await.insert_scope_if_absent(record))
    }

    async fn delete_scopes(&self, user_id: &str) -> FvResult<u64> {
        self.check_available()?;
        Ok(self.state.write().await.delete_scopes(user_id))
    }

    async fn health_check(&self) -> FvResult<()> {
        self.check_available()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: RowColumns,
    ) -> FvResult<()> {
        self.check_available()?;
        self.state
            .write()
            .await
            .upsert_columns(user_id, table, row_id, columns);
        Ok(())
    }

    async fn clear_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: &[String],
    ) -> FvResult<()> {
        self.check_available()?;
        self.state
            .write()
            .await
            .clear_columns(user_id, table, row_id, columns);
        Ok(())
    }

    async fn load_row(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
    ) -> FvResult<Option<RowColumns>> {
        self.check_available()?;
        Ok(self.state.read().await.load_row(user_id, table, row_id))
    }

    async fn find_rows(
        &self,
        user_id: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> FvResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .find_rows(user_id, table, column, value))
    }

    async fn delete_rows(&self, user_id: &str) -> FvResult<u64> {
        self.check_available()?;
        Ok(self.state.write().await.delete_rows(user_id))
    }
}
