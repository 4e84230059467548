//! JSON file store backend.
//!
//! The whole state lives in one JSON file. Every mutation takes an exclusive
//! lock on a sidecar `<store>.lock` file, re-reads the store from disk,
//! applies the change to that fresh copy and writes it back with an atomic
//! write (temp file, then rename). Nothing is cached between calls, so
//! several processes can share one store, conditional inserts stay atomic
//! across all of them, and a failed write leaves nothing behind in memory.
//!
//! Reads skip the lock: the rename guarantees the file on disk is always a
//! complete state.

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use fv_core::types::InsertOutcome;
use fv_core::FvResult;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::state::StoreState;
use crate::{KeyStore, RecordStore, RowColumns, ScopeKeyRecord, UserKeyRecord};

pub struct JsonFileStore {
    /// Path to the JSON store file on disk
    path: PathBuf,
}

impl JsonFileStore {
    /// Open a store at the given path, validating any existing content.
    /// If the file doesn't exist, starts empty; it is created on first write.
    pub async fn open(path: &Path) -> FvResult<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        let users = store.read(|state| state.users.len()).await?;
        tracing::debug!(path = %path.display(), users, "store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file holding the cross-process write lock
    pub fn lock_path(&self) -> PathBuf {
        sidecar(&self.path, "lock")
    }

    async fn read<T, F>(&self, view: F) -> FvResult<T>
    where
        F: FnOnce(&StoreState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load(&path).map(|state| view(&state)))
            .await
            .context("store read task failed")?
    }

    /// Run `change` against the current on-disk state while holding the
    /// store lock. The state is written back only when `change` reports it
    /// modified.
    async fn update<T, F>(&self, change: F) -> FvResult<T>
    where
        F: FnOnce(&mut StoreState) -> (T, bool) + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> FvResult<T> {
            let _lock = StoreLock::acquire(&path)?;
            let mut state = load(&path)?;
            let (outcome, modified) = change(&mut state);
            if modified {
                persist(&path, &state)?;
            }
            Ok(outcome)
        })
        .await
        .context("store write task failed")?
    }
}

/// Exclusive advisory lock on the store's sidecar file, released on drop
struct StoreLock(File);

impl StoreLock {
    fn acquire(path: &Path) -> FvResult<Self> {
        ensure_parent(path)?;
        let lock_path = sidecar(path, "lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("opening store lock: {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking store: {}", lock_path.display()))?;
        Ok(Self(file))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> FvResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating store dir: {}", parent.display()))?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> FvResult<StoreState> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str::<StoreState>(&content)
            .with_context(|| format!("parsing store: {}", path.display()))?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreState::default()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("reading store: {}", path.display()))
            .into()),
    }
}

fn persist(path: &Path, state: &StoreState) -> FvResult<()> {
    let json = serde_json::to_string_pretty(state).context("serializing store")?;

    let tmp_path = sidecar(path, "tmp");
    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("writing store temp: {}", tmp_path.display()))?;
    tmp.write_all(json.as_bytes())
        .and_then(|()| tmp.sync_all())
        .with_context(|| format!("writing store temp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming store into place: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl KeyStore for JsonFileStore {
    async fn load_user(&self, user_id: &str) -> FvResult<Option<UserKeyRecord>> {
        let user_id = user_id.to_string();
        self.read(move |state| state.load_user(&user_id)).await
    }

    async fn put_user_if_vacant(&self, record: UserKeyRecord) -> FvResult<InsertOutcome> {
        self.update(move |state| {
            let outcome = state.put_user_if_vacant(record);
            (outcome, outcome == InsertOutcome::Inserted)
        })
        .await
    }

    async fn clear_master_key(&self, user_id: &str) -> FvResult<bool> {
        let user_id = user_id.to_string();
        self.update(move |state| {
            let cleared = state.clear_master_key(&user_id);
            (cleared, cleared)
        })
        .await
    }

    async fn load_scope(&self, user_id: &str, scope: &str) -> FvResult<Option<ScopeKeyRecord>> {
        let (user_id, scope) = (user_id.to_string(), scope.to_string());
        self.read(move |state| state.load_scope(&user_id, &scope)).await
    }

    async fn insert_scope_if_absent(&self, record: ScopeKeyRecord) -> FvResult<InsertOutcome> {
        self.update(move |state| {
            let outcome = state.insert_scope_if_absent(record);
            (outcome, outcome == InsertOutcome::Inserted)
        })
        .await
    }

    async fn delete_scopes(&self, user_id: &str) -> FvResult<u64> {
        let user_id = user_id.to_string();
        self.update(move |state| {
            let deleted = state.delete_scopes(&user_id);
            (deleted, deleted > 0)
        })
        .await
    }

    async fn health_check(&self) -> FvResult<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::metadata(parent)
                    .await
                    .with_context(|| format!("store dir not accessible: {}", parent.display()))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn upsert_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: RowColumns,
    ) -> FvResult<()> {
        let user_id = user_id.to_string();
        let table = table.to_string();
        let row_id = row_id.to_string();
        self.update(move |state| {
            state.upsert_columns(&user_id, &table, &row_id, columns);
            ((), true)
        })
        .await
    }

    async fn clear_columns(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: &[String],
    ) -> FvResult<()> {
        let user_id = user_id.to_string();
        let table = table.to_string();
        let row_id = row_id.to_string();
        let columns = columns.to_vec();
        self.update(move |state| {
            let cleared = state.clear_columns(&user_id, &table, &row_id, &columns);
            ((), cleared)
        })
        .await
    }

    async fn load_row(
        &self,
        user_id: &str,
        table: &str,
        row_id: &str,
    ) -> FvResult<Option<RowColumns>> {
        let user_id = user_id.to_string();
        let table = table.to_string();
        let row_id = row_id.to_string();
        self.read(move |state| state.load_row(&user_id, &table, &row_id)).await
    }

    async fn find_rows(
        &self,
        user_id: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> FvResult<Vec<String>> {
        let (user_id, table) = (user_id.to_string(), table.to_string());
        let (column, value) = (column.to_string(), value.to_string());
        self.read(move |state| state.find_rows(&user_id, &table, &column, &value)).await
    }

    async fn delete_rows(&self, user_id: &str) -> FvResult<u64> {
        let user_id = user_id.to_string();
        self.update(move |state| {
            let deleted = state.delete_rows(&user_id);
            (deleted, deleted > 0)
        })
        .await
    }
}
