//! Session lifecycle and field-level operations.
//!
//! State machine: `Locked → Unlocking → Unlocked`, and back to `Locked` on
//! `lock()` or on any failed unlock. The transition into `Unlocked` installs
//! the master key and flips the state under one lock, so nobody observes an
//! `Unlocked` session without a key or a key in a `Locked` session.
//!
//! Every unlock attempt and every `lock()` takes a fresh attempt id. An
//! attempt only moves the session out of `Unlocking` while its id is still
//! the current one, so an attempt overtaken by `lock()` cannot touch the
//! state of a later attempt.

use async_trait::async_trait;
use fv_core::config::StorageEncoding;
use fv_core::types::{FieldColumns, FieldValue, StoredField};
use fv_core::{FvError, FvResult};
use fv_crypto::{FieldContext, KdfParams, MasterKey, ScopeKeys};
use fv_store::{KeyStore, RowColumns};
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock as AsyncRwLock;
use zeroize::Zeroize;

use crate::retry::RetryPolicy;
use crate::scope::ScopeKeyManager;
use crate::vault::MasterKeyVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Unlocking,
    Unlocked,
}

/// Where `auto_unlock` gets a passphrase from. Returning `None` means "not
/// available yet", which is retried.
#[async_trait]
pub trait PassphraseSource: Send + Sync {
    async fn passphrase(&self) -> Option<SecretString>;
}

#[async_trait]
impl PassphraseSource for SecretString {
    async fn passphrase(&self) -> Option<SecretString> {
        Some(SecretString::from(self.expose_secret().to_owned()))
    }
}

/// A passphrase cached elsewhere in the process (e.g. by a login flow) that
/// may not have been populated yet.
#[derive(Default)]
pub struct CachedPassphrase {
    inner: AsyncRwLock<Option<SecretString>>,
}

impl CachedPassphrase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, passphrase: SecretString) {
        *self.inner.write().await = Some(passphrase);
    }

    pub async fn clear(&self) {
        self.inner.write().await.take();
    }
}

#[async_trait]
impl PassphraseSource for CachedPassphrase {
    async fn passphrase(&self) -> Option<SecretString> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|p| SecretString::from(p.expose_secret().to_owned()))
    }
}

pub struct Session<K: KeyStore + ?Sized> {
    user_id: String,
    encoding: StorageEncoding,
    store: Arc<K>,
    vault: MasterKeyVault<K>,
    scopes: ScopeKeyManager<K>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    /// Id of the newest unlock attempt
    attempt: u64,
}

impl Lifecycle {
    fn next_attempt(&mut self) -> u64 {
        self.attempt = self.attempt.wrapping_add(1);
        self.attempt
    }

    fn owned_by(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.state == SessionState::Unlocking
    }
}

/// Reverts an abandoned unlock to `Locked` when dropped armed, which covers
/// both error returns and the future being dropped mid-await.
struct UnlockGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    attempt: u64,
    armed: bool,
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if lifecycle.owned_by(self.attempt) {
                lifecycle.state = SessionState::Locked;
            }
        }
    }
}

impl<K: KeyStore + ?Sized> Session<K> {
    pub fn new(store: Arc<K>, user_id: impl Into<String>, encoding: StorageEncoding) -> Self {
        let user_id = user_id.into();
        Self {
            vault: MasterKeyVault::new(store.clone(), user_id.clone(), encoding),
            scopes: ScopeKeyManager::new(store.clone(), user_id.clone(), encoding),
            store,
            user_id,
            encoding,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Locked,
                attempt: 0,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &Arc<K> {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle_guard().state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    /// Number of scopes whose keys are currently cached
    pub fn cached_scopes(&self) -> usize {
        self.scopes.cached_scopes()
    }

    /// Provision key material for a new account and leave the session
    /// unlocked with it.
    pub async fn provision(&self, passphrase: &SecretString, params: &KdfParams) -> FvResult<()> {
        let mut guard = self.begin_unlock()?;
        let master = self.vault.provision(passphrase, params).await?;
        self.finish_unlock(master, &mut guard)
    }

    /// Unlock with a passphrase.
    ///
    /// Any failure (wrong passphrase, corrupted record, unavailable store)
    /// leaves the session `Locked`. So does dropping the returned future
    /// before it completes.
    pub async fn unlock(&self, passphrase: &SecretString) -> FvResult<()> {
        let mut guard = self.begin_unlock()?;
        match self.vault.open(passphrase).await {
            Ok(master) => {
                self.finish_unlock(master, &mut guard)?;
                tracing::info!(user_id = %self.user_id, "session unlocked");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "unlock failed");
                Err(e)
            }
        }
    }

    /// Unlock with a passphrase from `source`, retrying transient failures
    /// (store unavailable, passphrase not yet cached) with backoff.
    /// Authentication and corruption failures are never retried.
    pub async fn auto_unlock(
        &self,
        source: &dyn PassphraseSource,
        policy: &RetryPolicy,
    ) -> FvResult<()> {
        policy
            .run("unlock", move || async move {
                let passphrase = source
                    .passphrase()
                    .await
                    .ok_or(FvError::PassphraseUnavailable)?;
                self.unlock(&passphrase).await
            })
            .await
    }

    /// Discard the master key and every cached scope key.
    pub fn lock(&self) {
        let mut lifecycle = self.lifecycle_guard();
        self.vault.clear();
        self.scopes.clear();
        if lifecycle.state != SessionState::Locked {
            tracing::info!(user_id = %self.user_id, "session locked");
        }
        lifecycle.state = SessionState::Locked;
        lifecycle.next_attempt();
    }

    /// Keys for `scope`, creating the scope on first use.
    pub async fn scope_keys(&self, scope: &str) -> FvResult<ScopeKeys> {
        let master = self.master()?;
        self.scopes.get_or_create(&master, scope).await
    }

    pub async fn encrypt_field(
        &self,
        scope: &str,
        table: &str,
        row_id: &str,
        field: &str,
        plaintext: &str,
    ) -> FvResult<StoredField> {
        let keys = self.scope_keys(scope).await?;
        self.seal_field(&keys, FieldContext::new(table, row_id, field), plaintext)
    }

    /// Encrypt and also compute the blind index of the normalized value.
    pub async fn encrypt_searchable_field(
        &self,
        scope: &str,
        table: &str,
        row_id: &str,
        field: &str,
        plaintext: &str,
    ) -> FvResult<StoredField> {
        let keys = self.scope_keys(scope).await?;
        let ctx = FieldContext::new(table, row_id, field);
        let mut stored = self.seal_field(&keys, ctx, plaintext)?;
        stored.bi = Some(fv_crypto::compute_blind_index(&keys, plaintext)?);
        Ok(stored)
    }

    pub async fn decrypt_field(
        &self,
        scope: &str,
        table: &str,
        row_id: &str,
        field: &str,
        ciphertext: &str,
        iv: &str,
    ) -> FvResult<String> {
        if ciphertext.trim().is_empty() || iv.trim().is_empty() {
            return Err(FvError::MissingField(field.to_string()));
        }
        let keys = self.scope_keys(scope).await?;
        open_field(&keys, FieldContext::new(table, row_id, field), ciphertext, iv)
    }

    /// Decrypt several fields of one row, reading `<field>_enc` and
    /// `<field>_iv` out of `columns`.
    ///
    /// One field failing to decrypt does not affect the others; the outer
    /// error is reserved for the session itself (locked, scope unusable).
    /// A field with only one of its two columns set is `Failed(Corruption)`.
    pub async fn decrypt_fields(
        &self,
        scope: &str,
        table: &str,
        row_id: &str,
        columns: &RowColumns,
        fields: &[&str],
    ) -> FvResult<BTreeMap<String, FieldValue>> {
        let keys = self.scope_keys(scope).await?;

        let values = fields
            .iter()
            .map(|&field| {
                let names = FieldColumns::for_field(field);
                let stored = (
                    columns.get(&names.enc).filter(|v| !v.is_empty()),
                    columns.get(&names.iv).filter(|v| !v.is_empty()),
                );
                let opened = match stored {
                    (Some(enc), Some(iv)) => {
                        open_field(&keys, FieldContext::new(table, row_id, field), enc, iv)
                    }
                    (None, None) => return (field.to_string(), FieldValue::Absent),
                    (Some(_), None) => Err(FvError::corruption(format!("{} has no IV", names.enc))),
                    (None, Some(_)) => Err(FvError::corruption(format!(
                        "{} is set without {}",
                        names.iv, names.enc
                    ))),
                };
                let value = match opened {
                    Ok(plaintext) => FieldValue::Present(plaintext),
                    Err(e) => {
                        tracing::warn!(
                            table,
                            row_id,
                            field,
                            error = %e,
                            "field failed to decrypt"
                        );
                        FieldValue::Failed(e)
                    }
                };
                (field.to_string(), value)
            })
            .collect();

        Ok(values)
    }

    pub async fn compute_blind_index(&self, scope: &str, value: &str) -> FvResult<String> {
        let keys = self.scope_keys(scope).await?;
        fv_crypto::compute_blind_index(&keys, value)
    }

    /// Whether `value` still hashes to a stored blind index.
    pub async fn blind_index_matches(
        &self,
        scope: &str,
        value: &str,
        digest: &str,
    ) -> FvResult<bool> {
        let keys = self.scope_keys(scope).await?;
        Ok(fv_crypto::blind_index_matches(&keys, value, digest))
    }

    fn seal_field(
        &self,
        keys: &ScopeKeys,
        ctx: FieldContext<'_>,
        plaintext: &str,
    ) -> FvResult<StoredField> {
        let sealed = fv_crypto::encrypt_field(keys, &ctx, plaintext.as_bytes())?;
        Ok(StoredField {
            enc: fv_crypto::from_cipher_bytes(&sealed.ciphertext, self.encoding),
            iv: fv_crypto::from_cipher_bytes(&sealed.iv, self.encoding),
            bi: None,
        })
    }

    fn master(&self) -> FvResult<Arc<MasterKey>> {
        self.vault.current().ok_or(FvError::Locked)
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `Unlocking` under a new attempt id, dropping whatever key was
    /// installed before.
    fn begin_unlock(&self) -> FvResult<UnlockGuard<'_>> {
        let mut lifecycle = self.lifecycle_guard();
        if lifecycle.state == SessionState::Unlocking {
            return Err(FvError::Other(anyhow::anyhow!("unlock already in progress")));
        }
        self.vault.clear();
        self.scopes.clear();
        lifecycle.state = SessionState::Unlocking;
        let attempt = lifecycle.next_attempt();
        Ok(UnlockGuard {
            lifecycle: &self.lifecycle,
            attempt,
            armed: true,
        })
    }

    fn finish_unlock(&self, master: MasterKey, guard: &mut UnlockGuard<'_>) -> FvResult<()> {
        let mut lifecycle = self.lifecycle_guard();
        if !lifecycle.owned_by(guard.attempt) {
            // lock() ran while we were deriving; honor it
            guard.armed = false;
            return Err(FvError::Locked);
        }
        self.vault.install(master);
        lifecycle.state = SessionState::Unlocked;
        guard.armed = false;
        Ok(())
    }
}

fn open_field(
    keys: &ScopeKeys,
    ctx: FieldContext<'_>,
    ciphertext: &str,
    iv: &str,
) -> FvResult<String> {
    let ciphertext = fv_crypto::to_cipher_bytes(ciphertext)?;
    let iv = fv_crypto::to_cipher_bytes(iv)?;
    let plaintext = fv_crypto::decrypt_field(keys, &ctx, &ciphertext, &iv)?;
    String::from_utf8(plaintext).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        FvError::corruption(format!("{} is not valid UTF-8", ctx.field))
    })
}
