//! Scope key manager: load-or-create of per-scope keys with a session cache.
//!
//! Creation is race-safe across processes as long as the store's
//! `insert_scope_if_absent` is atomic across them (the JSON file store holds
//! an exclusive file lock for it). Each contender generates its own
//! seed and offers it through `insert_scope_if_absent`; whoever loses reads
//! back the winner's record and derives from that, so every caller ends up
//! with the same keys.
//!
//! The cache carries a generation counter bumped by `clear`. A lookup that
//! started before a lock never repopulates the cache after it.

use fv_core::config::StorageEncoding;
use fv_core::types::InsertOutcome;
use fv_core::{FvError, FvResult};
use fv_crypto::{
    derive_scope_keys, from_cipher_bytes, generate_scope_seed, to_cipher_bytes,
    unwrap_scope_seed, wrap_scope_seed, MasterKey, ScopeKeys,
};
use fv_store::{KeyStore, ScopeKeyRecord};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Default)]
struct ScopeCache {
    generation: u64,
    keys: HashMap<String, ScopeKeys>,
}

pub struct ScopeKeyManager<K: KeyStore + ?Sized> {
    user_id: String,
    store: Arc<K>,
    encoding: StorageEncoding,
    cache: RwLock<ScopeCache>,
}

impl<K: KeyStore + ?Sized> ScopeKeyManager<K> {
    pub fn new(store: Arc<K>, user_id: impl Into<String>, encoding: StorageEncoding) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            encoding,
            cache: RwLock::new(ScopeCache::default()),
        }
    }

    /// Keys for `scope`, created on first use.
    ///
    /// A stored record that does not authenticate under `master` is reported
    /// as `Corruption` and never silently replaced: replacing it would orphan
    /// every field already written under the old keys.
    pub async fn get_or_create(&self, master: &MasterKey, scope: &str) -> FvResult<ScopeKeys> {
        if scope.is_empty() {
            return Err(FvError::Other(anyhow::anyhow!("scope name must not be empty")));
        }

        let generation = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(keys) = cache.keys.get(scope) {
                return Ok(keys.clone());
            }
            cache.generation
        };

        let keys = match self.store.load_scope(&self.user_id, scope).await? {
            Some(record) => self.open_record(master, scope, &record)?,
            None => self.create(master, scope).await?,
        };

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation {
            // Locked while we were away
            return Err(FvError::Locked);
        }
        let cached = cache
            .keys
            .entry(scope.to_string())
            .or_insert_with(|| keys.clone());
        Ok(cached.clone())
    }

    /// Forget all cached keys and invalidate in-flight lookups.
    pub fn clear(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.generation = cache.generation.wrapping_add(1);
        cache.keys.clear();
    }

    pub fn cached_scopes(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .len()
    }

    async fn create(&self, master: &MasterKey, scope: &str) -> FvResult<ScopeKeys> {
        let seed = generate_scope_seed();
        let wrapped = wrap_scope_seed(master, &seed, &self.user_id, scope)?;
        let record = ScopeKeyRecord {
            user_id: self.user_id.clone(),
            scope: scope.to_string(),
            wrapped_seed: from_cipher_bytes(&wrapped.ciphertext, self.encoding),
            seed_iv: from_cipher_bytes(&wrapped.iv, self.encoding),
            created_at: now_epoch(),
        };

        match self.store.insert_scope_if_absent(record).await? {
            InsertOutcome::Inserted => {
                tracing::info!(user_id = %self.user_id, scope, "scope keys created");
                derive_scope_keys(&seed, scope)
            }
            InsertOutcome::AlreadyExists => {
                tracing::debug!(scope, "lost scope creation race, adopting stored keys");
                let winner = self
                    .store
                    .load_scope(&self.user_id, scope)
                    .await?
                    .ok_or_else(|| {
                        FvError::Store(format!(
                            "scope record {scope} missing after conflicting insert"
                        ))
                    })?;
                self.open_record(master, scope, &winner)
            }
        }
    }

    fn open_record(
        &self,
        master: &MasterKey,
        scope: &str,
        record: &ScopeKeyRecord,
    ) -> FvResult<ScopeKeys> {
        let ciphertext = to_cipher_bytes(&record.wrapped_seed)?;
        let iv = to_cipher_bytes(&record.seed_iv)?;
        let seed = unwrap_scope_seed(master, &ciphertext, &iv, &self.user_id, scope).map_err(
            |e| match e {
                FvError::AuthenticationFailed => FvError::corruption(format!(
                    "scope key record for {scope} does not authenticate under the master key"
                )),
                other => other,
            },
        )?;
        derive_scope_keys(&seed, scope)
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
