//! Master key vault: provisioning, passphrase unlock and the in-memory slot
//!
//! The vault is the only place a plaintext master key lives. `open` does all
//! the slow work (store reads, Argon2id, unwrap) without touching the slot;
//! `install` is a single synchronous swap, so an unlock that is cancelled
//! half-way never leaves a key behind.

use fv_core::config::StorageEncoding;
use fv_core::types::InsertOutcome;
use fv_core::{FvError, FvResult};
use fv_crypto::{
    derive_wrapping_key, from_cipher_bytes, generate_salt, to_cipher_bytes, unwrap_master_key,
    wrap_master_key, KdfParams, MasterKey, WrappingKey,
};
use fv_store::{KeyStore, UserKeyRecord};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, PoisonError, RwLock};

pub struct MasterKeyVault<K: KeyStore + ?Sized> {
    user_id: String,
    store: Arc<K>,
    encoding: StorageEncoding,
    slot: RwLock<Option<Arc<MasterKey>>>,
}

impl<K: KeyStore + ?Sized> MasterKeyVault<K> {
    pub fn new(store: Arc<K>, user_id: impl Into<String>, encoding: StorageEncoding) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            encoding,
            slot: RwLock::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Create and persist fresh key material for the account.
    ///
    /// Returns the new master key so the caller can start an unlocked
    /// session without paying for the KDF twice. Fails with
    /// `AlreadyProvisioned` if a wrapped master key is already stored.
    pub async fn provision(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> FvResult<MasterKey> {
        params
            .validate()
            .map_err(|e| FvError::Config(format!("kdf parameters: {e}")))?;

        if let Some(existing) = self.store.load_user(&self.user_id).await? {
            if existing.has_master_key() {
                return Err(FvError::AlreadyProvisioned(self.user_id.clone()));
            }
        }

        let salt = generate_salt();
        let master = MasterKey::generate();
        let wrapping = derive_off_thread(passphrase, salt.to_vec(), params.clone()).await?;
        let wrapped = wrap_master_key(&wrapping, &master, &self.user_id)?;

        let record = UserKeyRecord {
            user_id: self.user_id.clone(),
            kdf_salt: from_cipher_bytes(&salt, self.encoding),
            kdf_params: params.to_json()?,
            wrapped_master_key: Some(from_cipher_bytes(&wrapped.ciphertext, self.encoding)),
            wrapped_master_key_iv: Some(from_cipher_bytes(&wrapped.iv, self.encoding)),
        };

        match self.store.put_user_if_vacant(record).await? {
            InsertOutcome::Inserted => {
                tracing::info!(user_id = %self.user_id, "master key provisioned");
                Ok(master)
            }
            InsertOutcome::AlreadyExists => Err(FvError::AlreadyProvisioned(self.user_id.clone())),
        }
    }

    /// Derive the wrapping key from `passphrase` and unwrap the stored
    /// master key. Does not install it.
    pub async fn open(&self, passphrase: &SecretString) -> FvResult<MasterKey> {
        let record = self
            .store
            .load_user(&self.user_id)
            .await?
            .ok_or_else(|| FvError::NotProvisioned(self.user_id.clone()))?;

        let (Some(wrapped), Some(wrapped_iv)) =
            (&record.wrapped_master_key, &record.wrapped_master_key_iv)
        else {
            return Err(FvError::NotProvisioned(self.user_id.clone()));
        };

        let params = KdfParams::from_json(&record.kdf_params)?;
        let salt = to_cipher_bytes(&record.kdf_salt)?;
        let ciphertext = to_cipher_bytes(wrapped)?;
        let iv = to_cipher_bytes(wrapped_iv)?;

        let wrapping = derive_off_thread(passphrase, salt, params).await?;
        unwrap_master_key(&wrapping, &ciphertext, &iv, &self.user_id)
    }

    /// Put `master` in the slot, replacing (and releasing) any previous key.
    pub fn install(&self, master: MasterKey) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(master));
    }

    /// The installed master key, if any.
    pub fn current(&self) -> Option<Arc<MasterKey>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the installed key. The bytes are zeroized once the last
    /// in-flight operation holding a reference finishes.
    pub fn clear(&self) -> bool {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

/// Run Argon2id on the blocking pool; it is deliberately slow and would
/// otherwise stall the runtime.
async fn derive_off_thread(
    passphrase: &SecretString,
    salt: Vec<u8>,
    params: KdfParams,
) -> FvResult<WrappingKey> {
    let passphrase = SecretString::from(passphrase.expose_secret().to_owned());
    tokio::task::spawn_blocking(move || derive_wrapping_key(&passphrase, &salt, &params))
        .await
        .map_err(|e| anyhow::anyhow!("KDF task failed: {e}"))?
}
