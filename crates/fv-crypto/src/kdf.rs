//! Key derivation: Argon2id passphrase → wrapping key

use argon2::{Algorithm, Argon2, Params, Version};
use fv_core::{FvError, FvResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KEY_SIZE, SALT_SIZE};

/// Smallest salt accepted when re-deriving from stored parameters
const MIN_SALT_LEN: usize = 8;
/// Largest salt accepted when re-deriving from stored parameters
const MAX_SALT_LEN: usize = 64;
/// Ceiling on stored memory cost (4 GiB); anything above is treated as corrupt
const MAX_MEM_COST_KIB: u32 = 4 * 1024 * 1024;
/// Ceiling on stored time cost
const MAX_TIME_COST: u32 = 64;

/// A 256-bit key derived from a passphrase, used only to wrap the master key.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// KDF algorithm identifier persisted next to the salt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
}

/// Persisted KDF parameters.
///
/// Stored per user as JSON (`kdf_params`) so the cost factors can be raised
/// for new accounts without breaking old ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn argon2id(memory_kib: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib,
            time_cost,
            parallelism,
        }
    }

    pub fn from_config(cfg: &fv_core::config::KdfConfig) -> Self {
        Self::argon2id(
            cfg.argon2_mem_cost_kib,
            cfg.argon2_time_cost,
            cfg.argon2_parallelism,
        )
    }

    /// Parse the persisted JSON form. Unknown algorithms and malformed
    /// documents are corruption, not a wrong passphrase.
    pub fn from_json(s: &str) -> FvResult<Self> {
        let params: KdfParams = serde_json::from_str(s)
            .map_err(|e| FvError::corruption(format!("kdf_params: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_json(&self) -> FvResult<String> {
        serde_json::to_string(self).map_err(|e| FvError::Other(e.into()))
    }

    /// Reject parameters no legitimate account could have been created with.
    pub fn validate(&self) -> FvResult<()> {
        if self.memory_kib > MAX_MEM_COST_KIB {
            return Err(FvError::corruption(format!(
                "kdf memory cost {} KiB exceeds {MAX_MEM_COST_KIB}",
                self.memory_kib
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(FvError::corruption(format!(
                "kdf time cost {} out of range",
                self.time_cost
            )));
        }
        self.argon2_params().map(|_| ())
    }

    fn argon2_params(&self) -> FvResult<Params> {
        Params::new(
            self.memory_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| FvError::corruption(format!("invalid Argon2id params: {e}")))
    }
}

/// Generate a random per-user salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the 256-bit wrapping key from a passphrase.
///
/// Never fails on a wrong passphrase: any passphrase yields some key, and
/// only unwrapping the master key tells whether it was the right one.
pub fn derive_wrapping_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> FvResult<WrappingKey> {
    if !(MIN_SALT_LEN..=MAX_SALT_LEN).contains(&salt.len()) {
        return Err(FvError::corruption(format!(
            "kdf salt has {} bytes (expected {MIN_SALT_LEN}..={MAX_SALT_LEN})",
            salt.len()
        )));
    }
    params.validate()?;

    let argon2 = match params.algorithm {
        KdfAlgorithm::Argon2id => {
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?)
        }
    };

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| FvError::corruption(format!("Argon2id KDF failed: {e}")))?;

    let wrapping = WrappingKey::from_bytes(key);
    key.zeroize();
    Ok(wrapping)
}
