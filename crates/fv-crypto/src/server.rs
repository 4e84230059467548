//! Server-managed AES-256-GCM encryption for operational records
//!
//! Unlike user fields, these records are encrypted with a key the server
//! holds: HKDF-SHA256 over a server secret, separated per purpose by a
//! context string. Each message gets a random 96-bit IV, and ciphertext, IV
//! and tag are stored as three separate base64 values:
//! ```text
//! { "ciphertext": B64, "iv": B64(12 bytes), "tag": B64(16 bytes) }
//! ```

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use fv_core::{FvError, FvResult};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{KEY_SIZE, TAG_SIZE};

const GCM_IV_SIZE: usize = 12;
const SERVER_SALT: &[u8] = b"fieldvault-server-v1";
const MIN_SECRET_LEN: usize = 16;

/// One sealed operational record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

/// AES-256-GCM cipher keyed from the server secret.
pub struct ServerCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ServerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ServerCipher {
    /// Derive the server key for one purpose (`context`) from the secret.
    pub fn from_secret(secret: &SecretString, context: &str) -> FvResult<Self> {
        let secret = secret.expose_secret();
        if secret.len() < MIN_SECRET_LEN {
            return Err(FvError::Config(format!(
                "server secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SERVER_SALT), secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(context.as_bytes(), &mut key)
            .map_err(|e| anyhow::anyhow!("HKDF expand for server key: {e}"))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("creating AES-256-GCM cipher: {e}"))?;
        key.zeroize();
        Ok(Self { cipher })
    }

    /// Encrypt a record. `aad` binds it to its owner (e.g. record id).
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> FvResult<SealedRecord> {
        let mut iv = [0u8; GCM_IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
            .map_err(|e| anyhow::anyhow!("AES-256-GCM encryption failed: {e}"))?;

        Ok(SealedRecord {
            ciphertext: B64.encode(&buffer),
            iv: B64.encode(iv),
            tag: B64.encode(tag),
        })
    }

    /// Decrypt a record sealed by [`ServerCipher::seal`].
    pub fn open(&self, sealed: &SealedRecord, aad: &[u8]) -> FvResult<Vec<u8>> {
        let mut buffer = B64
            .decode(&sealed.ciphertext)
            .map_err(|e| FvError::corruption(format!("base64 decode ciphertext: {e}")))?;
        let iv = B64
            .decode(&sealed.iv)
            .map_err(|e| FvError::corruption(format!("base64 decode iv: {e}")))?;
        let tag = B64
            .decode(&sealed.tag)
            .map_err(|e| FvError::corruption(format!("base64 decode tag: {e}")))?;

        if iv.len() != GCM_IV_SIZE {
            return Err(FvError::corruption(format!(
                "IV must be {GCM_IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(FvError::corruption(format!(
                "tag must be {TAG_SIZE} bytes, got {}",
                tag.len()
            )));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                aad,
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| FvError::AuthenticationFailed)?;
        Ok(buffer)
    }
}
