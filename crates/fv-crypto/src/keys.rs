//! Key hierarchy: master key, per-scope seeds, derived DEK/BIK, key wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use fv_core::{FvError, FvResult};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kdf::WrappingKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const MASTER_WRAP_DOMAIN: &[u8] = b"fieldvault-master-wrap-v1";
const SCOPE_WRAP_DOMAIN: &[u8] = b"fieldvault-scope-wrap-v1";
const DEK_INFO: &[u8] = b"fieldvault-scope-dek-v1";
const BIK_INFO: &[u8] = b"fieldvault-scope-bik-v1";

/// The 256-bit root secret of an account. Lives only in an unlocked session.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Random per-scope secret from which the DEK and BIK are derived.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ScopeSeed {
    bytes: [u8; KEY_SIZE],
}

impl ScopeSeed {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for ScopeSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeSeed")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A scope's data-encryption key and blind-index key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ScopeKeys {
    dek: [u8; KEY_SIZE],
    bik: [u8; KEY_SIZE],
}

impl ScopeKeys {
    pub fn from_parts(dek: [u8; KEY_SIZE], bik: [u8; KEY_SIZE]) -> Self {
        Self { dek, bik }
    }

    pub fn dek(&self) -> &[u8; KEY_SIZE] {
        &self.dek
    }

    pub fn bik(&self) -> &[u8; KEY_SIZE] {
        &self.bik
    }
}

impl std::fmt::Debug for ScopeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeKeys")
            .field("dek", &"[REDACTED]")
            .field("bik", &"[REDACTED]")
            .finish()
    }
}

/// A key encrypted under another key: ciphertext (key + tag) and its IV,
/// persisted as two separate columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_SIZE],
}

/// Generate a random scope seed.
pub fn generate_scope_seed() -> ScopeSeed {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ScopeSeed::from_bytes(bytes)
}

/// Derive a scope's DEK and BIK from its seed via HKDF-SHA256.
///
/// The scope name is the HKDF salt, so a seed copied into another scope's
/// record still yields unrelated keys.
pub fn derive_scope_keys(seed: &ScopeSeed, scope: &str) -> FvResult<ScopeKeys> {
    let hkdf = Hkdf::<Sha256>::new(Some(scope.as_bytes()), seed.as_bytes());
    let mut dek = [0u8; KEY_SIZE];
    let mut bik = [0u8; KEY_SIZE];
    hkdf.expand(DEK_INFO, &mut dek)
        .map_err(|e| anyhow::anyhow!("HKDF expand (dek) failed: {e}"))?;
    hkdf.expand(BIK_INFO, &mut bik)
        .map_err(|e| anyhow::anyhow!("HKDF expand (bik) failed: {e}"))?;
    let keys = ScopeKeys::from_parts(dek, bik);
    dek.zeroize();
    bik.zeroize();
    Ok(keys)
}

/// Wrap the master key under a passphrase-derived wrapping key.
///
/// The user id is bound as AAD so a wrapped key copied onto another
/// account's row never unwraps.
pub fn wrap_master_key(
    wrapping: &WrappingKey,
    master: &MasterKey,
    user_id: &str,
) -> FvResult<WrappedKey> {
    let aad = build_aad(MASTER_WRAP_DOMAIN, &[user_id.as_bytes()]);
    wrap_key(wrapping.as_bytes(), master.as_bytes(), &aad)
}

/// Unwrap the master key.
///
/// A wrong passphrase and corrupted ciphertext both come back as
/// `AuthenticationFailed`; only structurally impossible input (wrong IV or
/// ciphertext length) is `Corruption`.
pub fn unwrap_master_key(
    wrapping: &WrappingKey,
    ciphertext: &[u8],
    iv: &[u8],
    user_id: &str,
) -> FvResult<MasterKey> {
    let aad = build_aad(MASTER_WRAP_DOMAIN, &[user_id.as_bytes()]);
    let bytes = unwrap_key(wrapping.as_bytes(), ciphertext, iv, &aad)?;
    Ok(MasterKey::from_bytes(bytes))
}

/// Wrap a scope seed under the master key, bound to (user, scope).
pub fn wrap_scope_seed(
    master: &MasterKey,
    seed: &ScopeSeed,
    user_id: &str,
    scope: &str,
) -> FvResult<WrappedKey> {
    let aad = build_aad(SCOPE_WRAP_DOMAIN, &[user_id.as_bytes(), scope.as_bytes()]);
    wrap_key(master.as_bytes(), seed.as_bytes(), &aad)
}

/// Unwrap a scope seed under the master key.
pub fn unwrap_scope_seed(
    master: &MasterKey,
    ciphertext: &[u8],
    iv: &[u8],
    user_id: &str,
    scope: &str,
) -> FvResult<ScopeSeed> {
    let aad = build_aad(SCOPE_WRAP_DOMAIN, &[user_id.as_bytes(), scope.as_bytes()]);
    let bytes = unwrap_key(master.as_bytes(), ciphertext, iv, &aad)?;
    Ok(ScopeSeed::from_bytes(bytes))
}

/// XChaCha20-Poly1305 key wrap with a random nonce.
fn wrap_key(kek: &[u8; KEY_SIZE], key: &[u8; KEY_SIZE], aad: &[u8]) -> FvResult<WrappedKey> {
    let cipher = XChaCha20Poly1305::new(kek.into());

    let mut iv = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = XNonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: key, aad })
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    Ok(WrappedKey { ciphertext, iv })
}

fn unwrap_key(
    kek: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> FvResult<[u8; KEY_SIZE]> {
    if iv.len() != NONCE_SIZE {
        return Err(FvError::corruption(format!(
            "wrapped key IV has {} bytes (expected {NONCE_SIZE})",
            iv.len()
        )));
    }
    if ciphertext.len() != KEY_SIZE + TAG_SIZE {
        return Err(FvError::corruption(format!(
            "wrapped key has {} bytes (expected {})",
            ciphertext.len(),
            KEY_SIZE + TAG_SIZE
        )));
    }

    let cipher = XChaCha20Poly1305::new(kek.into());
    let mut plaintext = cipher
        .decrypt(XNonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| FvError::AuthenticationFailed)?;

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(key)
}

/// Build AAD as `domain || (u32 BE length || part)*`.
///
/// Length prefixes keep ("ab", "c") and ("a", "bc") distinct.
pub(crate) fn build_aad(domain: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = domain.len() + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut aad = Vec::with_capacity(len);
    aad.extend_from_slice(domain);
    for part in parts {
        aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
        aad.extend_from_slice(part);
    }
    aad
}
