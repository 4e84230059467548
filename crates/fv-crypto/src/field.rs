//! Per-field XChaCha20-Poly1305 encryption/decryption
//!
//! Each field value is stored as two sibling columns:
//! ```text
//! <field>_enc = ciphertext || 16-byte Poly1305 tag
//! <field>_iv  = 24-byte random nonce (fresh for every write)
//! AAD = "fieldvault-field-v1" || len||table || len||row_id || len||field
//! ```
//!
//! The AAD binds each ciphertext to the exact row and column it was written
//! to, so copying it into another row (or another column of the same row)
//! fails authentication instead of decrypting.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use fv_core::{FvError, FvResult};
use rand::RngCore;

use crate::keys::{build_aad, ScopeKeys};
use crate::{NONCE_SIZE, TAG_SIZE};

const FIELD_DOMAIN: &[u8] = b"fieldvault-field-v1";

/// Where a field value lives; every part is authenticated.
#[derive(Debug, Clone, Copy)]
pub struct FieldContext<'a> {
    pub table: &'a str,
    pub row_id: &'a str,
    pub field: &'a str,
}

impl<'a> FieldContext<'a> {
    pub fn new(table: &'a str, row_id: &'a str, field: &'a str) -> Self {
        Self {
            table,
            row_id,
            field,
        }
    }

    fn aad(&self) -> Vec<u8> {
        build_aad(
            FIELD_DOMAIN,
            &[
                self.table.as_bytes(),
                self.row_id.as_bytes(),
                self.field.as_bytes(),
            ],
        )
    }
}

/// Raw ciphertext and IV of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_SIZE],
}

/// Encrypt a field value with the scope's DEK.
pub fn encrypt_field(
    keys: &ScopeKeys,
    ctx: &FieldContext<'_>,
    plaintext: &[u8],
) -> FvResult<EncryptedField> {
    let cipher = XChaCha20Poly1305::new(keys.dek().into());

    let mut iv = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = XNonce::from_slice(&iv);

    let aad = ctx.aad();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("field encryption failed: {e}"))?;

    Ok(EncryptedField { ciphertext, iv })
}

/// Decrypt a field value with the scope's DEK.
///
/// Fails closed with `AuthenticationFailed` on a wrong key, tampered
/// ciphertext, or a table/row/field that differs from the one used at
/// encryption time.
pub fn decrypt_field(
    keys: &ScopeKeys,
    ctx: &FieldContext<'_>,
    ciphertext: &[u8],
    iv: &[u8],
) -> FvResult<Vec<u8>> {
    if iv.len() != NONCE_SIZE {
        return Err(FvError::corruption(format!(
            "field IV has {} bytes (expected {NONCE_SIZE})",
            iv.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(FvError::corruption(format!(
            "field ciphertext too short: {} bytes (minimum {TAG_SIZE})",
            ciphertext.len()
        )));
    }

    let cipher = XChaCha20Poly1305::new(keys.dek().into());
    let aad = ctx.aad();

    cipher
        .decrypt(
            XNonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| FvError::AuthenticationFailed)
}
