//! fv-crypto: field-level encryption primitives for FieldVault
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id(salt, params)──▶ Wrapping Key (never stored)
//!   └── Master Key (256-bit random, wrapped: XChaCha20-Poly1305, AAD=user_id)
//!         └── Scope Seed (256-bit random per scope, wrapped, AAD=user_id||scope)
//!               ├── DEK (HKDF-SHA256, salt=scope, info="fieldvault-scope-dek-v1")
//!               │     └── Field AEAD: XChaCha20-Poly1305, AAD=table||row_id||field
//!               └── BIK (HKDF-SHA256, salt=scope, info="fieldvault-scope-bik-v1")
//!                     └── Blind index: HMAC-SHA256(normalized value)
//!
//! Server Secret ──HKDF──▶ Server Key (AES-256-GCM, separate trust boundary)
//! ```

pub mod blind;
pub mod encoding;
pub mod field;
pub mod kdf;
pub mod keys;
pub mod server;

pub use blind::{blind_index_matches, compute_blind_index, normalize};
pub use encoding::{from_cipher_bytes, to_cipher_bytes};
pub use field::{decrypt_field, encrypt_field, EncryptedField, FieldContext};
pub use kdf::{derive_wrapping_key, generate_salt, KdfAlgorithm, KdfParams, WrappingKey};
pub use keys::{
    derive_scope_keys, generate_scope_seed, unwrap_master_key, unwrap_scope_seed,
    wrap_master_key, wrap_scope_seed, MasterKey, ScopeKeys, ScopeSeed, WrappedKey,
};
pub use server::{SealedRecord, ServerCipher};

/// Size of every symmetric key in the hierarchy (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 / GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a freshly generated KDF salt
pub const SALT_SIZE: usize = 16;
