//! HMAC-SHA256 blind indexes for equality search
//!
//! A blind index is deterministic: the same normalized value under the same
//! scope BIK always produces the same digest, so the store can match
//! `<field>_bi = ?` without seeing plaintext. It supports equality only.
//! Nothing about prefixes, substrings or ordering survives the HMAC.

use fv_core::FvResult;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;

use crate::keys::ScopeKeys;

const BLIND_INDEX_DOMAIN: &[u8] = b"fieldvault-bi-v1\0";

type HmacSha256 = Hmac<Sha256>;

/// Canonicalize a value before hashing: trim, Unicode default case folding,
/// NFC.
///
/// "  Mario Rossi " and "mario rossi" normalize identically, as do "STRASSE"
/// and "straße"; interior whitespace is kept as-is.
pub fn normalize(value: &str) -> String {
    caseless::default_case_fold_str(value.trim()).nfc().collect()
}

/// Compute the blind index of `value` under the scope's BIK, as lowercase hex.
pub fn compute_blind_index(keys: &ScopeKeys, value: &str) -> FvResult<String> {
    let mac = keyed_mac(keys, value)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a stored digest against a candidate value.
pub fn blind_index_matches(keys: &ScopeKeys, value: &str, digest_hex: &str) -> bool {
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    match keyed_mac(keys, value) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn keyed_mac(keys: &ScopeKeys, value: &str) -> FvResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(keys.bik())
        .map_err(|e| anyhow::anyhow!("HMAC key setup failed: {e}"))?;
    mac.update(BLIND_INDEX_DOMAIN);
    mac.update(normalize(value).as_bytes());
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_scope_keys, ScopeSeed};
    use crate::KEY_SIZE;

    fn test_keys(scope: &str) -> ScopeKeys {
        derive_scope_keys(&ScopeSeed::from_bytes([0x55u8; KEY_SIZE]), scope).unwrap()
    }

    #[test]
    fn test_whitespace_and_case_insensitive() {
        let keys = test_keys("accounts");
        let a = compute_blind_index(&keys, "Mario Rossi").unwrap();
        let b = compute_blind_index(&keys, "  mario rossi  ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_values_differ() {
        let keys = test_keys("accounts");
        let a = compute_blind_index(&keys, "Mario Rossi").unwrap();
        let b = compute_blind_index(&keys, "Mario Rosso").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unicode_normalization() {
        let keys = test_keys("accounts");
        // precomposed é vs e + combining acute
        let composed = compute_blind_index(&keys, "Caf\u{e9}").unwrap();
        let decomposed = compute_blind_index(&keys, "CAFE\u{301}").unwrap();
        assert_eq!(composed, decomposed);
    }

    #[test]
    fn test_scope_isolation() {
        let a = compute_blind_index(&test_keys("accounts"), "same").unwrap();
        let b = compute_blind_index(&test_keys("contacts"), "same").unwrap();
        assert_ne!(a, b, "same value in different scopes must not collide");
    }

    #[test]
    fn test_digest_format() {
        let digest = compute_blind_index(&test_keys("s"), "value").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_no_prefix_leak() {
        let keys = test_keys("accounts");
        let full = compute_blind_index(&keys, "Mario Rossi").unwrap();
        let prefix = compute_blind_index(&keys, "Mario").unwrap();
        assert_ne!(full[..8], prefix[..8]);
    }

    #[test]
    fn test_matches() {
        let keys = test_keys("accounts");
        let digest = compute_blind_index(&keys, "Bar Sport").unwrap();
        assert!(blind_index_matches(&keys, " bar sport", &digest));
        assert!(!blind_index_matches(&keys, "Bar Sports", &digest));
        assert!(!blind_index_matches(&keys, "Bar Sport", "not-hex"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("\t Hello World \n"), "hello world");
        assert_eq!(normalize("A  B"), "a  b");
    }

    #[test]
    fn test_full_case_folding() {
        assert_eq!(normalize("STRASSE"), normalize("stra\u{df}e"));
        // Final sigma folds like any other sigma
        let upper_greek = "\u{3a3}\u{39f}\u{3a6}\u{39f}\u{3a3}";
        let lower_greek = "\u{3c3}\u{3bf}\u{3c6}\u{3bf}\u{3c2}";
        assert_eq!(normalize(upper_greek), normalize(lower_greek));

        let keys = test_keys("contacts");
        let upper = compute_blind_index(&keys, "Via Della STRASSE").unwrap();
        let sharp = compute_blind_index(&keys, "via della stra\u{df}e").unwrap();
        assert_eq!(upper, sharp);
    }
}
