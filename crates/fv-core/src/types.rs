use serde::{Deserialize, Serialize};

use crate::FvError;

/// Suffix of the column holding a field's ciphertext
pub const ENC_SUFFIX: &str = "_enc";
/// Suffix of the column holding a field's IV
pub const IV_SUFFIX: &str = "_iv";
/// Suffix of the column holding a field's blind index
pub const BI_SUFFIX: &str = "_bi";

/// Column names backing one logical field (`<field>_enc`, `<field>_iv`, `<field>_bi`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldColumns {
    pub enc: String,
    pub iv: String,
    pub bi: String,
}

impl FieldColumns {
    pub fn for_field(field: &str) -> Self {
        Self {
            enc: format!("{field}{ENC_SUFFIX}"),
            iv: format!("{field}{IV_SUFFIX}"),
            bi: format!("{field}{BI_SUFFIX}"),
        }
    }
}

/// One encrypted field as it is written to storage, already text-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredField {
    pub enc: String,
    pub iv: String,
    /// Present only for fields designated searchable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bi: Option<String>,
}

/// Outcome of decrypting one named field in a batch
#[derive(Debug)]
pub enum FieldValue {
    /// Decrypted plaintext
    Present(String),
    /// No ciphertext or IV stored for this field
    Absent,
    /// Ciphertext was stored but could not be decrypted
    Failed(FvError),
}

impl FieldValue {
    pub fn as_present(&self) -> Option<&str> {
        match self {
            FieldValue::Present(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FieldValue::Failed(_))
    }
}

/// Counts returned by a destructive account reset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub user_id: String,
    /// Encrypted row records deleted
    pub rows_deleted: u64,
    /// Scope key records deleted
    pub scope_keys_deleted: u64,
    /// Whether a wrapped master key was present and has been nulled
    pub master_key_cleared: bool,
}

/// Result of a conditional insert at the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}
