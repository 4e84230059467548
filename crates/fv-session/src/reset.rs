//! Destructive account reset (forgotten passphrase).
//!
//! Deletes every encrypted row, every scope key record and nulls the wrapped
//! master key, after which the account can be provisioned again. Allowed
//! only outside production and only when explicitly enabled.

use fv_core::config::ResetConfig;
use fv_core::types::ResetReport;
use fv_core::{FvError, FvResult};
use fv_store::{KeyStore, RecordStore};

use crate::session::Session;

/// Whether a reset may run, decided once from configuration and the
/// environment before anything is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetAuthorization {
    Allowed,
    Denied(String),
}

impl ResetAuthorization {
    /// Read the enabling flag from the environment variable named in `cfg`.
    pub fn from_env(cfg: &ResetConfig) -> Self {
        let flag = std::env::var(&cfg.allow_env).ok();
        Self::evaluate(cfg, flag.as_deref())
    }

    pub fn evaluate(cfg: &ResetConfig, flag: Option<&str>) -> Self {
        if cfg.is_production() {
            return Self::Denied(format!(
                "environment '{}' does not permit reset",
                cfg.environment
            ));
        }
        match flag.map(str::trim) {
            Some(v) if v == "1" || v.eq_ignore_ascii_case("true") => Self::Allowed,
            _ => Self::Denied(format!("{} is not set to 1 or true", cfg.allow_env)),
        }
    }

    pub fn check(&self) -> FvResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(reason) => Err(FvError::ResetForbidden(reason.clone())),
        }
    }
}

/// Wipe all key material and encrypted rows of `user_id`.
///
/// Rows go first and the master key last, so an interrupted reset can simply
/// be run again.
pub async fn force_reset<K, R>(
    keys: &K,
    records: &R,
    user_id: &str,
    auth: &ResetAuthorization,
) -> FvResult<ResetReport>
where
    K: KeyStore + ?Sized,
    R: RecordStore + ?Sized,
{
    if let Err(e) = auth.check() {
        tracing::warn!(user_id, error = %e, "reset refused");
        return Err(e);
    }

    tracing::warn!(user_id, "resetting account: all encrypted data will be destroyed");

    let rows_deleted = records.delete_rows(user_id).await?;
    let scope_keys_deleted = keys.delete_scopes(user_id).await?;
    let master_key_cleared = keys.clear_master_key(user_id).await?;

    let report = ResetReport {
        user_id: user_id.to_string(),
        rows_deleted,
        scope_keys_deleted,
        master_key_cleared,
    };
    tracing::info!(
        user_id,
        rows_deleted,
        scope_keys_deleted,
        master_key_cleared,
        "account reset complete"
    );
    Ok(report)
}

impl<K: KeyStore + ?Sized> Session<K> {
    /// Lock the session, then reset its account.
    pub async fn force_reset<R: RecordStore + ?Sized>(
        &self,
        records: &R,
        auth: &ResetAuthorization,
    ) -> FvResult<ResetReport> {
        auth.check()?;
        self.lock();
        force_reset(self.store().as_ref(), records, self.user_id(), auth).await
    }
}
