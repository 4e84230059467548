//! fv-session: the end-to-end encrypted field session
//!
//! A [`Session`] binds one user to a key store. Unlocking derives the
//! wrapping key from the passphrase, unwraps the master key and keeps it in
//! memory until [`Session::lock`]. Scope keys are loaded (or created) on
//! first use and cached for the life of the unlock.

pub mod reset;
pub mod retry;
pub mod scope;
pub mod session;
pub mod vault;

pub use reset::{force_reset, ResetAuthorization};
pub use retry::RetryPolicy;
pub use scope::ScopeKeyManager;
pub use session::{CachedPassphrase, PassphraseSource, Session, SessionState};
pub use vault::MasterKeyVault;
