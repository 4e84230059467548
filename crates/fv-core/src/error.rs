use thiserror::Error;

pub type FvResult<T> = Result<T, FvError>;

#[derive(Debug, Error)]
pub enum FvError {
    /// Tag verification failed. Deliberately carries no detail: a wrong
    /// passphrase, tampered ciphertext and a wrong row binding all look alike.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("corrupt key material: {0}")]
    Corruption(String),

    #[error("field has no stored ciphertext: {0}")]
    MissingField(String),

    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("session is locked")]
    Locked,

    #[error("no key material provisioned for user {0}")]
    NotProvisioned(String),

    #[error("key material already provisioned for user {0}")]
    AlreadyProvisioned(String),

    #[error("passphrase not available")]
    PassphraseUnavailable,

    #[error("reset forbidden: {0}")]
    ResetForbidden(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FvError {
    /// Whether an unlock attempt that failed with this error may succeed if
    /// simply tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FvError::TransientStore(_) | FvError::PassphraseUnavailable
        )
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        FvError::Corruption(msg.into())
    }
}
