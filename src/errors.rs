use std::time::Duration;

use thiserror::Error;

/// Failure fetching from, or authenticating against, an external provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, 5xx, transport failure or malformed response.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Refresh failed, refresh token missing or the provider rejected the token.
    #[error("credential invalid: {0}")]
    CredentialInvalid(String),
}

impl ProviderError {
    pub fn timed_out(after: Duration) -> Self {
        ProviderError::Unavailable(format!("timed out after {}s", after.as_secs()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => "provider_unavailable",
            ProviderError::CredentialInvalid(_) => "credential_invalid",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The user cannot be messaged (DMs disabled, unknown user).
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),

    #[error("delivery failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Database(format!("blocking task failed: {}", err))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key is empty")]
    MissingKey,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Failure scoped to one account, user or item inside a job run. Recovered
/// locally and reported, never propagated past the job.
#[derive(Debug, Error)]
pub enum ReminderError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReminderError {
    pub fn label(&self) -> &'static str {
        match self {
            ReminderError::Provider(err) => err.label(),
            ReminderError::Delivery(DeliveryError::RecipientUnreachable(_)) => {
                "recipient_unreachable"
            }
            ReminderError::Delivery(DeliveryError::Failed(_)) => "delivery_failed",
            ReminderError::Store(_) => "store",
        }
    }
}

impl From<CryptoError> for ReminderError {
    fn from(err: CryptoError) -> Self {
        ReminderError::Store(StoreError::Crypto(err))
    }
}

/// Failure escaping a job body. The scheduler logs it and keeps running.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job store failure: {0}")]
    Store(#[from] StoreError),

    #[error("job panicked or was cancelled: {0}")]
    Aborted(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to read config file: {0}")]
    File(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("authorization request expired or unknown")]
    UnknownState,

    #[error("authorization was started by another user")]
    WrongUser,

    #[error("redirect is missing the `{0}` parameter")]
    MissingParameter(&'static str),

    #[error("invalid redirect url: {0}")]
    InvalidRedirect(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Top-level failure of a run mode or CLI command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("prompt failed: {0}")]
    Prompt(String),
}

impl From<inquire::InquireError> for AppError {
    fn from(err: inquire::InquireError) -> Self {
        AppError::Prompt(err.to_string())
    }
}
