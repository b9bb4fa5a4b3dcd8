//! The stable error taxonomy the core surfaces to callers.
//!
//! Unlock-path cryptographic failures are deliberately collapsed before they
//! reach here (see `unlock::UnlockService::unlock_with_pin`, which returns a
//! plain `bool` rather than a `CoreError` for wrong-PIN/no-such-user). This
//! type is for everything else: decrypt-path tamper detection (the caller is
//! already authenticated by that point), lockouts, rate limits, and the
//! narrow set of storage/crypto failures that aren't misuse bugs.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no master key is cached for this user")]
    Locked,

    #[error("account is locked out after repeated failed PIN attempts")]
    AccountLocked,

    #[error("credentials were rejected")]
    InvalidCredentials,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("ciphertext or header failed integrity verification")]
    Tampered,

    #[error("a record with this id already exists")]
    Conflict,

    #[error("record not found")]
    NotFound,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("transient storage error: {0}")]
    Transient(String),
}

impl CoreError {
    /// The stable string the HTTP boundary maps onto a status code, per the
    /// external-interfaces error-code table. Never include details here —
    /// the whole point is that `Locked` and `AccountLocked` are visually and
    /// semantically distinct but equally uninformative to a remote caller.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Locked => "unauthorized",
            CoreError::AccountLocked => "account_locked",
            CoreError::InvalidCredentials => "invalid_pin",
            CoreError::DecryptFailed => "invalid_pin",
            CoreError::Tampered => "invalid_request",
            CoreError::Conflict => "invalid_request",
            CoreError::NotFound => "not_found",
            CoreError::RateLimited => "too_many_requests",
            CoreError::ServiceUnavailable => "service_unavailable",
            CoreError::Transient(_) => "internal_server_error",
        }
    }
}

impl From<crate::crypto::CryptoError> for CoreError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        match err {
            crate::crypto::CryptoError::Aead => CoreError::DecryptFailed,
            other => CoreError::Transient(other.to_string()),
        }
    }
}

impl From<crate::key_store::StoreError> for CoreError {
    fn from(err: crate::key_store::StoreError) -> Self {
        match err {
            crate::key_store::StoreError::Conflict(_) => CoreError::Conflict,
            crate::key_store::StoreError::NotFound(_) => CoreError::NotFound,
            crate::key_store::StoreError::Io(msg) => CoreError::Transient(msg),
        }
    }
}
