use nostr::{Nip01Error, Nip04Error, Nip90Error};
use thiserror::Error;

/// Errors surfaced by job orchestration.
///
/// Every failure ends up as exactly one of these; a stream that fails yields
/// one `Err` and then ends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DvmError {
    /// Malformed request, rejected before any network I/O.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    /// Encrypted payload present but unreadable with the supplied key.
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Publish, subscribe or query failed at the transport.
    #[error("network error: {0}")]
    Network(String),

    /// The provider reported an error or sent something we cannot act on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wallet failure or payment timeout. Not retried.
    #[error("payment error: {0}")]
    Payment(String),

    #[error("config error: {0}")]
    Config(String),

    /// Local inference backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DvmError {
    /// Only transport failures are worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DvmError::Network(_))
    }
}

impl From<Nip04Error> for DvmError {
    fn from(err: Nip04Error) -> Self {
        DvmError::Decryption(err.to_string())
    }
}

impl From<Nip01Error> for DvmError {
    fn from(err: Nip01Error) -> Self {
        DvmError::Validation(err.to_string())
    }
}

impl From<Nip90Error> for DvmError {
    fn from(err: Nip90Error) -> Self {
        DvmError::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for DvmError {
    fn from(err: toml::de::Error) -> Self {
        DvmError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DvmError>;
