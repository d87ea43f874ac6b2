use thiserror::Error;

use ember_crypto::CryptoError;

/// Classified failure of a key operation.
///
/// Every variant is delivered through the originating operation's result;
/// none of them is process-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeysError {
    #[error("session not ready: log in before using key operations")]
    SessionNotReady,

    #[error("invalid one-time key count: {0}")]
    InvalidCount(i64),

    /// Network or HTTP failure without a domain error body. Status 0 means no response.
    #[error("transport error (status {status}): {message}")]
    TransportError { status: u16, message: String },

    #[error("server error {errcode} (status {status}): {error}")]
    ProtocolError {
        status: u16,
        errcode: String,
        error: String,
    },

    #[error("unexpected response shape: {0}")]
    ParseError(String),

    #[error("signature invalid for {user_id}/{device_id}: {reason}")]
    SignatureInvalid {
        user_id: String,
        device_id: String,
        reason: String,
    },

    #[error("record for {actual} filed under {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<CryptoError> for KeysError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidCount(n) => Self::InvalidCount(n),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KeysError {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseError(e.to_string())
    }
}
