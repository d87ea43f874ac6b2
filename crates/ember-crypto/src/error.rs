use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid one-time key count: {0}")]
    InvalidCount(i64),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("canonical JSON error: {0}")]
    Canonicalization(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
