//! Public key and signature types as they appear on the wire.
//!
//! All three are fixed-size byte arrays encoded as unpadded standard base64,
//! which is what peers and the key server exchange in JSON bodies.

use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Encode bytes as unpadded standard base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decode unpadded (or padded) standard base64.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))
}

fn decode_fixed<const N: usize>(input: &str, what: &str) -> Result<[u8; N], CryptoError> {
    let bytes = decode_base64(input)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} must be {N} bytes, got {len}")))
}

macro_rules! base64_bytes {
    ($name:ident, $len:expr, $what:expr) => {
        impl $name {
            /// Parse from unpadded base64.
            pub fn from_base64(input: &str) -> Result<Self, CryptoError> {
                decode_fixed::<$len>(input, $what).map(Self)
            }

            pub fn to_base64(&self) -> String {
                encode_base64(&self.0)
            }

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base64())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_base64())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                Self::from_base64(&encoded).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// A Curve25519 (X25519) public key: identity or one-time encryption key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Curve25519PublicKey([u8; 32]);

base64_bytes!(Curve25519PublicKey, 32, "curve25519 key");

impl From<&x25519_dalek::PublicKey> for Curve25519PublicKey {
    fn from(key: &x25519_dalek::PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

/// An Ed25519 public key used to verify a device's signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey([u8; 32]);

base64_bytes!(Ed25519PublicKey, 32, "ed25519 key");

impl Ed25519PublicKey {
    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid ed25519 public key: {e}")))?;
        verifying_key
            .verify(message, &Signature::from_bytes(&signature.0))
            .map_err(|e| CryptoError::SignatureInvalid(e.to_string()))
    }

    /// Short hex fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<&VerifyingKey> for Ed25519PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature([u8; 64]);

base64_bytes!(Ed25519Signature, 64, "ed25519 signature");

impl From<&Signature> for Ed25519Signature {
    fn from(signature: &Signature) -> Self {
        Self(signature.to_bytes())
    }
}

/// The pair of long-term public keys a device publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    pub curve25519: Curve25519PublicKey,
    pub ed25519: Ed25519PublicKey,
}
