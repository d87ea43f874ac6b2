pub mod account;
pub mod canonical;
pub mod error;
pub mod identity;
pub mod keys;
pub mod one_time_keys;
pub mod signing;

pub use account::{Account, LocalAccount};
pub use error::CryptoError;
pub use identity::DeviceIdentity;
pub use keys::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, IdentityKeys};
pub use one_time_keys::{
    OneTimeKey, OneTimeKeyPool, CURVE25519, MAX_ONE_TIME_KEYS_PER_CALL, SIGNED_CURVE25519,
};
pub use signing::{DeviceKeys, KeySigner, SignedKey, Signatures};
