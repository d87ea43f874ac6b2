//! The cryptographic capability a device signs and generates keys with.
//!
//! Everything above this module treats an [`Account`] as opaque: it hands out
//! public keys and signatures and never exposes secret material. [`LocalAccount`]
//! is the in-process implementation backed by dalek primitives.

use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::ZeroizeOnDrop;

use crate::keys::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, IdentityKeys};
use crate::one_time_keys::MAX_ONE_TIME_KEYS_PER_CALL;

/// Cryptographic primitives a device's key lifecycle depends on.
pub trait Account: Send + Sync {
    /// The device's long-term public keys.
    fn identity_keys(&self) -> IdentityKeys;

    /// Generate `count` fresh Curve25519 key pairs, retaining the secrets and
    /// returning the public halves.
    fn generate_key_pairs(&self, count: usize) -> Vec<Curve25519PublicKey>;

    /// Sign `message` with the device's Ed25519 signing key.
    fn sign(&self, message: &[u8]) -> Ed25519Signature;
}

/// An [`Account`] holding its keys in process memory.
#[derive(ZeroizeOnDrop)]
pub struct LocalAccount {
    signing_key: SigningKey,
    curve_secret: StaticSecret,
    /// One-time secrets keyed by their public half, kept for session setup.
    #[zeroize(skip)]
    one_time_secrets: Mutex<HashMap<Curve25519PublicKey, StaticSecret>>,
}

impl LocalAccount {
    /// Generate a new account with random identity keys.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            curve_secret: StaticSecret::random_from_rng(OsRng),
            one_time_secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Restore an account from its two 32-byte identity secrets.
    pub fn from_secret_bytes(signing: &[u8; 32], curve: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            curve_secret: StaticSecret::from(curve),
            one_time_secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Number of one-time secrets still held.
    pub fn one_time_secret_count(&self) -> usize {
        self.one_time_secrets.lock().len()
    }

    /// Remove and return the secret for a one-time key a peer has consumed.
    pub fn take_one_time_secret(&self, public: &Curve25519PublicKey) -> Option<StaticSecret> {
        self.one_time_secrets.lock().remove(public)
    }
}

impl Account for LocalAccount {
    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            curve25519: Curve25519PublicKey::from(&x25519_dalek::PublicKey::from(&self.curve_secret)),
            ed25519: Ed25519PublicKey::from(&self.signing_key.verifying_key()),
        }
    }

    fn generate_key_pairs(&self, count: usize) -> Vec<Curve25519PublicKey> {
        let mut secrets = self.one_time_secrets.lock();
        let mut publics = Vec::with_capacity(count.min(MAX_ONE_TIME_KEYS_PER_CALL));
        while publics.len() < count {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = Curve25519PublicKey::from(&x25519_dalek::PublicKey::from(&secret));
            // A collision here would mean a broken RNG; draw again rather than hand out a duplicate.
            if secrets.contains_key(&public) {
                continue;
            }
            secrets.insert(public, secret);
            publics.push(public);
        }
        publics
    }

    fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature::from(&self.signing_key.sign(message))
    }
}

impl std::fmt::Debug for LocalAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAccount")
            .field("ed25519", &self.identity_keys().ed25519)
            .finish_non_exhaustive()
    }
}
