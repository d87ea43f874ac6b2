//! Single-use Curve25519 keys awaiting publication.
//!
//! The pool allocates key ids from a monotonic counter, so ids stay unique for
//! the pool's lifetime even when `generate` calls race. Keys stay in the pool
//! until the server has acknowledged them; the server is authoritative for
//! consumption after that.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::error::CryptoError;
use crate::keys::{encode_base64, Curve25519PublicKey};

/// Algorithm name for one-time keys uploaded as bare public keys.
pub const CURVE25519: &str = "curve25519";
/// Algorithm name for one-time keys uploaded with a device signature.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Largest batch a single [`OneTimeKeyPool::generate`] call will produce.
pub const MAX_ONE_TIME_KEYS_PER_CALL: usize = 10_000;

/// A single-use public key together with its device-unique id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    pub key_id: String,
    pub public_key: Curve25519PublicKey,
}

impl OneTimeKey {
    /// Wire id for this key under `algorithm`, e.g. `signed_curve25519:AAAAAAAAAAE`.
    pub fn algorithm_key_id(&self, algorithm: &str) -> String {
        format!("{algorithm}:{}", self.key_id)
    }
}

/// Generates and tracks one-time keys until the server confirms them.
pub struct OneTimeKeyPool {
    account: Arc<dyn Account>,
    next_id: AtomicU64,
    unpublished: Mutex<BTreeMap<u64, OneTimeKey>>,
}

impl OneTimeKeyPool {
    pub fn new(account: Arc<dyn Account>) -> Self {
        Self {
            account,
            next_id: AtomicU64::new(1),
            unpublished: Mutex::new(BTreeMap::new()),
        }
    }

    /// Generate exactly `count` new keys.
    ///
    /// Fails with [`CryptoError::InvalidCount`] for `count <= 0` or above
    /// [`MAX_ONE_TIME_KEYS_PER_CALL`], without touching the pool.
    ///
    /// # Panics
    ///
    /// Panics if an allocated key id is already present, which means the id
    /// counter was corrupted.
    pub fn generate(&self, count: i64) -> Result<usize, CryptoError> {
        let n = usize::try_from(count)
            .ok()
            .filter(|n| (1..=MAX_ONE_TIME_KEYS_PER_CALL).contains(n))
            .ok_or(CryptoError::InvalidCount(count))?;

        let first = self.next_id.fetch_add(n as u64, Ordering::SeqCst);
        let publics = self.account.generate_key_pairs(n);
        if publics.len() != n {
            return Err(CryptoError::InvalidCount(count));
        }

        let mut unpublished = self.unpublished.lock();
        for (offset, public_key) in (0u64..).zip(publics) {
            let counter = first + offset;
            let key = OneTimeKey {
                key_id: encode_key_id(counter),
                public_key,
            };
            let previous = unpublished.insert(counter, key);
            assert!(previous.is_none(), "one-time key id {counter} allocated twice");
        }

        tracing::debug!(generated = n, unpublished = unpublished.len(), "generated one-time keys");
        Ok(n)
    }

    /// Copy of the keys not yet acknowledged by the server, in id order.
    pub fn snapshot(&self) -> Vec<OneTimeKey> {
        self.unpublished.lock().values().cloned().collect()
    }

    /// Drop keys the server has acknowledged. Returns how many were removed.
    pub fn mark_published<'a>(&self, key_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut unpublished = self.unpublished.lock();
        let mut removed = 0;
        for key_id in key_ids {
            if let Some(counter) = decode_key_id(key_id) {
                if unpublished.remove(&counter).is_some() {
                    removed += 1;
                }
            }
        }
        tracing::debug!(removed, remaining = unpublished.len(), "marked one-time keys published");
        removed
    }

    pub fn len(&self) -> usize {
        self.unpublished.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.unpublished.lock().is_empty()
    }
}

fn encode_key_id(counter: u64) -> String {
    encode_base64(&counter.to_be_bytes())
}

fn decode_key_id(key_id: &str) -> Option<u64> {
    let bytes = crate::keys::decode_base64(key_id).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
