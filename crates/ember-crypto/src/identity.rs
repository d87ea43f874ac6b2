use serde::{Deserialize, Serialize};

use crate::keys::{Curve25519PublicKey, Ed25519PublicKey, IdentityKeys};

/// Encryption algorithms a device advertises in its published key set.
pub const SUPPORTED_ALGORITHMS: [&str; 2] = ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"];

/// A device's long-term public identity.
///
/// Immutable once created: the keys come from the device's [`Account`](crate::Account)
/// and the ids from the session the device logged in with. Every other component reads
/// it freely without synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    user_id: String,
    device_id: String,
    identity_keys: IdentityKeys,
}

impl DeviceIdentity {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        identity_keys: IdentityKeys,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            identity_keys,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The Curve25519 key peers use to set up ratchet sessions with this device.
    pub fn curve25519(&self) -> Curve25519PublicKey {
        self.identity_keys.curve25519
    }

    /// The Ed25519 key that verifies everything this device signs.
    pub fn ed25519(&self) -> Ed25519PublicKey {
        self.identity_keys.ed25519
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// Key id under which this device's key of `algorithm` is published, e.g. `ed25519:DEVICE`.
    pub fn key_id(&self, algorithm: &str) -> String {
        format!("{algorithm}:{}", self.device_id)
    }
}
