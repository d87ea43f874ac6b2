//! Signed key sets and their verification.
//!
//! A signature covers the canonical JSON of an object with its `signatures`
//! and `unsigned` members removed, and is stored back into the object as
//! `signatures[user_id]["ed25519:<device_id>"]`. Any peer can re-derive the
//! same bytes and check the signature against the device's Ed25519 key.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::Account;
use crate::canonical::signable_bytes;
use crate::error::CryptoError;
use crate::identity::{DeviceIdentity, SUPPORTED_ALGORITHMS};
use crate::keys::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};
use crate::one_time_keys::{OneTimeKey, SIGNED_CURVE25519};

/// Signing algorithm prefix used in signature and key ids.
pub const ED25519: &str = "ed25519";

/// `user_id -> "ed25519:<device_id>" -> base64 signature`.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// A device's published identity key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub user_id: String,
    pub device_id: String,
    pub algorithms: Vec<String>,
    /// `"<algorithm>:<device_id>" -> base64 public key`.
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

impl DeviceKeys {
    /// The Ed25519 key this record claims for its own device.
    pub fn ed25519_key(&self) -> Result<Ed25519PublicKey, CryptoError> {
        let key_id = format!("{ED25519}:{}", self.device_id);
        let encoded = self
            .keys
            .get(&key_id)
            .ok_or_else(|| CryptoError::InvalidKey(format!("record has no {key_id} key")))?;
        Ed25519PublicKey::from_base64(encoded)
    }

    /// The Curve25519 identity key this record claims for its own device.
    pub fn curve25519_key(&self) -> Result<Curve25519PublicKey, CryptoError> {
        let key_id = format!("curve25519:{}", self.device_id);
        let encoded = self
            .keys
            .get(&key_id)
            .ok_or_else(|| CryptoError::InvalidKey(format!("record has no {key_id} key")))?;
        Curve25519PublicKey::from_base64(encoded)
    }

    /// Check the device's signature over its own key set.
    pub fn verify_self_signature(&self) -> Result<Ed25519PublicKey, CryptoError> {
        let signing_key = self.ed25519_key()?;
        let value = serde_json::to_value(self)?;
        verify_json(&signing_key, &self.user_id, &self.device_id, &value)?;
        Ok(signing_key)
    }
}

/// A one-time key uploaded under `signed_curve25519`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    pub key: String,
    #[serde(default)]
    pub signatures: Signatures,
}

impl SignedKey {
    /// Check the signature `user_id`'s `device_id` made over this key.
    pub fn verify(
        &self,
        signing_key: &Ed25519PublicKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<Curve25519PublicKey, CryptoError> {
        let value = serde_json::to_value(self)?;
        verify_json(signing_key, user_id, device_id, &value)?;
        Curve25519PublicKey::from_base64(&self.key)
    }
}

/// Produces signed representations of a device's key sets.
#[derive(Clone)]
pub struct KeySigner {
    account: Arc<dyn Account>,
}

impl KeySigner {
    pub fn new(account: Arc<dyn Account>) -> Self {
        Self { account }
    }

    /// Add this device's signature to a JSON object, keeping any signatures already present.
    pub fn sign_json(&self, user_id: &str, device_id: &str, value: Value) -> Result<Value, CryptoError> {
        let Value::Object(mut object) = value else {
            return Err(CryptoError::Canonicalization(
                "only JSON objects can carry signatures".into(),
            ));
        };

        let payload = signable_bytes(&Value::Object(object.clone()))?;
        let signature = self.account.sign(&payload);

        let signatures = object
            .entry("signatures")
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(signatures) = signatures else {
            return Err(CryptoError::Canonicalization("signatures must be an object".into()));
        };
        let by_user = signatures
            .entry(user_id.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(by_user) = by_user else {
            return Err(CryptoError::Canonicalization(format!(
                "signatures for {user_id} must be an object"
            )));
        };
        by_user.insert(
            format!("{ED25519}:{device_id}"),
            Value::String(signature.to_base64()),
        );

        Ok(Value::Object(object))
    }

    /// Sign the device's identity keys for upload.
    pub fn sign_identity_keys(&self, identity: &DeviceIdentity) -> Result<DeviceKeys, CryptoError> {
        self.ensure_owns(identity)?;

        let keys = BTreeMap::from([
            (identity.key_id("curve25519"), identity.curve25519().to_base64()),
            (identity.key_id(ED25519), identity.ed25519().to_base64()),
        ]);
        let unsigned = DeviceKeys {
            user_id: identity.user_id().to_owned(),
            device_id: identity.device_id().to_owned(),
            algorithms: SUPPORTED_ALGORITHMS.iter().map(|a| (*a).to_owned()).collect(),
            keys,
            signatures: Signatures::new(),
            unsigned: None,
        };

        let signed = self.sign_json(
            identity.user_id(),
            identity.device_id(),
            serde_json::to_value(&unsigned)?,
        )?;
        Ok(serde_json::from_value(signed)?)
    }

    /// Sign each one-time key individually, keyed by `signed_curve25519:<key_id>`.
    pub fn sign_one_time_keys(
        &self,
        identity: &DeviceIdentity,
        keys: &[OneTimeKey],
    ) -> Result<BTreeMap<String, SignedKey>, CryptoError> {
        self.ensure_owns(identity)?;

        keys.iter()
            .map(|key| {
                let unsigned = SignedKey {
                    key: key.public_key.to_base64(),
                    signatures: Signatures::new(),
                };
                let signed = self.sign_json(
                    identity.user_id(),
                    identity.device_id(),
                    serde_json::to_value(&unsigned)?,
                )?;
                Ok((
                    key.algorithm_key_id(SIGNED_CURVE25519),
                    serde_json::from_value(signed)?,
                ))
            })
            .collect()
    }

    fn ensure_owns(&self, identity: &DeviceIdentity) -> Result<(), CryptoError> {
        if self.account.identity_keys() != identity.identity_keys() {
            return Err(CryptoError::InvalidKey(format!(
                "identity {} does not belong to this account",
                identity.ed25519().fingerprint()
            )));
        }
        Ok(())
    }
}

/// Verify `user_id`'s `device_id` signature on a JSON object.
pub fn verify_json(
    signing_key: &Ed25519PublicKey,
    user_id: &str,
    device_id: &str,
    value: &Value,
) -> Result<(), CryptoError> {
    let key_id = format!("{ED25519}:{device_id}");
    let encoded = value
        .get("signatures")
        .and_then(|s| s.get(user_id))
        .and_then(|s| s.get(&key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CryptoError::SignatureInvalid(format!("no {key_id} signature from {user_id}"))
        })?;

    let signature = Ed25519Signature::from_base64(encoded)
        .map_err(|e| CryptoError::SignatureInvalid(format!("malformed signature: {e}")))?;
    signing_key.verify(&signable_bytes(value)?, &signature)
}
