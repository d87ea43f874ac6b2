use std::collections::BTreeMap;
use std::sync::Arc;

use ember_crypto::{Curve25519PublicKey, SIGNED_CURVE25519};
use serde_json::Value;

use crate::error::KeysError;
use crate::ledger::RequestLedger;
use crate::query::{QueryResult, RejectedDevice};
use crate::session::SessionHandle;
use crate::transport::{Request, Transport};
use crate::wire::{ClaimKeysRequest, ClaimKeysResponse, OneTimeKeyValue, KEYS_CLAIM};

/// `user_id -> device_id -> algorithm` to claim one key for.
pub type ClaimTargets = BTreeMap<String, BTreeMap<String, String>>;

/// A one-time key taken from another device's published set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedKey {
    /// Full wire id, e.g. `signed_curve25519:AAAAAAAAAAE`.
    pub key_id: String,
    pub public_key: Curve25519PublicKey,
    /// Whether the key carried a signature that verified against the device's identity.
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimResult {
    pub one_time_keys: BTreeMap<String, BTreeMap<String, ClaimedKey>>,
    pub failures: BTreeMap<String, Value>,
    pub rejected: Vec<RejectedDevice>,
}

impl ClaimResult {
    pub fn key(&self, user_id: &str, device_id: &str) -> Option<&ClaimedKey> {
        self.one_time_keys.get(user_id)?.get(device_id)
    }
}

/// Claims one-time keys of other devices.
#[derive(Clone)]
pub struct KeyClaimCoordinator {
    ledger: RequestLedger,
    transport: Arc<dyn Transport>,
    session: SessionHandle,
}

impl KeyClaimCoordinator {
    pub fn new(ledger: RequestLedger, transport: Arc<dyn Transport>, session: SessionHandle) -> Self {
        Self {
            ledger,
            transport,
            session,
        }
    }

    /// Claim one key per target device.
    ///
    /// Signed keys are checked against the Ed25519 keys in `known_devices`,
    /// which should come from a prior query. A signed key for a device not in
    /// `known_devices`, or whose signature fails, is reported in
    /// [`ClaimResult::rejected`]. Claimed keys are consumed on the server
    /// either way.
    pub async fn claim(
        &self,
        targets: ClaimTargets,
        known_devices: &QueryResult,
    ) -> Result<ClaimResult, KeysError> {
        let session = self.session.current()?;
        let body = ClaimKeysRequest {
            one_time_keys: targets,
            timeout: None,
        };

        tracing::debug!(users = body.one_time_keys.len(), "claiming one-time keys");
        let request = Request::post(KEYS_CLAIM, serde_json::to_value(&body)?)
            .with_access_token(&session.access_token);
        let response = self.ledger.dispatch(self.transport.clone(), request).await?;
        let response: ClaimKeysResponse = serde_json::from_value(response)
            .map_err(|e| KeysError::ParseError(format!("claim response: {e}")))?;

        Ok(validate_claims(&body.one_time_keys, known_devices, response))
    }
}

fn validate_claims(
    targets: &ClaimTargets,
    known_devices: &QueryResult,
    response: ClaimKeysResponse,
) -> ClaimResult {
    let mut result = ClaimResult {
        failures: response.failures,
        ..ClaimResult::default()
    };

    for (user_id, devices) in response.one_time_keys {
        let Some(requested) = targets.get(&user_id) else {
            tracing::warn!(%user_id, "server returned a claim for a user that was not requested");
            continue;
        };

        for (device_id, keys) in devices {
            let Some(algorithm) = requested.get(&device_id) else {
                tracing::warn!(%user_id, %device_id, "server returned a claim for a device that was not requested");
                continue;
            };
            let Some((key_id, value)) = keys.into_iter().next() else {
                continue;
            };

            match validate_claimed_key(&user_id, &device_id, algorithm, &key_id, &value, known_devices) {
                Ok(claimed) => {
                    result
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id, claimed);
                }
                Err(error) => {
                    tracing::warn!(%user_id, %device_id, %error, "rejecting claimed key");
                    result.rejected.push(RejectedDevice {
                        user_id: user_id.clone(),
                        device_id,
                        error,
                    });
                }
            }
        }
    }

    result
}

fn validate_claimed_key(
    user_id: &str,
    device_id: &str,
    algorithm: &str,
    key_id: &str,
    value: &OneTimeKeyValue,
    known_devices: &QueryResult,
) -> Result<ClaimedKey, KeysError> {
    let invalid = |reason: String| KeysError::SignatureInvalid {
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
        reason,
    };

    if key_id.split_once(':').map(|(alg, _)| alg) != Some(algorithm) {
        return Err(KeysError::ParseError(format!(
            "claimed {key_id} for {user_id}/{device_id}, requested {algorithm}"
        )));
    }

    match value {
        OneTimeKeyValue::Signed(signed) => {
            let device = known_devices
                .device(user_id, device_id)
                .ok_or_else(|| invalid("no verified device keys to check against".into()))?;
            let signing_key = device.ed25519_key().map_err(|e| invalid(e.to_string()))?;
            let public_key = signed
                .verify(&signing_key, user_id, device_id)
                .map_err(|e| invalid(e.to_string()))?;
            Ok(ClaimedKey {
                key_id: key_id.to_owned(),
                public_key,
                verified: true,
            })
        }
        OneTimeKeyValue::Unsigned(_) if algorithm == SIGNED_CURVE25519 => {
            Err(invalid("signed key requested but unsigned key returned".into()))
        }
        OneTimeKeyValue::Unsigned(encoded) => Ok(ClaimedKey {
            key_id: key_id.to_owned(),
            public_key: Curve25519PublicKey::from_base64(encoded)
                .map_err(|e| KeysError::ParseError(e.to_string()))?,
            verified: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use ember_crypto::{Account, DeviceIdentity, KeySigner, LocalAccount, OneTimeKeyPool, CURVE25519};
    use serde_json::json;

    use super::*;

    struct Device {
        identity: DeviceIdentity,
        signer: KeySigner,
        pool: OneTimeKeyPool,
    }

    fn device(user_id: &str, device_id: &str) -> Device {
        let account: Arc<dyn Account> = Arc::new(LocalAccount::generate());
        let pool = OneTimeKeyPool::new(account.clone());
        pool.generate(1).unwrap();
        Device {
            identity: DeviceIdentity::new(user_id, device_id, account.identity_keys()),
            signer: KeySigner::new(account),
            pool,
        }
    }

    fn known(device: &Device) -> QueryResult {
        let keys = device.signer.sign_identity_keys(&device.identity).unwrap();
        let mut result = QueryResult::default();
        result
            .device_keys
            .entry(device.identity.user_id().to_owned())
            .or_default()
            .insert(device.identity.device_id().to_owned(), keys);
        result
    }

    fn targets(user_id: &str, device_id: &str, algorithm: &str) -> ClaimTargets {
        BTreeMap::from([(
            user_id.to_owned(),
            BTreeMap::from([(device_id.to_owned(), algorithm.to_owned())]),
        )])
    }

    fn response(user_id: &str, device_id: &str, key_id: String, value: OneTimeKeyValue) -> ClaimKeysResponse {
        ClaimKeysResponse {
            one_time_keys: BTreeMap::from([(
                user_id.to_owned(),
                BTreeMap::from([(device_id.to_owned(), BTreeMap::from([(key_id, value)]))]),
            )]),
            failures: BTreeMap::new(),
        }
    }

    fn signed_response(bob: &Device) -> ClaimKeysResponse {
        let (key_id, signed) = bob
            .signer
            .sign_one_time_keys(&bob.identity, &bob.pool.snapshot())
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        response("@bob:localhost", "BOBDEV", key_id, OneTimeKeyValue::Signed(signed))
    }

    #[test]
    fn signed_key_verifies_against_queried_device() {
        let bob = device("@bob:localhost", "BOBDEV");
        let result = validate_claims(
            &targets("@bob:localhost", "BOBDEV", SIGNED_CURVE25519),
            &known(&bob),
            signed_response(&bob),
        );

        let claimed = result.key("@bob:localhost", "BOBDEV").unwrap();
        assert!(claimed.verified);
        assert_eq!(claimed.public_key, bob.pool.snapshot()[0].public_key);
        assert!(result.rejected.is_empty());
    }

    #[test]
    fn signed_key_from_unknown_device_is_rejected() {
        let bob = device("@bob:localhost", "BOBDEV");
        let result = validate_claims(
            &targets("@bob:localhost", "BOBDEV", SIGNED_CURVE25519),
            &QueryResult::default(),
            signed_response(&bob),
        );
        assert!(result.key("@bob:localhost", "BOBDEV").is_none());
        assert!(matches!(result.rejected[0].error, KeysError::SignatureInvalid { .. }));
    }

    #[test]
    fn key_signed_by_another_device_is_rejected() {
        let bob = device("@bob:localhost", "BOBDEV");
        let impostor = device("@bob:localhost", "BOBDEV");
        let result = validate_claims(
            &targets("@bob:localhost", "BOBDEV", SIGNED_CURVE25519),
            &known(&bob),
            signed_response(&impostor),
        );
        assert_eq!(result.rejected.len(), 1);
    }

    #[test]
    fn unsigned_key_is_accepted_unverified() {
        let bob = device("@bob:localhost", "BOBDEV");
        let snapshot = bob.pool.snapshot();
        let key = &snapshot[0];
        let result = validate_claims(
            &targets("@bob:localhost", "BOBDEV", CURVE25519),
            &QueryResult::default(),
            response(
                "@bob:localhost",
                "BOBDEV",
                key.algorithm_key_id(CURVE25519),
                OneTimeKeyValue::Unsigned(key.public_key.to_base64()),
            ),
        );
        let claimed = result.key("@bob:localhost", "BOBDEV").unwrap();
        assert!(!claimed.verified);
        assert_eq!(claimed.public_key, key.public_key);
    }

    #[test]
    fn unsigned_key_for_signed_request_is_rejected() {
        let bob = device("@bob:localhost", "BOBDEV");
        let snapshot = bob.pool.snapshot();
        let key = &snapshot[0];
        let result = validate_claims(
            &targets("@bob:localhost", "BOBDEV", SIGNED_CURVE25519),
            &known(&bob),
            response(
                "@bob:localhost",
                "BOBDEV",
                key.algorithm_key_id(SIGNED_CURVE25519),
                OneTimeKeyValue::Unsigned(key.public_key.to_base64()),
            ),
        );
        assert_eq!(result.rejected.len(), 1);
    }

    #[test]
    fn failures_pass_through() {
        let mut response = ClaimKeysResponse::default();
        response
            .failures
            .insert("@far:remote.example".into(), json!({"status": 503}));
        let result = validate_claims(&ClaimTargets::new(), &QueryResult::default(), response);
        assert!(result.failures.contains_key("@far:remote.example"));
        assert!(result.one_time_keys.is_empty());
    }
}
