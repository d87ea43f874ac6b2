//! Discovery of other devices' published keys.
//!
//! Every returned record is checked before it is surfaced: its embedded ids
//! must match the map keys it was filed under, and the device's signature
//! over its own key set must verify against the Ed25519 key in that same
//! record. A record failing either check is dropped and reported in
//! [`QueryResult::rejected`]; the rest of the response is unaffected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ember_crypto::signing::verify_json;
use ember_crypto::DeviceKeys;
use serde_json::Value;

use crate::error::KeysError;
use crate::ledger::RequestLedger;
use crate::session::SessionHandle;
use crate::transport::{Request, Transport};
use crate::wire::{QueryKeysRequest, QueryKeysResponse, KEYS_QUERY};

/// A device record that was returned but failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDevice {
    pub user_id: String,
    pub device_id: String,
    pub error: KeysError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Validated records, `user_id -> device_id -> record`.
    pub device_keys: BTreeMap<String, BTreeMap<String, DeviceKeys>>,
    /// Users the server could not answer for, with its opaque reason.
    pub failures: BTreeMap<String, Value>,
    /// Records dropped by validation.
    pub rejected: Vec<RejectedDevice>,
}

impl QueryResult {
    pub fn device(&self, user_id: &str, device_id: &str) -> Option<&DeviceKeys> {
        self.device_keys.get(user_id)?.get(device_id)
    }

    pub fn failed_users(&self) -> BTreeSet<&str> {
        self.failures.keys().map(String::as_str).collect()
    }
}

/// Fetches and validates other users' device keys.
#[derive(Clone)]
pub struct KeyQueryCoordinator {
    ledger: RequestLedger,
    transport: Arc<dyn Transport>,
    session: SessionHandle,
}

impl KeyQueryCoordinator {
    pub fn new(ledger: RequestLedger, transport: Arc<dyn Transport>, session: SessionHandle) -> Self {
        Self {
            ledger,
            transport,
            session,
        }
    }

    /// Query all devices of each user in `users`.
    pub async fn query<I, S>(&self, users: I) -> Result<QueryResult, KeysError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = users.into_iter().map(|u| (u.into(), Vec::new())).collect();
        self.query_devices(targets).await
    }

    /// Query specific devices; an empty device list means all of that user's devices.
    pub async fn query_devices(
        &self,
        targets: BTreeMap<String, Vec<String>>,
    ) -> Result<QueryResult, KeysError> {
        let session = self.session.current()?;
        let body = QueryKeysRequest {
            device_keys: targets,
            timeout: None,
        };
        let requested: BTreeSet<String> = body.device_keys.keys().cloned().collect();

        tracing::debug!(users = requested.len(), "querying device keys");
        let request = Request::post(KEYS_QUERY, serde_json::to_value(&body)?)
            .with_access_token(&session.access_token);
        let response = self.ledger.dispatch(self.transport.clone(), request).await?;
        let response: QueryKeysResponse = serde_json::from_value(response)
            .map_err(|e| KeysError::ParseError(format!("query response: {e}")))?;

        Ok(validate_response(&requested, response))
    }
}

/// Split a raw query response into validated records and rejections.
pub fn validate_response(requested: &BTreeSet<String>, response: QueryKeysResponse) -> QueryResult {
    let mut result = QueryResult {
        failures: response.failures,
        ..QueryResult::default()
    };

    for (user_id, devices) in response.device_keys {
        if !requested.contains(&user_id) {
            tracing::warn!(%user_id, "server returned keys for a user that was not queried");
            continue;
        }

        let mut accepted = BTreeMap::new();
        for (device_id, raw) in devices {
            match validate_device(&user_id, &device_id, &raw) {
                Ok(record) => {
                    accepted.insert(device_id, record);
                }
                Err(error) => {
                    tracing::warn!(%user_id, %device_id, %error, "rejecting device keys");
                    result.rejected.push(RejectedDevice {
                        user_id: user_id.clone(),
                        device_id,
                        error,
                    });
                }
            }
        }
        result.device_keys.insert(user_id, accepted);
    }

    result
}

/// Check one record against the ids it was filed under and its own signature.
pub fn validate_device(user_id: &str, device_id: &str, raw: &Value) -> Result<DeviceKeys, KeysError> {
    let record: DeviceKeys = serde_json::from_value(raw.clone())
        .map_err(|e| KeysError::ParseError(format!("device {user_id}/{device_id}: {e}")))?;

    if record.user_id != user_id || record.device_id != device_id {
        return Err(KeysError::IdentityMismatch {
            expected: format!("{user_id}/{device_id}"),
            actual: format!("{}/{}", record.user_id, record.device_id),
        });
    }

    let invalid = |reason: String| KeysError::SignatureInvalid {
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
        reason,
    };
    let signing_key = record.ed25519_key().map_err(|e| invalid(e.to_string()))?;
    // Verify the bytes as received; re-serialising the typed record would drop unknown fields.
    verify_json(&signing_key, user_id, device_id, raw).map_err(|e| invalid(e.to_string()))?;

    Ok(record)
}
