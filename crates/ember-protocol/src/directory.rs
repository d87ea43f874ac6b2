//! In-memory server side of the key endpoints.
//!
//! [`KeyDirectory`] holds accounts, sessions, uploaded device keys and
//! unclaimed one-time keys for a single server name. It backs the loopback
//! transport used in tests and the standalone `ember-server` binary.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ember_crypto::signing::verify_json;
use ember_crypto::{DeviceKeys, CURVE25519, SIGNED_CURVE25519};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};

use crate::transport::{Request, TransportFailure};
use crate::wire::{
    ClaimKeysRequest, ClaimKeysResponse, LoginRequest, LoginResponse, OneTimeKeyValue,
    QueryKeysRequest, QueryKeysResponse, UploadCounts, UploadKeysResponse, KEYS_CLAIM, KEYS_QUERY,
    KEYS_UPLOAD, LOGIN,
};

/// A domain error as the directory reports it to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryError {
    pub status: u16,
    pub errcode: &'static str,
    pub error: String,
}

impl DirectoryError {
    fn new(status: u16, errcode: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            errcode,
            error: error.into(),
        }
    }

    pub fn body(&self) -> Value {
        json!({"errcode": self.errcode, "error": self.error})
    }

    pub fn into_failure(self) -> TransportFailure {
        TransportFailure::Status {
            status: self.status,
            body: Some(self.body()),
        }
    }
}

#[derive(Default)]
struct DeviceState {
    /// Device keys exactly as uploaded, so queries return the same bytes.
    keys: Option<Value>,
    one_time_keys: BTreeMap<String, OneTimeKeyValue>,
}

struct UserAccount {
    password: String,
    devices: BTreeMap<String, DeviceState>,
}

#[derive(Default)]
struct State {
    accounts: BTreeMap<String, UserAccount>,
    tokens: HashMap<String, (String, String)>,
    unreachable: BTreeSet<String>,
}

/// Accounts and published keys for one server name.
pub struct KeyDirectory {
    server_name: String,
    state: Mutex<State>,
}

impl KeyDirectory {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Create an account and return its full user id. Re-registering replaces the password.
    pub fn register(&self, localpart: &str, password: &str) -> String {
        let user_id = format!("@{localpart}:{}", self.server_name);
        let mut state = self.state.lock();
        state
            .accounts
            .entry(user_id.clone())
            .and_modify(|account| password.clone_into(&mut account.password))
            .or_insert_with(|| UserAccount {
                password: password.to_owned(),
                devices: BTreeMap::new(),
            });
        tracing::info!(%user_id, "account registered");
        user_id
    }

    /// Treat users on `server_name` as unreachable: queries and claims for
    /// them land in `failures`.
    pub fn set_server_unreachable(&self, server_name: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(server_name.to_owned());
        } else {
            state.unreachable.remove(server_name);
        }
    }

    pub fn login(&self, request: &LoginRequest) -> Result<LoginResponse, DirectoryError> {
        if request.login_type != "m.login.password" {
            return Err(DirectoryError::new(
                400,
                "M_UNKNOWN",
                format!("unsupported login type {}", request.login_type),
            ));
        }
        let user_id = if request.user.starts_with('@') {
            request.user.clone()
        } else {
            format!("@{}:{}", request.user, self.server_name)
        };

        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&user_id)
            .filter(|account| account.password == request.password)
            .ok_or_else(|| DirectoryError::new(403, "M_FORBIDDEN", "invalid username or password"))?;

        let device_id = request.device_id.clone().unwrap_or_else(|| random_string(10).to_uppercase());
        account.devices.entry(device_id.clone()).or_default();

        let access_token = random_string(32);
        state
            .tokens
            .insert(access_token.clone(), (user_id.clone(), device_id.clone()));

        tracing::info!(%user_id, %device_id, "logged in");
        Ok(LoginResponse {
            user_id,
            access_token,
            device_id,
        })
    }

    /// Resolve an access token to `(user_id, device_id)`.
    pub fn authenticate(&self, access_token: Option<&str>) -> Result<(String, String), DirectoryError> {
        let token = access_token
            .ok_or_else(|| DirectoryError::new(401, "M_MISSING_TOKEN", "missing access token"))?;
        self.state
            .lock()
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| DirectoryError::new(401, "M_UNKNOWN_TOKEN", "unrecognised access token"))
    }

    /// Store identity and one-time keys for the authenticated device.
    ///
    /// The whole upload is validated before anything is stored; a rejected
    /// upload changes nothing.
    pub fn upload(
        &self,
        user_id: &str,
        device_id: &str,
        body: &Value,
    ) -> Result<UploadKeysResponse, DirectoryError> {
        let device_keys = match body.get("device_keys") {
            None | Some(Value::Null) => None,
            Some(raw) => {
                validate_device_keys(user_id, device_id, raw)?;
                Some(raw.clone())
            }
        };
        let one_time_keys: BTreeMap<String, OneTimeKeyValue> = match body.get("one_time_keys") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| DirectoryError::new(400, "M_BAD_JSON", format!("one_time_keys: {e}")))?,
        };

        let mut state = self.state.lock();
        let device = state
            .accounts
            .get_mut(user_id)
            .map(|account| account.devices.entry(device_id.to_owned()).or_default())
            .ok_or_else(|| DirectoryError::new(403, "M_FORBIDDEN", "unknown user"))?;

        for (key_id, value) in &one_time_keys {
            check_one_time_key(key_id, value)?;
            if let Some(existing) = device.one_time_keys.get(key_id) {
                if existing != value {
                    return Err(DirectoryError::new(
                        400,
                        "M_INVALID_PARAM",
                        format!("one-time key {key_id} already exists with a different value"),
                    ));
                }
            }
        }

        if let Some(raw) = device_keys {
            device.keys = Some(raw);
        }
        let added = one_time_keys.len();
        device.one_time_keys.extend(one_time_keys);

        let one_time_key_counts = count_by_algorithm(&device.one_time_keys);
        tracing::debug!(%user_id, %device_id, added, counts = ?one_time_key_counts, "keys stored");
        Ok(UploadKeysResponse { one_time_key_counts })
    }

    pub fn query(&self, request: &QueryKeysRequest) -> QueryKeysResponse {
        let state = self.state.lock();
        let mut response = QueryKeysResponse::default();

        for (user_id, wanted) in &request.device_keys {
            if is_unreachable(&state, user_id) {
                response.failures.insert(user_id.clone(), unreachable_reason());
                continue;
            }
            let Some(account) = state.accounts.get(user_id) else {
                continue;
            };
            let devices = account
                .devices
                .iter()
                .filter(|(device_id, _)| wanted.is_empty() || wanted.contains(*device_id))
                .filter_map(|(device_id, device)| Some((device_id.clone(), device.keys.clone()?)))
                .collect();
            response.device_keys.insert(user_id.clone(), devices);
        }
        response
    }

    /// Hand out and remove one key per requested device. Each key is claimable once.
    pub fn claim(&self, request: &ClaimKeysRequest) -> ClaimKeysResponse {
        let mut state = self.state.lock();
        let mut response = ClaimKeysResponse::default();

        for (user_id, devices) in &request.one_time_keys {
            if is_unreachable(&state, user_id) {
                response.failures.insert(user_id.clone(), unreachable_reason());
                continue;
            }
            let Some(account) = state.accounts.get_mut(user_id) else {
                continue;
            };
            for (device_id, algorithm) in devices {
                let Some(device) = account.devices.get_mut(device_id) else {
                    continue;
                };
                let prefix = format!("{algorithm}:");
                let Some(key_id) = device
                    .one_time_keys
                    .keys()
                    .find(|id| id.starts_with(&prefix))
                    .cloned()
                else {
                    continue;
                };
                if let Some(value) = device.one_time_keys.remove(&key_id) {
                    tracing::debug!(%user_id, %device_id, %key_id, "one-time key claimed");
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id.clone(), BTreeMap::from([(key_id, value)]));
                }
            }
        }
        response
    }

    /// Unclaimed one-time keys per algorithm for one device.
    pub fn one_time_key_counts(&self, user_id: &str, device_id: &str) -> UploadCounts {
        self.state
            .lock()
            .accounts
            .get(user_id)
            .and_then(|account| account.devices.get(device_id))
            .map(|device| count_by_algorithm(&device.one_time_keys))
            .unwrap_or_default()
    }

    /// Route a client request to the matching endpoint.
    pub fn handle(&self, request: &Request) -> Result<Value, DirectoryError> {
        let response = match request.endpoint.as_str() {
            LOGIN => serde_json::to_value(self.login(&parse(&request.body)?)?),
            KEYS_UPLOAD => {
                let (user_id, device_id) = self.authenticate(request.access_token.as_deref())?;
                serde_json::to_value(self.upload(&user_id, &device_id, &request.body)?)
            }
            KEYS_QUERY => {
                self.authenticate(request.access_token.as_deref())?;
                serde_json::to_value(self.query(&parse(&request.body)?))
            }
            KEYS_CLAIM => {
                self.authenticate(request.access_token.as_deref())?;
                serde_json::to_value(self.claim(&parse(&request.body)?))
            }
            other => {
                return Err(DirectoryError::new(
                    404,
                    "M_UNRECOGNIZED",
                    format!("unrecognised endpoint {other}"),
                ))
            }
        };
        response.map_err(|e| DirectoryError::new(500, "M_UNKNOWN", e.to_string()))
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, DirectoryError> {
    serde_json::from_value(body.clone()).map_err(|e| DirectoryError::new(400, "M_BAD_JSON", e.to_string()))
}

fn validate_device_keys(user_id: &str, device_id: &str, raw: &Value) -> Result<(), DirectoryError> {
    let keys: DeviceKeys = parse(raw)?;
    if keys.user_id != user_id || keys.device_id != device_id {
        return Err(DirectoryError::new(
            400,
            "M_INVALID_PARAM",
            format!(
                "device keys for {}/{} uploaded by {user_id}/{device_id}",
                keys.user_id, keys.device_id
            ),
        ));
    }
    let signing_key = keys
        .ed25519_key()
        .map_err(|e| DirectoryError::new(400, "M_INVALID_PARAM", e.to_string()))?;
    verify_json(&signing_key, user_id, device_id, raw)
        .map_err(|e| DirectoryError::new(400, "M_INVALID_SIGNATURE", e.to_string()))
}

fn check_one_time_key(key_id: &str, value: &OneTimeKeyValue) -> Result<(), DirectoryError> {
    let algorithm = key_id.split_once(':').map_or(key_id, |(alg, _)| alg);
    match (algorithm, value) {
        (CURVE25519, OneTimeKeyValue::Unsigned(_)) | (SIGNED_CURVE25519, OneTimeKeyValue::Signed(_)) => Ok(()),
        (CURVE25519 | SIGNED_CURVE25519, _) => Err(DirectoryError::new(
            400,
            "M_BAD_JSON",
            format!("wrong key format for {key_id}"),
        )),
        _ => Err(DirectoryError::new(
            400,
            "M_UNKNOWN",
            format!("unknown one-time key algorithm {algorithm}"),
        )),
    }
}

fn count_by_algorithm(keys: &BTreeMap<String, OneTimeKeyValue>) -> UploadCounts {
    let mut counts = UploadCounts::new();
    for key_id in keys.keys() {
        let algorithm = key_id.split_once(':').map_or(key_id.as_str(), |(alg, _)| alg);
        *counts.entry(algorithm.to_owned()).or_default() += 1;
    }
    counts
}

fn is_unreachable(state: &State, user_id: &str) -> bool {
    user_id
        .split_once(':')
        .is_some_and(|(_, server)| state.unreachable.contains(server))
}

fn unreachable_reason() -> Value {
    json!({"status": 503, "message": "Not ready for retry"})
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
