//! Request and response bodies of the key endpoints.
//!
//! Field names and nesting match the client-server key API exactly; any
//! compliant server accepts these bodies unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use ember_crypto::{DeviceKeys, SignedKey, Signatures};

/// Path prefix every endpoint below is mounted under.
pub const CLIENT_API_PREFIX: &str = "/_matrix/client/r0";

pub const LOGIN: &str = "/login";
pub const KEYS_UPLOAD: &str = "/keys/upload";
pub const KEYS_QUERY: &str = "/keys/query";
pub const KEYS_CLAIM: &str = "/keys/claim";

/// A one-time key entry: a bare base64 key (`curve25519`) or a signed object (`signed_curve25519`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneTimeKeyValue {
    Unsigned(String),
    Signed(SignedKey),
}

impl OneTimeKeyValue {
    /// The base64 public key regardless of representation.
    pub fn key(&self) -> &str {
        match self {
            Self::Unsigned(key) => key,
            Self::Signed(signed) => &signed.key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// `"<algorithm>:<key_id>" -> key`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, OneTimeKeyValue>,
}

/// Server-reported count of published, unclaimed one-time keys per algorithm.
pub type UploadCounts = BTreeMap<String, u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysResponse {
    #[serde(default)]
    pub one_time_key_counts: UploadCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKeysRequest {
    /// `user_id -> device ids`; an empty list asks for all of the user's devices.
    pub device_keys: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Query response as received, before any per-device validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKeysResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimKeysRequest {
    /// `user_id -> device_id -> algorithm`.
    pub one_time_keys: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimKeysResponse {
    /// `user_id -> device_id -> "<algorithm>:<key_id>" -> key`.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, BTreeMap<String, BTreeMap<String, OneTimeKeyValue>>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub login_type: String,
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl LoginRequest {
    pub fn password(user: &str, password: &str) -> Self {
        Self {
            login_type: "m.login.password".into(),
            user: user.to_owned(),
            password: password.to_owned(),
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    pub device_id: String,
}

/// Body of a domain error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}
