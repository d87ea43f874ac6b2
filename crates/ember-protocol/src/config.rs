use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client settings for talking to a key server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the homeserver, without the client API prefix.
    pub homeserver: String,
    /// Upper bound on a single request's time in flight. `0` disables the bound.
    pub request_timeout_secs: u64,
    /// Number of one-time keys the client tries to keep published.
    pub one_time_key_batch: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            homeserver: "http://localhost:8008".into(),
            request_timeout_secs: 30,
            one_time_key_batch: 50,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `EMBER_HOMESERVER`, `EMBER_REQUEST_TIMEOUT_SECS`
    /// and `EMBER_OTK_BATCH`. Unparseable numbers are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(homeserver) = lookup("EMBER_HOMESERVER") {
            config.homeserver = homeserver;
        }
        if let Some(secs) = parse_var(&lookup, "EMBER_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = secs;
        }
        if let Some(batch) = parse_var(&lookup, "EMBER_OTK_BATCH") {
            config.one_time_key_batch = batch;
        }
        config
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(%name, %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}
