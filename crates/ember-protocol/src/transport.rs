//! The single channel through which key operations reach the network.
//!
//! Retry and backoff belong to the [`Transport`] implementation; everything
//! above it sees one outcome per submitted [`Request`].

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::KeysError;
use crate::wire::ErrorBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        })
    }
}

/// One outbound API call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the client API prefix, e.g. `/keys/upload`.
    pub endpoint: String,
    pub body: Value,
    pub access_token: Option<String>,
}

impl Request {
    pub fn post(endpoint: &str, body: Value) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.to_owned(),
            body,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_owned());
        self
    }
}

/// Failure as observed by the transport, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFailure {
    /// The server answered with a non-success status.
    Status { status: u16, body: Option<Value> },
    /// No response was received.
    Network(String),
    /// The server reported success but the body was not JSON.
    Malformed(String),
}

impl TransportFailure {
    /// Map onto the key error taxonomy: a status with a domain error body is a
    /// protocol error, an undecodable success body is a parse error, anything
    /// else is a transport error.
    pub fn classify(self) -> KeysError {
        match self {
            Self::Status { status, body } => {
                match body.and_then(|b| serde_json::from_value::<ErrorBody>(b).ok()) {
                    Some(ErrorBody { errcode, error }) => KeysError::ProtocolError {
                        status,
                        errcode,
                        error,
                    },
                    None => KeysError::TransportError {
                        status,
                        message: format!("HTTP {status}"),
                    },
                }
            }
            Self::Network(message) => KeysError::TransportError { status: 0, message },
            Self::Malformed(message) => KeysError::ParseError(message),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request` and return the decoded JSON response body.
    async fn submit(&self, request: Request) -> Result<Value, TransportFailure>;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{Method, Request, Transport, TransportFailure};
    use crate::wire::CLIENT_API_PREFIX;

    /// [`Transport`] over HTTPS using `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpTransport {
        /// `homeserver` is the server's base URL, e.g. `https://example.org`.
        pub fn new(homeserver: &str, timeout: Duration) -> Result<Self, TransportFailure> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportFailure::Network(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                base_url: format!("{}{CLIENT_API_PREFIX}", homeserver.trim_end_matches('/')),
            })
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn submit(&self, request: Request) -> Result<Value, TransportFailure> {
            let url = format!("{}{}", self.base_url, request.endpoint);
            let mut builder = match request.method {
                Method::Get => self.client.get(&url),
                Method::Post => self.client.post(&url).json(&request.body),
                Method::Put => self.client.put(&url).json(&request.body),
            };
            if let Some(token) = &request.access_token {
                builder = builder.bearer_auth(token);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| TransportFailure::Network(e.to_string()))?;
            let status = response.status();

            if status.is_success() {
                response.json::<Value>().await.map_err(|e| {
                    tracing::debug!(%url, error = %e, "undecodable response body");
                    TransportFailure::Malformed(format!("response body from {}: {e}", request.endpoint))
                })
            } else {
                tracing::debug!(%url, status = status.as_u16(), "request failed");
                Err(TransportFailure::Status {
                    status: status.as_u16(),
                    body: response.json().await.ok(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_with_errcode_is_protocol_error() {
        let failure = TransportFailure::Status {
            status: 400,
            body: Some(json!({"errcode": "M_UNKNOWN", "error": "unknown algorithm"})),
        };
        assert_eq!(
            failure.classify(),
            KeysError::ProtocolError {
                status: 400,
                errcode: "M_UNKNOWN".into(),
                error: "unknown algorithm".into(),
            }
        );
    }

    #[test]
    fn status_without_errcode_is_transport_error() {
        let failure = TransportFailure::Status {
            status: 502,
            body: Some(json!("bad gateway")),
        };
        assert!(matches!(
            failure.classify(),
            KeysError::TransportError { status: 502, .. }
        ));
    }

    #[test]
    fn malformed_success_body_is_parse_error() {
        let failure = TransportFailure::Malformed("expected value at line 1 column 1".into());
        assert_eq!(
            failure.classify(),
            KeysError::ParseError("expected value at line 1 column 1".into())
        );
    }

    #[test]
    fn network_failure_has_status_zero() {
        let failure = TransportFailure::Network("connection refused".into());
        assert_eq!(
            failure.classify(),
            KeysError::TransportError {
                status: 0,
                message: "connection refused".into(),
            }
        );
    }
}
