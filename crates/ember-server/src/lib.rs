//! HTTP front end for [`KeyDirectory`].
//!
//! Every route takes a JSON body and answers with JSON. Domain failures are
//! returned as `{"errcode", "error"}` with the directory's status code.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ember_protocol::wire::{CLIENT_API_PREFIX, KEYS_CLAIM, KEYS_QUERY, KEYS_UPLOAD, LOGIN};
use ember_protocol::{KeyDirectory, Request};

type SharedDirectory = Arc<KeyDirectory>;

pub fn router(directory: SharedDirectory) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(&format!("{CLIENT_API_PREFIX}{LOGIN}"), post(login))
        .route(&format!("{CLIENT_API_PREFIX}{KEYS_UPLOAD}"), post(keys_upload))
        .route(&format!("{CLIENT_API_PREFIX}{KEYS_QUERY}"), post(keys_query))
        .route(&format!("{CLIENT_API_PREFIX}{KEYS_CLAIM}"), post(keys_claim))
        .route("/health", axum::routing::get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(directory)
}

/// Serve `directory` on `listener` until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    directory: SharedDirectory,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, server_name = %directory.server_name(), "key server listening");
    }
    axum::serve(listener, router(directory))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn login(State(directory): State<SharedDirectory>, headers: HeaderMap, body: Bytes) -> Response {
    respond(&directory, LOGIN, &headers, &body)
}

async fn keys_upload(State(directory): State<SharedDirectory>, headers: HeaderMap, body: Bytes) -> Response {
    respond(&directory, KEYS_UPLOAD, &headers, &body)
}

async fn keys_query(State(directory): State<SharedDirectory>, headers: HeaderMap, body: Bytes) -> Response {
    respond(&directory, KEYS_QUERY, &headers, &body)
}

async fn keys_claim(State(directory): State<SharedDirectory>, headers: HeaderMap, body: Bytes) -> Response {
    respond(&directory, KEYS_CLAIM, &headers, &body)
}

fn respond(directory: &KeyDirectory, endpoint: &str, headers: &HeaderMap, body: &[u8]) -> Response {
    let body: Value = match serde_json::from_slice(body) {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"errcode": "M_NOT_JSON", "error": e.to_string()})),
            )
                .into_response()
        }
    };

    let mut request = Request::post(endpoint, body);
    request.access_token = bearer_token(headers).map(str::to_owned);

    match directory.handle(&request) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            tracing::debug!(%endpoint, status = e.status, errcode = e.errcode, "request refused");
            let status = StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(e.body())).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
