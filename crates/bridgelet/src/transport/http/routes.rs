//! HTTP route handlers.
//!
//! One bridge call per request. The response body mirrors the wire protocol
//! shape (`{id, result}` / `{id, error}`) with an HTTP status derived from
//! the call outcome.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::bridge::protocol::CallId;
use crate::error::BridgeError;
use crate::service::BridgeService;

/// Header carrying the pre-shared key.
pub const SECRET_HEADER: &str = "x-bridge-key";

/// Shared state behind the HTTP surface.
pub struct AppState {
    service: Arc<BridgeService>,
    secret: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(service: Arc<BridgeService>, secret: impl Into<String>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            service,
            secret: secret.into(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Resolves once `/shutdown` has been hit.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

#[derive(Debug, Deserialize)]
struct CallRequest {
    module: String,
    method: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    params: Vec<Value>,
}

/// Accept a JSON array; tolerate `null` and `{}` as "no params", which
/// lenient clients send.
fn deserialize_params<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        _ => Err(serde::de::Error::custom("params must be an array")),
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/call", post(call))
        .route("/shutdown", post(shutdown))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via /shutdown");
    let _ = state.shutdown_tx.send(true);
    Json(json!({ "result": "shutting down" }))
}

async fn call(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CallRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                None,
                "bad_request",
                &rejection.body_text(),
            );
        }
    };

    let id = CallId::new();
    match state
        .service
        .call_with_id(id, &request.module, &request.method, request.params)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(json!({ "id": id, "result": result }))).into_response(),
        Err(err) => {
            let (status, code, message) = error_payload(&err);
            error_response(status, Some(id), &code, &message)
        }
    }
}

fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::ManifestNotFound(_) | BridgeError::MethodNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        BridgeError::SandboxViolation(_) => StatusCode::FORBIDDEN,
        BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::WorkerCrashed { .. }
        | BridgeError::SpawnFailed(_)
        | BridgeError::ManifestInvalid(_)
        | BridgeError::Protocol(_) => StatusCode::BAD_GATEWAY,
        BridgeError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Worker { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Worker-reported errors keep their own code/message; bridge errors use
/// the stable kind string.
fn error_payload(err: &BridgeError) -> (StatusCode, String, String) {
    match err {
        BridgeError::Worker { code, message } => {
            (status_for(err), code.clone(), message.clone())
        }
        other => (status_for(other), other.kind().to_string(), other.to_string()),
    }
}

fn error_response(status: StatusCode, id: Option<CallId>, code: &str, message: &str) -> Response {
    let mut body = json!({ "error": { "code": code, "message": message } });
    if let Some(id) = id {
        body["id"] = json!(id);
    }
    (status, Json(body)).into_response()
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let key = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if key != state.secret {
        return error_response(
            StatusCode::UNAUTHORIZED,
            None,
            "unauthorized",
            "missing or invalid bridge key",
        );
    }

    next.run(request).await
}
