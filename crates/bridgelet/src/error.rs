//! Error taxonomy for bridge calls.
//!
//! Every variant is local to a single call - a failed call never corrupts
//! service state. Nothing here is retried; retry policy belongs to callers.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("module manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("method not found: {module}.{method}")]
    MethodNotFound { module: String, method: String },

    #[error("path escapes allowed roots: {0}")]
    SandboxViolation(PathBuf),

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("worker timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker exited before responding (exit code {})", display_exit_code(.exit_code))]
    WorkerCrashed { exit_code: Option<i32> },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("too many in-flight calls")]
    Backpressure,

    /// Application-level error reported by the worker itself.
    #[error("worker error [{code}]: {message}")]
    Worker { code: String, message: String },
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "unknown".to_string(),
    }
}

impl BridgeError {
    /// Stable kind string, used as the per-call event outcome and as the
    /// error code on the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ManifestNotFound(_) => "manifest_not_found",
            Self::ManifestInvalid(_) => "manifest_invalid",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::SandboxViolation(_) => "sandbox_violation",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::Timeout { .. } => "timeout",
            Self::WorkerCrashed { .. } => "worker_crashed",
            Self::Protocol(_) => "protocol_error",
            Self::Backpressure => "backpressure",
            Self::Worker { .. } => "worker_error",
        }
    }
}
