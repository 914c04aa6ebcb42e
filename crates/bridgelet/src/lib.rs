//! bridgelet: process-per-call RPC bridge to external worker programs.
//!
//! Scripts invoke methods on modules; each module declares a worker command
//! in its manifest. Every call spawns a fresh worker process, exchanges one
//! newline-delimited JSON request/response pair over its standard streams,
//! and force-terminates the process on the way out.

pub mod bridge;
pub mod config;
pub mod error;
pub mod manifest;
pub mod sandbox;
pub mod service;
pub mod transport;
pub mod worker;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use manifest::{DEFAULT_TIMEOUT_MS, ManifestStore, MethodSpec, WorkerManifest};
pub use sandbox::{PathPolicy, ResolvedCommand};
pub use service::{BridgeCall, BridgeService, DEFAULT_MAX_CONCURRENT};
pub use worker::{ProcessSpawner, RpcSession, WorkerProcess, WorkerSpawner};
