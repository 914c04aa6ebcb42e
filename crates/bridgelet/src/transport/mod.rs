//! Transport layer for bridgelet.
//!
//! Currently provides the HTTP dev server via axum.

pub mod http;

pub use http::{AppState, ServerConfig, serve};
