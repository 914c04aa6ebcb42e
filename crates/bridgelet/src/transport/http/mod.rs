//! HTTP debug front end over BridgeService.

mod routes;
mod server;

pub use routes::{AppState, routes};
pub use server::{ServerConfig, serve};
