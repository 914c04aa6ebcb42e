use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use bridgelet::config::BridgeConfig;
use bridgelet::manifest::ManifestStore;
use bridgelet::sandbox::PathPolicy;
use bridgelet::service::BridgeService;
use bridgelet::transport::{AppState, ServerConfig, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings_path = std::env::var("BRIDGELET_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/settings.json"));

    let config = BridgeConfig::load(&settings_path)?;
    let secret = config.resolve_secret(&settings_path)?;

    let policy = PathPolicy::new(config.allowed_roots.clone());
    let manifests = ManifestStore::new()
        .with_default_timeout(Duration::from_millis(config.default_timeout_ms));
    let service = Arc::new(
        BridgeService::new(config.modules_dir.clone(), policy)
            .with_manifest_store(manifests)
            .with_max_concurrent(config.max_concurrent),
    );

    let state = AppState::new(service, secret);
    serve(
        ServerConfig {
            host: config.host.clone(),
            port: config.port,
        },
        state,
    )
    .await
}
