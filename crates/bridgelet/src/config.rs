//! Startup configuration.
//!
//! One immutable value, constructed once and passed explicitly to every
//! component that needs it. Loaded from a JSON settings file; every field
//! has a default so a missing file means a usable local setup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::manifest::DEFAULT_TIMEOUT_MS;
use crate::service::DEFAULT_MAX_CONCURRENT;

/// Filename of the generated shared-secret file, beside the settings file.
const SECRET_FILE: &str = ".secret";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one subdirectory per module.
    pub modules_dir: PathBuf,
    /// Extra roots worker commands may live under, besides each module's
    /// own directory.
    pub allowed_roots: Vec<PathBuf>,
    /// Global default call timeout when neither method nor worker sets one.
    pub default_timeout_ms: u64,
    /// Cap on concurrently spawned worker processes.
    pub max_concurrent: usize,
    /// Pre-shared key for the HTTP surface; generated and persisted on
    /// first run when absent.
    pub secret: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8970,
            modules_dir: PathBuf::from("modules"),
            allowed_roots: Vec::new(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            secret: None,
        }
    }
}

impl BridgeConfig {
    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings at {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings at {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the shared secret: the configured value, else one loaded
    /// from (or generated into) a secret file beside the settings file.
    pub fn resolve_secret(&self, settings_path: &Path) -> Result<String> {
        if let Some(secret) = &self.secret {
            return Ok(secret.clone());
        }

        let secret_path = settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SECRET_FILE);

        if secret_path.exists() {
            let secret = std::fs::read_to_string(&secret_path)
                .with_context(|| format!("failed to read secret at {}", secret_path.display()))?;
            return Ok(secret.trim().to_string());
        }

        let secret = uuid::Uuid::new_v4().simple().to_string();
        std::fs::write(&secret_path, &secret)
            .with_context(|| format!("failed to write secret to {}", secret_path.display()))?;
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = BridgeConfig::load(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert!(config.secret.is_none());
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"port": 9000, "modules_dir": "/srv/modules"}"#).unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.modules_dir, PathBuf::from("/srv/modules"));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{broken").unwrap();

        assert!(BridgeConfig::load(&path).is_err());
    }

    #[test]
    fn secret_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        let config = BridgeConfig::default();

        let first = config.resolve_secret(&settings).unwrap();
        assert!(!first.is_empty());

        let second = config.resolve_secret(&settings).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn configured_secret_wins() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        let config = BridgeConfig {
            secret: Some("hunter2".to_string()),
            ..Default::default()
        };

        assert_eq!(config.resolve_secret(&settings).unwrap(), "hunter2");
        assert!(!dir.path().join(SECRET_FILE).exists());
    }
}
