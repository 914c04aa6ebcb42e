//! Per-module worker manifests.
//!
//! Each module directory carries a `bridge.json` declaring the worker
//! command and the methods it serves. Manifests are immutable after load and
//! cached by modification time so repeated hot-path calls skip re-parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::BridgeError;

/// Manifest filename inside a module directory.
pub const MANIFEST_FILE: &str = "bridge.json";

/// Timeout applied when neither the method nor the worker declares one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Declarative worker description for one module.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerManifest {
    pub worker: WorkerSpec,
    #[serde(default)]
    pub methods: HashMap<String, MethodEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    /// Executable plus arguments, in order.
    pub command: Vec<String>,
    pub timeout_ms: Option<u64>,
    /// Extra environment for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory, relative to the module directory unless absolute.
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MethodEntry {
    pub timeout_ms: Option<u64>,
}

impl WorkerManifest {
    fn validate(&self) -> Result<(), String> {
        if self.worker.command.is_empty() {
            return Err("worker.command must not be empty".to_string());
        }
        if self.worker.timeout_ms == Some(0) {
            return Err("worker.timeout_ms must be a positive integer".to_string());
        }
        for (name, entry) in &self.methods {
            if entry.timeout_ms == Some(0) {
                return Err(format!("methods.{name}.timeout_ms must be a positive integer"));
            }
        }
        Ok(())
    }
}

/// Fully resolved spec for one call - computed fresh from the cached
/// manifest, never mutated in place.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout: Duration,
}

struct CacheEntry {
    modified: SystemTime,
    manifest: Arc<WorkerManifest>,
}

/// Loads, validates, and caches per-module manifests.
///
/// Cache entries are keyed by module path and invalidated when the backing
/// file's modification time changes.
pub struct ManifestStore {
    cache: DashMap<PathBuf, CacheEntry>,
    default_timeout: Duration,
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestStore {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Override the global default timeout (configuration-supplied).
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn load(&self, module_dir: &Path) -> Result<Arc<WorkerManifest>, BridgeError> {
        let manifest_path = module_dir.join(MANIFEST_FILE);
        let metadata = std::fs::metadata(&manifest_path)
            .map_err(|_| BridgeError::ManifestNotFound(module_dir.to_path_buf()))?;
        let modified = metadata
            .modified()
            .map_err(|e| BridgeError::ManifestInvalid(format!("cannot stat manifest: {e}")))?;

        if let Some(entry) = self.cache.get(module_dir) {
            if entry.modified == modified {
                return Ok(Arc::clone(&entry.manifest));
            }
        }

        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| BridgeError::ManifestInvalid(format!("cannot read manifest: {e}")))?;
        let manifest: WorkerManifest = serde_json::from_str(&content)
            .map_err(|e| BridgeError::ManifestInvalid(e.to_string()))?;
        manifest.validate().map_err(BridgeError::ManifestInvalid)?;

        let manifest = Arc::new(manifest);
        tracing::debug!(module_dir = %module_dir.display(), "Loaded manifest");
        self.cache.insert(
            module_dir.to_path_buf(),
            CacheEntry {
                modified,
                manifest: Arc::clone(&manifest),
            },
        );
        Ok(manifest)
    }

    /// Merge timeout precedence: method override, else worker default, else
    /// the global default. Unknown methods are rejected.
    pub fn resolve_method(
        &self,
        module: &str,
        manifest: &WorkerManifest,
        method: &str,
    ) -> Result<MethodSpec, BridgeError> {
        let entry = manifest
            .methods
            .get(method)
            .ok_or_else(|| BridgeError::MethodNotFound {
                module: module.to_string(),
                method: method.to_string(),
            })?;

        let timeout = entry
            .timeout_ms
            .or(manifest.worker.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        Ok(MethodSpec {
            command: manifest.worker.command.clone(),
            env: manifest.worker.env.clone(),
            cwd: manifest.worker.cwd.clone(),
            timeout,
        })
    }
}
