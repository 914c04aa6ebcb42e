//! BridgeService - the single orchestration entry point.
//!
//! Resolves manifest and method spec, applies the sandbox, drives one
//! worker process through one request/response exchange, and emits a
//! structured event per call. Shared state is the manifest cache and the
//! immutable path policy only; everything else is call-local.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::bridge::protocol::{CallId, WireRequest};
use crate::error::BridgeError;
use crate::manifest::ManifestStore;
use crate::sandbox::PathPolicy;
use crate::worker::{ProcessSpawner, RpcSession, WorkerSpawner};

/// Default cap on concurrently spawned worker processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 32;

/// One invocation: module, method, ordered params, correlation id.
///
/// Created per call, immutable, discarded when the call completes.
#[derive(Debug, Clone)]
pub struct BridgeCall {
    pub module: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
    pub id: CallId,
}

impl BridgeCall {
    pub fn new(module: &str, method: &str, params: Vec<serde_json::Value>) -> Self {
        Self::with_id(CallId::new(), module, method, params)
    }

    pub fn with_id(
        id: CallId,
        module: &str,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            module: module.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    fn to_wire_request(&self) -> WireRequest {
        WireRequest {
            id: self.id,
            method: self.method.clone(),
            params: self.params.clone(),
        }
    }
}

/// Routes calls from the script binding and the dev server to worker
/// processes, one fresh process per call.
pub struct BridgeService {
    modules_dir: PathBuf,
    manifests: ManifestStore,
    policy: PathPolicy,
    spawner: Arc<dyn WorkerSpawner>,
    permits: Arc<Semaphore>,
}

impl BridgeService {
    pub fn new(modules_dir: PathBuf, policy: PathPolicy) -> Self {
        Self {
            modules_dir,
            manifests: ManifestStore::new(),
            policy,
            spawner: Arc::new(ProcessSpawner),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    pub fn with_manifest_store(mut self, manifests: ManifestStore) -> Self {
        self.manifests = manifests;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max));
        self
    }

    /// The script-facing call surface: generates a fresh correlation id.
    pub async fn call(
        &self,
        module: &str,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        self.dispatch(BridgeCall::new(module, method, params)).await
    }

    /// Same pipeline with a caller-chosen correlation id (used by the dev
    /// server so the HTTP response can echo the id).
    pub async fn call_with_id(
        &self,
        id: CallId,
        module: &str,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        self.dispatch(BridgeCall::with_id(id, module, method, params))
            .await
    }

    async fn dispatch(&self, call: BridgeCall) -> Result<serde_json::Value, BridgeError> {
        let started = Instant::now();
        let result = self.run(&call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(
                target: "bridgelet::call",
                module = %call.module,
                method = %call.method,
                call_id = %call.id,
                duration_ms,
                outcome = "ok",
                "Call completed"
            ),
            Err(e) => tracing::warn!(
                target: "bridgelet::call",
                module = %call.module,
                method = %call.method,
                call_id = %call.id,
                duration_ms,
                outcome = e.kind(),
                "Call failed: {e}"
            ),
        }

        result
    }

    async fn run(&self, call: &BridgeCall) -> Result<serde_json::Value, BridgeError> {
        // Fail fast at the cap rather than spawn unboundedly.
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| BridgeError::Backpressure)?;

        let module_dir = self.module_dir(&call.module)?;
        let manifest = self.manifests.load(&module_dir)?;
        let spec = self
            .manifests
            .resolve_method(&call.module, &manifest, &call.method)?;
        let resolved = self.policy.validate(&module_dir, &spec)?;

        let child = self
            .spawner
            .spawn(&resolved, &spec.env)
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        let session = RpcSession::new(child, &call.module)?;

        session.call(call.to_wire_request(), spec.timeout).await
    }

    /// Module names are single path components; anything path-shaped would
    /// walk out of the modules directory before the sandbox ever saw it.
    fn module_dir(&self, module: &str) -> Result<PathBuf, BridgeError> {
        if module.is_empty()
            || module == "."
            || module == ".."
            || module.contains('/')
            || module.contains('\\')
        {
            return Err(BridgeError::SandboxViolation(PathBuf::from(module)));
        }
        Ok(self.modules_dir.join(module))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sandbox::ResolvedCommand;
    use crate::worker::SpawnError;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::process::Child;

    /// Wraps the real spawner to count spawns and record pids.
    struct CountingSpawner {
        inner: ProcessSpawner,
        spawned: AtomicUsize,
        pids: Mutex<Vec<u32>>,
    }

    impl CountingSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: ProcessSpawner,
                spawned: AtomicUsize::new(0),
                pids: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }

        fn pids(&self) -> Vec<u32> {
            self.pids.lock().unwrap().clone()
        }
    }

    impl WorkerSpawner for CountingSpawner {
        fn spawn(
            &self,
            command: &ResolvedCommand,
            env: &HashMap<String, String>,
        ) -> Result<Child, SpawnError> {
            let child = self.inner.spawn(command, env)?;
            self.spawned.fetch_add(1, Ordering::SeqCst);
            if let Some(pid) = child.id() {
                self.pids.lock().unwrap().push(pid);
            }
            Ok(child)
        }
    }

    const GREET_WORKER: &str = r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"id":"%s","result":"Hello, User!"}\n' "$id"
"#;

    const ECHO_WORKER: &str = r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
params=$(printf '%s' "$line" | sed -n 's/.*"params"://p')
params=${params%\}}
printf '{"id":"%s","result":%s}\n' "$id" "$params"
"#;

    const SLEEPY_WORKER: &str = "read line\nsleep 30\n";

    fn write_module(modules_dir: &Path, name: &str, script: &str, manifest: &str) {
        let dir = modules_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("worker.sh"), script).unwrap();
        fs::write(dir.join("bridge.json"), manifest).unwrap();
    }

    fn sh_manifest(extra_methods: &str) -> String {
        format!(
            r#"{{"worker": {{"command": ["sh", "worker.sh"]}}, "methods": {{{extra_methods}}}}}"#
        )
    }

    fn service(modules_dir: &Path, spawner: Arc<CountingSpawner>) -> BridgeService {
        BridgeService::new(modules_dir.to_path_buf(), PathPolicy::default())
            .with_spawner(spawner)
    }

    fn process_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn greet_end_to_end() {
        let modules = tempfile::tempdir().unwrap();
        write_module(
            modules.path(),
            "mod",
            GREET_WORKER,
            &sh_manifest(r#""greet": {"timeout_ms": 1000}"#),
        );
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let started = Instant::now();
        let result = svc.call("mod", "greet", vec![json!("User")]).await.unwrap();
        assert_eq!(result, json!("Hello, User!"));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(spawner.count(), 1);
    }

    #[tokio::test]
    async fn missing_module_spawns_nothing() {
        let modules = tempfile::tempdir().unwrap();
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("missing-module", "x", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::ManifestNotFound(_)));
        assert_eq!(spawner.count(), 0);
    }

    #[tokio::test]
    async fn unknown_method_spawns_nothing() {
        let modules = tempfile::tempdir().unwrap();
        write_module(modules.path(), "mod", GREET_WORKER, &sh_manifest(r#""greet": {}"#));
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("mod", "nope", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotFound { .. }));
        assert_eq!(spawner.count(), 0);
    }

    #[tokio::test]
    async fn sandbox_violation_spawns_nothing() {
        let modules = tempfile::tempdir().unwrap();
        write_module(
            modules.path(),
            "mod",
            GREET_WORKER,
            r#"{"worker": {"command": ["/usr/bin/env", "true"]}, "methods": {"m": {}}}"#,
        );
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("mod", "m", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::SandboxViolation(_)));
        assert_eq!(spawner.count(), 0);
    }

    #[tokio::test]
    async fn path_shaped_module_name_is_rejected() {
        let modules = tempfile::tempdir().unwrap();
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("../escape", "m", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::SandboxViolation(_)));
        assert_eq!(spawner.count(), 0);
    }

    #[tokio::test]
    async fn timeout_leaves_no_process_behind() {
        let modules = tempfile::tempdir().unwrap();
        write_module(
            modules.path(),
            "mod",
            SLEEPY_WORKER,
            &sh_manifest(r#""slow": {"timeout_ms": 500}"#),
        );
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("mod", "slow", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 500 }));

        let pids = spawner.pids();
        assert_eq!(pids.len(), 1);
        for _ in 0..100 {
            if !process_alive(pids[0]) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker process survived its deadline");
    }

    #[tokio::test]
    async fn concurrent_calls_are_independent() {
        let modules = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_module(
                modules.path(),
                &format!("mod{i}"),
                ECHO_WORKER,
                &sh_manifest(r#""echo": {"timeout_ms": 5000}"#),
            );
        }
        let spawner = CountingSpawner::new();
        let svc = Arc::new(service(modules.path(), Arc::clone(&spawner)));

        let mut handles = Vec::new();
        for i in 0..4 {
            let svc = Arc::clone(&svc);
            handles.push(tokio::spawn(async move {
                let module = format!("mod{i}");
                svc.call(&module, "echo", vec![json!(i)]).await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, json!([i]));
        }
        assert_eq!(spawner.count(), 4);
    }

    #[tokio::test]
    async fn calls_beyond_the_cap_fail_fast() {
        let modules = tempfile::tempdir().unwrap();
        write_module(
            modules.path(),
            "mod",
            SLEEPY_WORKER,
            &sh_manifest(r#""slow": {"timeout_ms": 2000}"#),
        );
        let spawner = CountingSpawner::new();
        let svc = Arc::new(
            service(modules.path(), Arc::clone(&spawner)).with_max_concurrent(1),
        );

        let background = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.call("mod", "slow", vec![]).await })
        };

        // Let the first call take the only permit.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = svc.call("mod", "slow", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Backpressure));
        assert_eq!(spawner.count(), 1);

        let first = background.await.unwrap();
        assert!(matches!(first, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn worker_error_reaches_the_caller() {
        let modules = tempfile::tempdir().unwrap();
        write_module(
            modules.path(),
            "mod",
            r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"id":"%s","error":{"code":"no_such_thing","message":"nope"}}\n' "$id"
"#,
            &sh_manifest(r#""m": {}"#),
        );
        let spawner = CountingSpawner::new();
        let svc = service(modules.path(), Arc::clone(&spawner));

        let err = svc.call("mod", "m", vec![]).await.unwrap_err();
        match err {
            BridgeError::Worker { code, message } => {
                assert_eq!(code, "no_such_thing");
                assert_eq!(message, "nope");
            }
            other => panic!("expected Worker, got {other:?}"),
        }
    }
}
