//! Worker process lifecycle and the single-call RPC session.
//!
//! One call owns one process: spawn, write one request line, read one
//! response line (or hit the deadline), then terminate and reap. Workers are
//! arbitrary untrusted programs, so cancellation is always forced
//! termination - on unix the whole process group is killed so grandchildren
//! are reaped too.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{CallId, WireError, WireRequest, WireResponse};
use crate::error::BridgeError;
use crate::sandbox::ResolvedCommand;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Extension point for spawn strategies.
///
/// The default spawner runs real processes; tests wrap it to count spawns
/// and record pids.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        command: &ResolvedCommand,
        env: &HashMap<String, String>,
    ) -> Result<Child, SpawnError>;
}

/// Spawner backed by the OS process primitive.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        command: &ResolvedCommand,
        env: &HashMap<String, String>,
    ) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.workdir)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop: the session kills explicitly on every exit path, but
            // a dropped session must never leak a process.
            .kill_on_drop(true);

        // Own process group, so the deadline kill reaps grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd.spawn()?)
    }
}

/// Inner read outcomes, resolved into `BridgeError` once the child is reaped.
enum ReadFailure {
    Crashed,
    Protocol(String),
    Worker(WireError),
}

/// One spawned child, owned exclusively by the session driving one call.
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
}

impl WorkerProcess {
    fn from_child(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Force-terminate the worker and reap it, returning its exit code.
    ///
    /// Safe to call when the child has already exited; the kill becomes a
    /// no-op and `wait` collects the real status.
    async fn terminate(&mut self) -> Option<i32> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = self.child.start_kill();

        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reap worker");
                None
            }
        }
    }
}

/// One worker process driving exactly one request/response exchange.
///
/// Terminal paths (response, timeout, crash, protocol error) all terminate
/// and reap the child before returning.
pub struct RpcSession {
    process: WorkerProcess,
    writer: FramedWrite<ChildStdin, JsonLineCodec<WireRequest>>,
    reader: FramedRead<ChildStdout, JsonLineCodec<WireResponse>>,
}

impl RpcSession {
    /// Take ownership of a freshly spawned child's pipes. Stderr is
    /// forwarded line-by-line to the logging sink, kept out of the protocol
    /// channel.
    pub fn new(mut child: Child, module: &str) -> Result<Self, BridgeError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("stderr not captured".to_string()))?;

        let module = module.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::warn!(target: "bridgelet::worker", %module, "{}", line);
                }
            }
        });

        Ok(Self {
            process: WorkerProcess::from_child(child),
            writer: FramedWrite::new(stdin, JsonLineCodec::new()),
            reader: FramedRead::new(stdout, JsonLineCodec::new()),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Write the request, then race one response line against the deadline.
    pub async fn call(
        mut self,
        request: WireRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, BridgeError> {
        let id = request.id;

        if let Err(e) = self.writer.send(request).await {
            // Usually a broken pipe from a worker that died on startup.
            tracing::debug!(error = %e, "Request write failed");
            let exit_code = self.process.terminate().await;
            return Err(BridgeError::WorkerCrashed { exit_code });
        }

        match tokio::time::timeout(timeout, self.read_response(id)).await {
            Ok(Ok(result)) => {
                self.process.terminate().await;
                Ok(result)
            }
            Ok(Err(ReadFailure::Crashed)) => {
                let exit_code = self.process.terminate().await;
                Err(BridgeError::WorkerCrashed { exit_code })
            }
            Ok(Err(ReadFailure::Protocol(reason))) => {
                self.process.terminate().await;
                Err(BridgeError::Protocol(reason))
            }
            Ok(Err(ReadFailure::Worker(err))) => {
                self.process.terminate().await;
                Err(BridgeError::Worker {
                    code: err.code,
                    message: err.message,
                })
            }
            Err(_elapsed) => {
                self.process.terminate().await;
                Err(BridgeError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn read_response(&mut self, id: CallId) -> Result<serde_json::Value, ReadFailure> {
        match self.reader.next().await {
            Some(Ok(response)) => {
                if response.id != id {
                    return Err(ReadFailure::Protocol(format!(
                        "response id mismatch: expected {id}, got {}",
                        response.id
                    )));
                }
                match response.into_outcome() {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(err)) => Err(ReadFailure::Worker(err)),
                    Err(reason) => Err(ReadFailure::Protocol(reason)),
                }
            }
            Some(Err(e)) => Err(ReadFailure::Protocol(e.to_string())),
            None => Err(ReadFailure::Crashed),
        }
    }
}
