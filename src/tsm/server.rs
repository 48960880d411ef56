//! A single tool server subprocess: its stdio plumbing, pending-request
//! table, and per-server concurrency limit.

use crate::tsm::protocol::{InboundMessage, RpcRequest, ToolsListResult};
use crate::types::{CoreError, Result, ToolSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;

/// Number of consecutive malformed lines from a server's stdout that trigger
/// a restart, on the theory that the process has wedged.
const MALFORMED_LINE_FAULT_THRESHOLD: u32 = 3;

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// A live connection to one tool server subprocess.
pub struct ToolServerHandle {
    name: String,
    command: Vec<String>,
    write_tx: mpsc::UnboundedSender<String>,
    pending: PendingTable,
    next_id: AtomicU64,
    semaphore: Arc<Semaphore>,
    malformed_lines: Arc<AtomicU64>,
    child: Mutex<Option<Child>>,
}

impl ToolServerHandle {
    /// Spawn the subprocess, start its reader/writer tasks, and discover its
    /// tools via `tools/list` within `startup_timeout`.
    pub async fn spawn(
        name: String,
        command: Vec<String>,
        startup_timeout: Duration,
        max_inflight: usize,
    ) -> Result<(Arc<Self>, Vec<ToolSpec>)> {
        let handle = Arc::new(Self::spawn_process(&name, &command, max_inflight)?);
        let tools = timeout(startup_timeout, handle.discover_tools())
            .await
            .map_err(|_| {
                CoreError::ServerUnavailable(format!(
                    "{name}: no tools/list response within {startup_timeout:?}"
                ))
            })??;
        Ok((handle, tools))
    }

    fn spawn_process(name: &str, command: &[String], max_inflight: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CoreError::ServerUnavailable(format!("{name}: empty command")))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoreError::ServerUnavailable(format!("{name}: failed to spawn: {e}"))
            })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let malformed_lines = Arc::new(AtomicU64::new(0));

        let (write_tx, write_rx) = mpsc::unbounded_channel::<String>();
        spawn_writer(stdin, write_rx, name.to_string());
        spawn_reader(stdout, pending.clone(), malformed_lines.clone(), name.to_string());
        spawn_stderr_forwarder(stderr, name.to_string());

        Ok(Self {
            name: name.to_string(),
            command: command.to_vec(),
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            semaphore: Arc::new(Semaphore::new(max_inflight.max(1))),
            malformed_lines,
            child: Mutex::new(Some(child)),
        })
    }

    /// Server name as configured.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The command this server was spawned with, for restart.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// How many consecutive malformed lines have been observed since the
    /// last successfully parsed message.
    pub fn malformed_line_count(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    /// True once `malformed_line_count` has crossed the restart threshold.
    pub fn should_restart(&self) -> bool {
        self.malformed_line_count() >= MALFORMED_LINE_FAULT_THRESHOLD as u64
    }

    /// Re-run `tools/list` against this server, bounded by `deadline`.
    pub async fn list_tools(&self, deadline: Duration) -> Result<Vec<ToolSpec>> {
        timeout(deadline, self.discover_tools())
            .await
            .map_err(|_| CoreError::CallTimeout(deadline))?
    }

    async fn discover_tools(&self) -> Result<Vec<ToolSpec>> {
        let value = self.send_request("tools/list", serde_json::json!({})).await?;
        let result: ToolsListResult = serde_json::from_value(value).map_err(|e| {
            CoreError::ProtocolError(format!("{}: malformed tools/list result: {e}", self.name))
        })?;
        Ok(result
            .tools
            .into_iter()
            .map(|e| ToolSpec {
                server_name: self.name.clone(),
                name: e.name,
                description: e.description,
                parameters: e.input_schema,
            })
            .collect())
    }

    /// Call a tool by its short name, honoring the per-server concurrency
    /// limit and the given per-call deadline.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> (Result<serde_json::Value>, u64) {
        let start = Instant::now();
        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => {
                return (
                    Err(CoreError::ServerUnavailable(self.name.clone())),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let result = match timeout(
            deadline,
            self.send_request(
                "tools/call",
                serde_json::json!({ "name": tool_name, "arguments": arguments }),
            ),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(CoreError::CallTimeout(deadline)),
        };
        (result, start.elapsed().as_millis() as u64)
    }

    async fn send_request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let line = request
            .to_line()
            .map_err(|e| CoreError::ProtocolError(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.write_tx.send(line).is_err() {
            self.pending.lock().remove(&id);
            return Err(CoreError::ServerCrashed(self.name.clone()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ServerCrashed(self.name.clone())),
        }
    }

    /// Marks every pending request as failed because the server is being
    /// restarted, leaving no id/name information lost: callers still hold
    /// the original `ToolCall` and rebuild their own error record from it.
    pub fn fail_all_pending(&self) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(CoreError::ServerCrashed(self.name.clone())));
        }
    }

    /// Send SIGTERM, wait up to `grace`, then SIGKILL if still alive.
    pub async fn shutdown(&self, grace: Duration) {
        let mut guard = self.child.lock();
        let Some(mut child) = guard.take() else {
            return;
        };
        drop(guard);

        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        if timeout(grace, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
}

fn spawn_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    name: String,
) {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::warn!(server = %name, error = %e, "failed writing to tool server stdin");
                break;
            }
        }
    });
}

fn spawn_reader(
    stdout: tokio::process::ChildStdout,
    pending: PendingTable,
    malformed_lines: Arc<AtomicU64>,
    name: String,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<InboundMessage>(&line) {
                        Ok(InboundMessage::Response(resp)) => {
                            malformed_lines.store(0, Ordering::Relaxed);
                            if let Some(tx) = pending.lock().remove(&resp.id) {
                                let result = match resp.error {
                                    Some(err) => Err(CoreError::RemoteError {
                                        code: err.code,
                                        msg: err.message,
                                    }),
                                    None => Ok(resp.result.unwrap_or(serde_json::Value::Null)),
                                };
                                let _ = tx.send(result);
                            }
                        }
                        Ok(InboundMessage::Notification(note)) => {
                            malformed_lines.store(0, Ordering::Relaxed);
                            if note.method == "log" {
                                tracing::info!(server = %name, params = %note.params, "tool server log");
                            }
                        }
                        Err(e) => {
                            let count = malformed_lines.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(server = %name, error = %e, count, "malformed line from tool server");
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(server = %name, "tool server stdout closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "error reading tool server stdout");
                    break;
                }
            }
        }
        for (_, tx) in pending.lock().drain() {
            let _ = tx.send(Err(CoreError::ServerCrashed(name.clone())));
        }
    });
}

fn spawn_stderr_forwarder(stderr: tokio::process::ChildStderr, name: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(server = %name, "{line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_discover_tools_from_a_real_subprocess() {
        // `cat` echoes our request line back, which is not valid JSON-RPC,
        // so this exercises the startup-timeout failure path rather than a
        // successful discovery (no fake tool server binary is available in
        // this environment).
        let result = ToolServerHandle::spawn(
            "echo_server".to_string(),
            vec!["cat".to_string()],
            Duration::from_millis(200),
            4,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn should_restart_flips_at_threshold() {
        let malformed = Arc::new(AtomicU64::new(0));
        for _ in 0..MALFORMED_LINE_FAULT_THRESHOLD - 1 {
            malformed.fetch_add(1, Ordering::Relaxed);
        }
        assert!(malformed.load(Ordering::Relaxed) < MALFORMED_LINE_FAULT_THRESHOLD as u64);
        malformed.fetch_add(1, Ordering::Relaxed);
        assert!(malformed.load(Ordering::Relaxed) >= MALFORMED_LINE_FAULT_THRESHOLD as u64);
    }
}
