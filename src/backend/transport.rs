use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use super::{BackendState, is_routable_from_atomic, new_state_atomic, state_from_atomic, store_state};
use crate::config::{BackendConfig, RestartConfig};
use crate::jsonrpc::JsonRpcMessage;

/// Owns one OS child process for one backend: spawn, line-delimited JSON
/// read/write, restart-on-exit. Handshake orchestration and request
/// correlation live one level up, in the Stdio Router.
pub struct ChildTransport {
    name: String,
    config: BackendConfig,
    restart: RestartConfig,
    state: AtomicU8,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    child: RwLock<Option<Child>>,
    inbound_tx: mpsc::UnboundedSender<(String, JsonRpcMessage)>,
    spawned_tx: mpsc::UnboundedSender<String>,
    stopping: AtomicBool,
}

impl ChildTransport {
    pub fn new(
        name: String,
        config: BackendConfig,
        restart: RestartConfig,
        inbound_tx: mpsc::UnboundedSender<(String, JsonRpcMessage)>,
        spawned_tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            restart,
            state: new_state_atomic(),
            stdin: Mutex::new(None),
            child: RwLock::new(None),
            inbound_tx,
            spawned_tx,
            stopping: AtomicBool::new(false),
        })
    }

    /// Best-effort check of whether the current process generation is still
    /// alive (used for the optimistic-connect decision on handshake timeout).
    pub async fn is_process_alive(&self) -> bool {
        self.child.read().await.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BackendState {
        state_from_atomic(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        is_routable_from_atomic(&self.state)
    }

    /// Only the Stdio Router drives `Handshaking`/`Connected` transitions —
    /// the transport itself only knows "process alive" vs "process gone".
    pub fn set_state(&self, state: BackendState) {
        store_state(&self.state, state);
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        if !self.config.args.is_empty() {
            cmd.args(&self.config.args);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Supervisor loop: spawn, pump stdout until the child exits, sleep, and
    /// spawn again. Runs until `stop()` is called. Bounded only by the
    /// lifetime of whoever holds the `Arc` (the router, on deregistration,
    /// simply drops its handle and calls `stop()`).
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            self.set_state(BackendState::Starting);
            if let Err(e) = self.clone().spawn_and_pump().await {
                warn!(backend = %self.name, error = %e, "backend process failed");
            }

            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            self.set_state(BackendState::Disconnected);
            tokio::time::sleep(self.restart.retry_delay).await;
        }
    }

    async fn spawn_and_pump(self: Arc<Self>) -> anyhow::Result<()> {
        let mut cmd = self.build_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn backend '{}': {e}", self.name))?;

        let pid = child.id();
        debug!(backend = %self.name, pid = ?pid, "spawned child process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stdout captured for backend '{}'", self.name))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stdin captured for backend '{}'", self.name))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stderr captured for backend '{}'", self.name))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.write().await = Some(child);
        let _ = self.spawned_tx.send(self.name.clone());

        let stderr_name = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let lower = line.to_ascii_lowercase();
                // Advisory start hints only — never flip connectivity state.
                if lower.contains("running on stdio")
                    || lower.contains("server started")
                    || lower.contains("listening")
                {
                    debug!(backend = %stderr_name, "advisory start hint: {line}");
                } else {
                    debug!(backend = %stderr_name, "stderr: {line}");
                }
            }
        });

        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                        Ok(msg) => {
                            if self.inbound_tx.send((self.name.clone(), msg)).is_err() {
                                // Router has gone away; nothing left to do.
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(backend = %self.name, error = %e, "dropping non-JSON line");
                        }
                    }
                }
                Ok(None) => break, // EOF: child closed stdout
                Err(e) => {
                    warn!(backend = %self.name, error = %e, "error reading backend stdout");
                    break;
                }
            }
        }

        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.write().await.take() {
            let _ = child.wait().await;
        }

        info!(backend = %self.name, "backend process exited");
        Ok(())
    }

    /// Fails with `NotConnected`-equivalent (`RouteError::NoRoute`) if there is
    /// no live stdin; otherwise enqueues the serialized line.
    pub async fn send(&self, msg: &JsonRpcMessage) -> anyhow::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' is not connected", self.name))?;

        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| anyhow::anyhow!("write to backend '{}' failed: {e}", self.name))?;
        Ok(())
    }

    /// SIGTERM the process group, escalate to SIGKILL after `kill_grace`.
    pub async fn kill(&self) {
        self.set_state(BackendState::Disconnected);

        let mut guard = self.child.write().await;
        let Some(child) = guard.as_mut() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: libc::kill is safe to call with any pid value; a
            // negative pid targets the whole process group we created with
            // `process_group(0)` at spawn time.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.restart.kill_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(backend = %self.name, "kill grace period elapsed, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }

    /// Stop the supervisor loop: no further restarts are scheduled.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn restart_config() -> RestartConfig {
        RestartConfig {
            retry_delay: Duration::from_millis(1),
            handshake_deadline: Duration::from_millis(50),
            request_deadline: Duration::from_millis(50),
            kill_grace: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (spawned_tx, _spawned_rx) = mpsc::unbounded_channel();
        let transport = ChildTransport::new(
            "alpha".to_string(),
            BackendConfig {
                command: "cat".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            restart_config(),
            tx,
            spawned_tx,
        );
        let msg = JsonRpcMessage::notification("ping", None);
        assert!(transport.send(&msg).await.is_err());
    }

    #[test]
    fn fresh_transport_starts_registered() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (spawned_tx, _spawned_rx) = mpsc::unbounded_channel();
        let transport = ChildTransport::new(
            "alpha".to_string(),
            BackendConfig {
                command: "cat".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            restart_config(),
            tx,
            spawned_tx,
        );
        assert_eq!(transport.state(), BackendState::Registered);
        assert!(!transport.is_connected());
    }
}
