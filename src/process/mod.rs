//! Stdio server process lifecycle
//!
//! A [`ManagedProcess`] wraps one spawned MCP server: its pipes, its status in
//! the lifecycle state machine and the bookkeeping the pool needs (restart
//! count, last activity, cached capabilities). The restart policy lives in
//! [`ProcessSupervisor`].
//!
//! ```text
//! starting ──> ready ──> stopping ──> stopped
//!     │          │
//!     └──> error <┘
//! ```

mod supervisor;

pub use supervisor::ProcessSupervisor;

use crate::config::StdioSettings;
use crate::error::{McpError, Result};
use crate::mcp::types::ToolDescriptor;
use crate::utils::logging::truncate_for_log;
use serde_json::Value;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bytes of stderr retained for crash reports
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Starting,
    Ready,
    Error,
    Stopping,
    Stopped,
}

impl ProcessStatus {
    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Starting, Error) | (Ready, Error) | (Ready, Stopping) | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One spawned stdio MCP server
pub struct ManagedProcess {
    command_line: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    status: ProcessStatus,
    restart_count: u32,
    max_restarts: u32,
    start_time: Instant,
    last_activity: Instant,
    exit_code: Option<i32>,
    /// Capabilities reported during the handshake
    pub capabilities: Option<Value>,
    /// Tools most recently discovered from this process
    pub tools: Option<Vec<ToolDescriptor>>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.command_line)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("restart_count", &self.restart_count)
            .field("max_restarts", &self.max_restarts)
            .finish()
    }
}

impl ManagedProcess {
    /// Spawn the configured command with piped stdio, in `starting` status
    pub fn spawn(settings: &StdioSettings, restart_count: u32, max_restarts: u32) -> Result<Self> {
        let command_line = settings.command_line();
        if settings.command.trim().is_empty() {
            return Err(McpError::process_spawn(command_line, "command cannot be empty"));
        }

        let mut cmd = Command::new(&settings.command);
        cmd.args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = settings.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &settings.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::process_spawn(command_line.clone(), e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::process_spawn(command_line.clone(), "failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::process_spawn(command_line.clone(), "failed to get stdout handle"))?;

        let pid = child.id();
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, stderr = %truncate_for_log(&line, 500), "MCP server stderr");
                    let mut tail = tail.lock().await;
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_BYTES {
                        let mut cut = tail.len() - STDERR_TAIL_BYTES;
                        while !tail.is_char_boundary(cut) {
                            cut += 1;
                        }
                        tail.drain(..cut);
                    }
                }
            })
        });

        info!(pid, command = %command_line, restart_count, "Spawned MCP server process");

        let now = Instant::now();
        Ok(Self {
            command_line,
            pid,
            child,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            stderr_tail,
            stderr_task,
            status: ProcessStatus::Starting,
            restart_count,
            max_restarts,
            start_time: now,
            last_activity: now,
            exit_code: None,
            capabilities: None,
            tools: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn update_status(&mut self, next: ProcessStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(McpError::invalid_transition(self.status, next));
        }
        debug!(pid = self.pid, from = %self.status, to = %next, "Process status change");
        self.status = next;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Record a successful exchange with the process
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() > threshold
    }

    pub fn exceeded_restart_limit(&self) -> bool {
        self.restart_count >= self.max_restarts
    }

    /// Exit code once the process has exited, without blocking
    ///
    /// On unix a signal-terminated process reports `128 + signal`.
    pub fn exit_status(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "Failed to poll process exit");
                None
            }
        }
    }

    /// OS-level liveness check
    pub fn process_alive(&mut self) -> bool {
        if self.exit_status().is_some() {
            return false;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // Signal 0 only checks that the pid exists and is signalable
                return unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
            }
        }

        true
    }

    /// Tail of the process's stderr output
    pub async fn recent_stderr(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().await;
        let trimmed = tail.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Write one newline-terminated message to stdin
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::connection("process stdin is closed"))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::connection(format!("Failed to write to process stdin: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::connection(format!("Failed to write to process stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::connection(format!("Failed to flush process stdin: {}", e)))
    }

    /// Read one line from stdout; `None` at end of stream
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| McpError::connection("process stdout is closed"))?;

        let mut line = String::new();
        let read = stdout
            .read_line(&mut line)
            .await
            .map_err(|e| McpError::connection(format!("Error reading from stdout: {}", e)))?;
        Ok((read > 0).then_some(line))
    }

    /// Best-effort close of stdin, stdout and the stderr reader; idempotent
    pub async fn close_io_streams(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                debug!(pid = self.pid, error = %e, "Error closing process stdin");
            }
        }
        self.stdout.take();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<i32> {
        if let Some(code) = self.exit_status() {
            return Some(code);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            _ => None,
        }
    }

    /// Forcefully terminate without a grace period
    pub async fn kill(&mut self) {
        self.close_io_streams().await;
        if self.exit_status().is_none() {
            if let Err(e) = self.child.kill().await {
                debug!(pid = self.pid, error = %e, "Failed to kill process");
            }
            self.exit_status();
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then kill
    pub async fn shutdown(&mut self, grace: Duration) {
        let stopping = self.status == ProcessStatus::Ready;
        if stopping {
            let _ = self.update_status(ProcessStatus::Stopping);
        }

        self.close_io_streams().await;

        if self.exit_status().is_none() {
            #[cfg(unix)]
            {
                if let Some(pid) = self.pid {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }

            if self.wait_for_exit(grace).await.is_none() {
                warn!(pid = self.pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, killing");
                self.kill().await;
            }
        }

        if stopping {
            let _ = self.update_status(ProcessStatus::Stopped);
        }
        info!(pid = self.pid, exit_status = ?self.exit_code, "MCP server process stopped");
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
