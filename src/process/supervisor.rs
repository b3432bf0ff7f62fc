use super::{ManagedProcess, ProcessStatus};
use crate::config::{ProcessSettings, StdioSettings};
use crate::error::{McpError, Result};
use std::time::Duration;
use tracing::{error, info, warn};

/// Owns the process behind one stdio connection and applies the restart policy
///
/// A process that exits while `ready` (or was failed by its connection) is
/// respawned with an incremented restart count until the ceiling is reached;
/// after that the supervisor stays in `error` and reports the crash without
/// spawning again.
#[derive(Debug)]
pub struct ProcessSupervisor {
    settings: StdioSettings,
    process_settings: ProcessSettings,
    process: Option<ManagedProcess>,
    spawn_count: u32,
}

enum Next {
    Reuse,
    Spawn { restart_count: u32 },
    Fail(McpError),
}

impl ProcessSupervisor {
    pub fn new(settings: StdioSettings, process_settings: ProcessSettings) -> Self {
        Self {
            settings,
            process_settings,
            process: None,
            spawn_count: 0,
        }
    }

    /// Total processes spawned over this supervisor's lifetime
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    pub fn restart_count(&self) -> u32 {
        self.process.as_ref().map_or(0, ManagedProcess::restart_count)
    }

    pub fn status(&self) -> Option<ProcessStatus> {
        self.process.as_ref().map(ManagedProcess::status)
    }

    pub fn process_mut(&mut self) -> Option<&mut ManagedProcess> {
        self.process.as_mut()
    }

    pub fn is_stale(&self) -> bool {
        self.process
            .as_ref()
            .map_or(false, |p| p.is_stale(self.process_settings.stale_after))
    }

    /// Return a usable process, spawning or restarting as the policy allows
    ///
    /// A freshly spawned process is in `starting`; the caller performs the
    /// handshake and then calls [`ProcessSupervisor::mark_ready`].
    pub async fn ensure_running(&mut self) -> Result<&mut ManagedProcess> {
        let next = match self.process.as_mut() {
            None => Next::Spawn { restart_count: 0 },
            Some(process) => match process.status() {
                ProcessStatus::Stopped => Next::Spawn { restart_count: 0 },
                ProcessStatus::Stopping => {
                    Next::Fail(McpError::connection("process is shutting down"))
                }
                ProcessStatus::Starting => {
                    if process.process_alive() {
                        Next::Reuse
                    } else {
                        process.update_status(ProcessStatus::Error)?;
                        let exit_status = process.exit_status();
                        let stderr = process.recent_stderr().await;
                        error!(pid = process.pid(), ?exit_status, "Process exited during startup");
                        Next::Fail(McpError::process_crash(exit_status, stderr))
                    }
                }
                ProcessStatus::Ready if process.process_alive() => Next::Reuse,
                ProcessStatus::Ready | ProcessStatus::Error => {
                    let exit_status = process.exit_status();
                    if process.exceeded_restart_limit() {
                        if process.status() == ProcessStatus::Ready {
                            process.update_status(ProcessStatus::Error)?;
                        }
                        let stderr = process.recent_stderr().await;
                        error!(
                            pid = process.pid(),
                            ?exit_status,
                            restart_count = process.restart_count(),
                            "Process crashed and restart limit is exhausted"
                        );
                        Next::Fail(McpError::process_crash(exit_status, stderr))
                    } else {
                        warn!(
                            pid = process.pid(),
                            ?exit_status,
                            restart_count = process.restart_count() + 1,
                            max_restarts = self.process_settings.max_restarts,
                            "Process exited, restarting"
                        );
                        Next::Spawn {
                            restart_count: process.restart_count() + 1,
                        }
                    }
                }
            },
        };

        match next {
            Next::Reuse => {}
            Next::Spawn { restart_count } => self.spawn(restart_count).await?,
            Next::Fail(error) => return Err(error),
        }

        self.process
            .as_mut()
            .ok_or_else(|| McpError::connection("no process available"))
    }

    async fn spawn(&mut self, restart_count: u32) -> Result<()> {
        if let Some(mut old) = self.process.take() {
            old.kill().await;
        }
        let process = ManagedProcess::spawn(
            &self.settings,
            restart_count,
            self.process_settings.max_restarts,
        )?;
        self.spawn_count += 1;
        self.process = Some(process);
        Ok(())
    }

    /// Handshake completed: `starting -> ready`
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.update_status(ProcessStatus::Ready),
            None => Err(McpError::connection("no process to mark ready")),
        }
    }

    /// The connection gave up on the current process (timeout, broken pipe)
    ///
    /// The process is killed and left in `error`; the next
    /// [`ProcessSupervisor::ensure_running`] applies the restart policy.
    pub async fn fail_current(&mut self, reason: &str) {
        if let Some(process) = self.process.as_mut() {
            if matches!(process.status(), ProcessStatus::Starting | ProcessStatus::Ready) {
                warn!(pid = process.pid(), reason, "Failing MCP server process");
                let _ = process.update_status(ProcessStatus::Error);
                process.kill().await;
            }
        }
    }

    /// Wait for the current process to exit
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<i32> {
        match self.process.as_mut() {
            Some(process) => process.wait_for_exit(timeout).await,
            None => None,
        }
    }

    /// Graceful stop of the current process, if any
    pub async fn shutdown(&mut self) {
        if let Some(process) = self.process.as_mut() {
            info!(pid = process.pid(), "Shutting down MCP server process");
            process.shutdown(self.process_settings.shutdown_grace).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor(script: &str, max_restarts: u32) -> ProcessSupervisor {
        ProcessSupervisor::new(
            StdioSettings::new("sh").with_args(["-c", script]),
            ProcessSettings {
                max_restarts,
                shutdown_grace: Duration::from_secs(2),
                ..ProcessSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_restart_ceiling_then_error() {
        let mut supervisor = supervisor("exit 3", 3);

        // Initial spawn plus three restarts
        for expected_restarts in 0..=3 {
            supervisor.ensure_running().await.unwrap();
            assert_eq!(supervisor.restart_count(), expected_restarts);
            supervisor.mark_ready().unwrap();
            assert_eq!(supervisor.wait_for_exit(Duration::from_secs(5)).await, Some(3));
        }
        assert_eq!(supervisor.spawn_count(), 4);

        match supervisor.ensure_running().await {
            Err(McpError::ProcessCrash { exit_status, .. }) => assert_eq!(exit_status, Some(3)),
            other => panic!("expected process crash, got {:?}", other),
        }
        assert_eq!(supervisor.status(), Some(ProcessStatus::Error));

        // No further spawns once the ceiling is hit
        assert!(supervisor.ensure_running().await.is_err());
        assert_eq!(supervisor.spawn_count(), 4);
    }

    #[tokio::test]
    async fn test_exit_during_startup_is_a_crash() {
        let mut supervisor = supervisor("echo 'missing config' >&2; exit 1", 3);
        supervisor.ensure_running().await.unwrap();
        supervisor.wait_for_exit(Duration::from_secs(5)).await;

        match supervisor.ensure_running().await {
            Err(McpError::ProcessCrash { exit_status, .. }) => assert_eq!(exit_status, Some(1)),
            other => panic!("expected process crash, got {:?}", other),
        }
        assert_eq!(supervisor.status(), Some(ProcessStatus::Error));

        // The error state still restarts under the ceiling
        supervisor.ensure_running().await.unwrap();
        assert_eq!(supervisor.restart_count(), 1);
    }

    #[tokio::test]
    async fn test_live_process_is_reused() {
        let mut supervisor = supervisor("sleep 5", 3);
        let pid = supervisor.ensure_running().await.unwrap().pid();
        supervisor.mark_ready().unwrap();

        assert_eq!(supervisor.ensure_running().await.unwrap().pid(), pid);
        assert_eq!(supervisor.spawn_count(), 1);

        supervisor.shutdown().await;
        assert_eq!(supervisor.status(), Some(ProcessStatus::Stopped));

        // A deliberately stopped process starts over with a fresh count
        supervisor.ensure_running().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 2);
        assert_eq!(supervisor.restart_count(), 0);
        supervisor.fail_current("test").await;
        assert_eq!(supervisor.status(), Some(ProcessStatus::Error));
    }
}
