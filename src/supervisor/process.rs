//! Process Handles and Child Lifecycle
//!
//! One `ProcessHandle` per spawned service, exclusively owned by the
//! supervisor. Spawning writes a PID file and redirects child output to a
//! per-service log; stopping escalates SIGTERM -> SIGKILL with a liveness
//! check before the handle is considered gone. PID files are bookkeeping
//! for audit and crash recovery; the in-memory handle is the source of
//! truth while a session lives.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::spec::ServiceSpec;
use crate::error::{PitbossError, Result};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Spawned, not yet confirmed healthy
    Starting,
    Healthy,
    /// Failing health polls; may still recover
    Unhealthy,
    Stopping,
    /// Confirmed dead after a requested stop
    Stopped,
    /// Terminal within a session; cleaned up, never restarted in place
    Failed,
}

impl ServiceState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceState::Healthy)
    }

    /// Process is expected to be alive in these states
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Healthy | ServiceState::Unhealthy
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Unhealthy => write!(f, "unhealthy"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// How a stop request concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Handle was already terminal; nothing signalled
    AlreadyStopped,
    /// Exited within the SIGTERM grace period
    Graceful,
    /// Needed SIGKILL
    Forced,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::AlreadyStopped => write!(f, "already_stopped"),
            StopOutcome::Graceful => write!(f, "graceful"),
            StopOutcome::Forced => write!(f, "forced"),
        }
    }
}

/// Live handle to one spawned service
#[derive(Debug)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub state: ServiceState,
    child: Child,
    pid_file: PathBuf,
}

impl ProcessHandle {
    /// Spawn the service, write its PID file, and wire stdout/stderr to
    /// `<log_dir>/<name>.log`.
    pub fn spawn(spec: &ServiceSpec, run_dir: &Path, log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        fs::create_dir_all(log_dir)?;

        let log_path = log_dir.join(format!("{}.log", spec.name));
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        // No kill_on_drop: services are daemons that may outlive a crashed
        // orchestrator. Their PID files let the next run find the orphans.
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let child = cmd.spawn().map_err(|e| PitbossError::SpawnFailed {
            service: spec.name.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| PitbossError::SpawnFailed {
            service: spec.name.clone(),
            reason: "exited before a pid could be read".to_string(),
        })?;

        let pid_file = run_dir.join(format!("{}.pid", spec.name));
        fs::write(&pid_file, pid.to_string())?;

        info!(
            service = %spec.name,
            pid = pid,
            log = %log_path.display(),
            "service spawned"
        );

        Ok(Self {
            name: spec.name.clone(),
            pid,
            started_at: Utc::now(),
            state: ServiceState::Starting,
            child,
            pid_file,
        })
    }

    /// Single-writer state transition with a logged audit trail
    pub fn mark(&mut self, state: ServiceState, reason: Option<&str>) {
        let from = self.state;
        if from == state {
            return;
        }
        self.state = state;
        info!(
            service = %self.name,
            from = %from,
            to = %state,
            reason = reason.unwrap_or(""),
            "service state changed"
        );
    }

    /// Non-blocking check for child exit; returns the exit status once
    pub fn try_exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!(service = %self.name, error = %e, "could not poll child status");
                None
            }
        }
    }

    /// Stop the service: SIGTERM, wait up to `term_grace`, then SIGKILL and
    /// wait up to `kill_wait`. Confirms the process is gone and removes the
    /// PID file. Idempotent: a terminal handle is a no-op, and a child that
    /// died on its own is cleaned up without error.
    pub async fn stop(&mut self, term_grace: Duration, kill_wait: Duration) -> Result<StopOutcome> {
        if self.state.is_terminal() {
            debug!(service = %self.name, state = %self.state, "stop requested on terminal handle");
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.mark(ServiceState::Stopping, None);

        if self.try_exit_status().is_some() || !pid_alive(self.pid as i32) {
            self.finish_stop(ServiceState::Stopped);
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.signal(false);
        if self.wait_for_exit(term_grace).await {
            self.finish_stop(ServiceState::Stopped);
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            service = %self.name,
            pid = self.pid,
            grace_secs = term_grace.as_secs(),
            "did not exit in grace period, sending SIGKILL"
        );
        self.signal(true);
        if self.wait_for_exit(kill_wait).await {
            self.finish_stop(ServiceState::Stopped);
            return Ok(StopOutcome::Forced);
        }

        Err(PitbossError::Internal(format!(
            "service '{}' (pid {}) survived SIGKILL",
            self.name, self.pid
        )))
    }

    /// Kill immediately and clean up; used when a startup attempt fails
    pub async fn kill_and_clean(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.try_exit_status().is_none() && pid_alive(self.pid as i32) {
            self.signal(true);
            self.wait_for_exit(Duration::from_secs(5)).await;
        }
        self.finish_stop(ServiceState::Failed);
    }

    pub fn remove_pid_file(&self) {
        if self.pid_file.exists() {
            if let Err(e) = fs::remove_file(&self.pid_file) {
                warn!(service = %self.name, error = %e, "could not remove pid file");
            }
        }
    }

    fn finish_stop(&mut self, state: ServiceState) {
        // Reap if possible so no zombie lingers
        let _ = self.child.try_wait();
        self.remove_pid_file();
        self.mark(state, None);
    }

    /// Deliver a stop request: SIGTERM, or SIGKILL when `force`. Platforms
    /// without signals collapse both to the runtime's hard kill.
    fn signal(&mut self, force: bool) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            match kill(Pid::from_raw(self.pid as i32), sig) {
                Ok(()) => {
                    debug!(service = %self.name, pid = self.pid, signal = %sig, "signal sent")
                }
                Err(Errno::ESRCH) => {
                    debug!(service = %self.name, pid = self.pid, "process already gone")
                }
                Err(e) => {
                    warn!(service = %self.name, pid = self.pid, error = %e, "signal failed")
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = force;
            if let Err(e) = self.child.start_kill() {
                debug!(service = %self.name, pid = self.pid, error = %e, "kill failed");
            }
        }
    }

    async fn wait_for_exit(&mut self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self.try_exit_status().is_some() || !pid_alive(self.pid as i32) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

/// Liveness probe by null signal. EPERM means the pid exists but belongs
/// to someone else, which still counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        // No null-signal probe here; presume alive and let try_wait decide
        let _ = pid;
        true
    }
}
