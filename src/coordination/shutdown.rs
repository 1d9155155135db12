//! Shutdown Coordination
//!
//! One coordinator per run. Whatever triggers shutdown (an OS signal, a
//! fatal error, or a completed bounded run), the cancellation fan-out fires
//! exactly once: the first `request` wins and later causes are ignored.
//! Long-lived tasks hold a `ShutdownToken` and select on `wait()`; the
//! teardown itself stops services strictly in reverse start order and
//! records what happened in a session summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::gates::ReportWriter;
use crate::supervisor::manager::SupervisionSession;
use crate::supervisor::process::ServiceState;

/// What triggered the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGTERM / SIGINT / SIGQUIT
    Signal,
    /// Unrecoverable error somewhere in the pipeline
    Fatal,
    /// A bounded run finished its work
    Complete,
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownCause::Signal => write!(f, "signal"),
            ShutdownCause::Fatal => write!(f, "fatal error"),
            ShutdownCause::Complete => write!(f, "run complete"),
        }
    }
}

/// Timing knobs for stopping services
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShutdownConfig {
    /// How long a service gets to exit after SIGTERM
    #[serde(default = "default_term_grace")]
    pub term_grace_secs: u64,
    /// How long to wait for the process to disappear after SIGKILL
    #[serde(default = "default_kill_wait")]
    pub kill_wait_secs: u64,
}

fn default_term_grace() -> u64 {
    10
}

fn default_kill_wait() -> u64 {
    5
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            term_grace_secs: default_term_grace(),
            kill_wait_secs: default_kill_wait(),
        }
    }
}

/// Single point of shutdown truth for a run
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    requested: AtomicBool,
    cause_tx: watch::Sender<Option<ShutdownCause>>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (cause_tx, _) = watch::channel(None);
        Self {
            config,
            requested: AtomicBool::new(false),
            cause_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Request shutdown. Only the first call takes effect; the winning cause
    /// is fanned out to every token. Returns whether this call won.
    pub fn request(&self, cause: ShutdownCause) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            debug!(cause = %cause, "shutdown already in progress, ignoring");
            return false;
        }
        info!(cause = %cause, "shutdown requested");
        self.cause_tx.send_replace(Some(cause));
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        *self.cause_tx.borrow()
    }

    /// Token for tasks that need to observe shutdown. Tokens created after
    /// the request still see the cause.
    pub fn subscribe(&self) -> ShutdownToken {
        ShutdownToken {
            cause_rx: self.cause_tx.subscribe(),
        }
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.config.term_grace_secs)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.config.kill_wait_secs)
    }

    /// Stop every service in the session in reverse start order, then write
    /// a session summary. Stop failures are logged and recorded but never
    /// interrupt the sweep. Calling this twice on the same session is a
    /// no-op; the second call returns `None`.
    pub async fn shutdown_session(
        &self,
        session: &mut SupervisionSession,
        reason: &str,
        writer: Option<&ReportWriter>,
    ) -> Option<SessionSummary> {
        if session.is_torn_down() {
            debug!(session = %session.id, "session already torn down");
            return None;
        }
        session.mark_torn_down();

        info!(
            session = %session.id,
            reason = %reason,
            services = session.handles.len(),
            "stopping services in reverse start order"
        );

        let mut records = Vec::with_capacity(session.handles.len());
        for handle in session.handles.iter_mut().rev() {
            let outcome = match handle.stop(self.term_grace(), self.kill_wait()).await {
                Ok(outcome) => outcome.to_string(),
                Err(e) => {
                    error!(service = %handle.name, error = %e, "stop failed, continuing shutdown");
                    format!("error: {e}")
                }
            };
            records.push(ServiceStopRecord {
                name: handle.name.clone(),
                pid: handle.pid,
                final_state: handle.state,
                outcome,
            });
        }

        let summary = SessionSummary {
            session_id: session.id,
            started_at: session.started_at,
            ended_at: Utc::now(),
            reason: reason.to_string(),
            restarts: session.restarts,
            services: records,
        };

        if let Some(writer) = writer {
            let file_name = format!("session_{}.json", summary.session_id);
            if let Err(e) = writer.write_json(&file_name, &summary) {
                error!(error = %e, "could not write session summary");
            }
        }

        info!(session = %session.id, "session torn down");
        Some(summary)
    }
}

/// Cheap clonable view of the shutdown state for long-lived tasks
#[derive(Clone)]
pub struct ShutdownToken {
    cause_rx: watch::Receiver<Option<ShutdownCause>>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        self.cause_rx.borrow().is_some()
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        *self.cause_rx.borrow()
    }

    /// Resolve once shutdown is requested. A dropped coordinator reads as
    /// fatal so orphaned tasks still wind down.
    pub async fn wait(&mut self) -> ShutdownCause {
        loop {
            if let Some(cause) = *self.cause_rx.borrow() {
                return cause;
            }
            if self.cause_rx.changed().await.is_err() {
                return ShutdownCause::Fatal;
            }
        }
    }
}

/// Audit record of one torn-down session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
    /// In-place restarts performed during the session
    pub restarts: u32,
    /// In stop order (reverse of start order)
    pub services: Vec<ServiceStopRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStopRecord {
    pub name: String,
    pub pid: u32,
    pub final_state: ServiceState,
    pub outcome: String,
}

/// Route SIGTERM/SIGINT/SIGQUIT (Ctrl+C on Windows) into the coordinator.
/// Handlers are registered up front so a registration failure surfaces
/// before any service is started.
pub fn install_signal_handlers(coordinator: &std::sync::Arc<ShutdownCoordinator>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        let on_term = coordinator.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            info!("received SIGTERM");
            on_term.request(ShutdownCause::Signal);
        });

        let on_int = coordinator.clone();
        tokio::spawn(async move {
            sigint.recv().await;
            info!("received SIGINT");
            on_int.request(ShutdownCause::Signal);
        });

        let on_quit = coordinator.clone();
        tokio::spawn(async move {
            sigquit.recv().await;
            info!("received SIGQUIT");
            on_quit.request(ShutdownCause::Signal);
        });
    }

    #[cfg(windows)]
    {
        let on_ctrl_c = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C");
                on_ctrl_c.request(ShutdownCause::Signal);
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::process::ProcessHandle;
    use crate::supervisor::spec::{HealthTarget, ServiceSpec};
    use std::collections::BTreeMap;

    #[test]
    fn test_cause_display() {
        assert_eq!(ShutdownCause::Signal.to_string(), "signal");
        assert_eq!(ShutdownCause::Fatal.to_string(), "fatal error");
        assert_eq!(ShutdownCause::Complete.to_string(), "run complete");
    }

    #[test]
    fn test_first_request_wins() {
        let coordinator = ShutdownCoordinator::with_defaults();
        assert!(!coordinator.is_requested());

        assert!(coordinator.request(ShutdownCause::Signal));
        assert!(!coordinator.request(ShutdownCause::Fatal));
        assert!(coordinator.is_requested());
        assert_eq!(coordinator.cause(), Some(ShutdownCause::Signal));
    }

    #[tokio::test]
    async fn test_late_subscriber_still_sees_the_cause() {
        let coordinator = ShutdownCoordinator::with_defaults();
        coordinator.request(ShutdownCause::Complete);

        let mut token = coordinator.subscribe();
        assert!(token.is_shutdown());
        assert_eq!(token.wait().await, ShutdownCause::Complete);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_request() {
        let coordinator = ShutdownCoordinator::with_defaults();
        let mut token = coordinator.subscribe();

        let waiter = tokio::spawn(async move { token.wait().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.request(ShutdownCause::Signal);

        let cause = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert_eq!(cause, ShutdownCause::Signal);
    }

    #[tokio::test]
    async fn test_dropped_coordinator_reads_as_fatal() {
        let coordinator = ShutdownCoordinator::with_defaults();
        let mut token = coordinator.subscribe();
        drop(coordinator);
        assert_eq!(token.wait().await, ShutdownCause::Fatal);
    }

    fn sleeper_spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            port: None,
            health: HealthTarget::Tcp {
                addr: "127.0.0.1:1".to_string(),
            },
            startup_timeout_secs: None,
            depends_on: vec![],
            satellite: false,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_session_stops_in_reverse_start_order() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let log_dir = dir.path().join("logs");

        let mut session = SupervisionSession::new();
        for name in ["market-data", "execution"] {
            let handle = ProcessHandle::spawn(&sleeper_spec(name), &run_dir, &log_dir).unwrap();
            session.handles.push(handle);
        }

        let coordinator = ShutdownCoordinator::with_defaults();
        let summary = coordinator
            .shutdown_session(&mut session, "signal", None)
            .await
            .expect("first teardown returns a summary");

        let order: Vec<&str> = summary.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["execution", "market-data"]);
        for record in &summary.services {
            assert_eq!(record.final_state, ServiceState::Stopped);
        }
        assert!(!run_dir.join("market-data.pid").exists());
        assert!(!run_dir.join("execution.pid").exists());

        // Second teardown of the same session is a no-op
        assert!(coordinator
            .shutdown_session(&mut session, "signal", None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_summary_written_to_reports_dir() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let writer = ReportWriter::new(&reports);

        let mut session = SupervisionSession::new();
        let coordinator = ShutdownCoordinator::with_defaults();
        let summary = coordinator
            .shutdown_session(&mut session, "run complete", Some(&writer))
            .await
            .unwrap();

        let path = reports.join(format!("session_{}.json", summary.session_id));
        assert!(path.exists());
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("run complete"));
    }
}
