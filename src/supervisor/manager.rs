//! Service Supervision
//!
//! The supervisor starts services in dependency order, each only after the
//! previous is confirmed healthy, then runs the continuous loop: pollers
//! report raw health observations over a channel, and this module alone
//! mutates the handle table. Startup waits use first-success semantics;
//! hysteresis applies only once a service is being monitored. A service
//! that dies or stays unhealthy past the grace window is restarted in
//! place a bounded number of times before the whole session is declared
//! degraded.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::monitor::{HealthMonitor, HealthReport, HealthTransition, HysteresisTracker};
use super::process::{ProcessHandle, ServiceState};
use super::spec::{startup_order, HealthTarget, ServiceSpec};
use crate::config::{MonitorConfig, PathsConfig, PipelineConfig};
use crate::coordination::shutdown::{ShutdownCause, ShutdownToken};
use crate::error::{PitbossError, Result};

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const PORT_WAIT_POLL: Duration = Duration::from_millis(250);
const REPORT_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Supervisor happenings, broadcast for logging and tests
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    ServiceStarted {
        service: String,
        pid: u32,
    },
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
        reason: String,
    },
    RestartAttempt {
        service: String,
        attempt: u32,
    },
    RestartSucceeded {
        service: String,
        pid: u32,
    },
    RestartExhausted {
        service: String,
        attempts: u32,
    },
    StartupCompleted {
        services: usize,
    },
}

/// All state for one run of the pipeline: the handle table (in start
/// order), this session's pollers, and the report channel they feed.
pub struct SupervisionSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// In start order; shutdown walks this in reverse
    pub handles: Vec<ProcessHandle>,
    /// Successful in-place restarts over the session's lifetime
    pub restarts: u32,
    torn_down: bool,
    pollers: Vec<JoinHandle<()>>,
    report_tx: mpsc::Sender<HealthReport>,
    report_rx: Option<mpsc::Receiver<HealthReport>>,
}

impl SupervisionSession {
    pub fn new() -> Self {
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            handles: Vec::new(),
            restarts: 0,
            torn_down: false,
            pollers: Vec::new(),
            report_tx,
            report_rx: Some(report_rx),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Flag the session as torn down and stop its pollers
    pub fn mark_torn_down(&mut self) {
        for poller in self.pollers.drain(..) {
            poller.abort();
        }
        self.torn_down = true;
    }

    pub fn find(&self, name: &str) -> Option<&ProcessHandle> {
        self.handles.iter().find(|h| h.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut ProcessHandle> {
        self.handles.iter_mut().find(|h| h.name == name)
    }

    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.handles
            .iter()
            .map(|h| (h.name.clone(), h.state))
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.handles.iter().filter(|h| h.state.is_healthy()).count()
    }
}

impl Default for SupervisionSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the continuous supervision loop returned
#[derive(Debug)]
pub enum RunEnd {
    ShutdownRequested(ShutdownCause),
    /// A service blew through its in-place restart budget
    Degraded {
        service: String,
        reason: String,
        /// Longest stretch in which every service was healthy; the session
        /// restart policy uses this to decide whether to reset its counter
        longest_healthy_stretch: Duration,
    },
}

enum StartupWait {
    Healthy,
    Exited(String),
    TimedOut,
    Cancelled,
}

enum FailureOutcome {
    RestartedInPlace,
    GaveUp { service: String, reason: String },
    ShutdownDuring(ShutdownCause),
}

/// Owns the handle table for a session and is its only writer
pub struct ServiceSupervisor {
    monitor_config: MonitorConfig,
    pipeline_config: PipelineConfig,
    paths: PathsConfig,
    specs: Vec<ServiceSpec>,
    monitor: HealthMonitor,
    event_tx: broadcast::Sender<SupervisorEvent>,
    /// In-place restart timestamps per service, pruned to the rolling window
    restart_log: HashMap<String, Vec<DateTime<Utc>>>,
}

impl ServiceSupervisor {
    pub fn new(
        monitor_config: MonitorConfig,
        pipeline_config: PipelineConfig,
        paths: PathsConfig,
        specs: Vec<ServiceSpec>,
        monitor: HealthMonitor,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            monitor_config,
            pipeline_config,
            paths,
            specs,
            monitor,
            event_tx,
            restart_log: HashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    /// Start every (non-skipped) service in topological order. Each service
    /// is spawned only after all of its dependencies are Healthy, and is
    /// itself confirmed healthy before the next one starts. Pollers for
    /// confirmed services begin immediately, so monitoring of early services
    /// overlaps the startup of later ones.
    ///
    /// On failure the service that failed is killed and cleaned; services
    /// started before it are left as they are, and the caller decides
    /// whether to roll them back.
    pub async fn start_all(
        &mut self,
        session: &mut SupervisionSession,
        include_satellites: bool,
        startup_timeout_override_secs: Option<u64>,
        shutdown: &mut ShutdownToken,
    ) -> Result<()> {
        let order = startup_order(&self.specs)?;
        let planned: Vec<String> = order
            .into_iter()
            .filter(|name| {
                let satellite = self.spec(name).map(|s| s.satellite).unwrap_or(false);
                if satellite && !include_satellites {
                    info!(service = %name, "satellite skipped");
                }
                include_satellites || !satellite
            })
            .collect();
        info!(session = %session.id, order = ?planned, "startup order resolved");

        let began = Instant::now();
        for name in &planned {
            if shutdown.is_shutdown() {
                return Err(PitbossError::Interrupted);
            }
            let spec = self
                .spec(name)
                .cloned()
                .ok_or_else(|| PitbossError::Internal(format!("no spec for service '{name}'")))?;

            if let Some(port) = spec.port {
                self.wait_port_free(&spec.name, port).await?;
            }

            let handle = ProcessHandle::spawn(&spec, &self.paths.run_dir, &self.paths.log_dir)?;
            self.emit(SupervisorEvent::ServiceStarted {
                service: spec.name.clone(),
                pid: handle.pid,
            });
            session.handles.push(handle);
            let idx = session.handles.len() - 1;

            let timeout = startup_timeout_override_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| {
                    spec.startup_timeout(self.monitor_config.default_startup_timeout_secs)
                });

            let wait = self
                .await_service_healthy(&mut session.handles[idx], &spec.health, timeout, shutdown)
                .await;
            match wait {
                StartupWait::Healthy => {
                    session.handles[idx].mark(ServiceState::Healthy, Some("startup probe succeeded"));
                    let poller = self.monitor.spawn_poller(
                        spec.name.clone(),
                        spec.health.clone(),
                        session.report_tx.clone(),
                        shutdown.clone(),
                    );
                    session.pollers.push(poller);
                }
                StartupWait::Exited(status) => {
                    error!(service = %spec.name, status = %status, "service exited during startup");
                    session.handles[idx].kill_and_clean().await;
                    return Err(PitbossError::SpawnFailed {
                        service: spec.name.clone(),
                        reason: format!("exited during startup: {status}"),
                    });
                }
                StartupWait::TimedOut => {
                    error!(
                        service = %spec.name,
                        timeout_secs = timeout.as_secs(),
                        "service never became healthy"
                    );
                    session.handles[idx].kill_and_clean().await;
                    return Err(PitbossError::StartupTimeout {
                        service: spec.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
                StartupWait::Cancelled => return Err(PitbossError::Interrupted),
            }
        }

        self.emit(SupervisorEvent::StartupCompleted {
            services: planned.len(),
        });
        info!(
            session = %session.id,
            services = planned.len(),
            elapsed_ms = began.elapsed().as_millis() as u64,
            "all services healthy"
        );
        Ok(())
    }

    /// Continuous supervision. Applies hysteresis to poller reports, sweeps
    /// for dead processes and expired grace windows, and restarts failed
    /// services in place within their budget. Returns when shutdown is
    /// requested or a service exhausts its restarts.
    pub async fn run(
        &mut self,
        session: &mut SupervisionSession,
        shutdown: &mut ShutdownToken,
    ) -> Result<RunEnd> {
        let mut report_rx = session.report_rx.take().ok_or_else(|| {
            PitbossError::Internal("supervision loop already ran for this session".to_string())
        })?;

        let mut trackers: HashMap<String, HysteresisTracker> = HashMap::new();
        for handle in &session.handles {
            if handle.state.is_running() {
                trackers.insert(
                    handle.name.clone(),
                    HysteresisTracker::new(self.monitor_config.hysteresis),
                );
            }
        }
        let mut unhealthy_since: HashMap<String, Instant> = HashMap::new();
        let grace = Duration::from_secs(self.monitor_config.unhealthy_grace_secs);

        let mut stretch_start = if session.handles.iter().all(|h| h.state.is_healthy()) {
            Some(Instant::now())
        } else {
            None
        };
        let mut longest_stretch = Duration::ZERO;

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            session = %session.id,
            services = trackers.len(),
            "continuous supervision running"
        );

        loop {
            tokio::select! {
                biased;
                cause = shutdown.wait() => {
                    info!(cause = %cause, "supervision interrupted by shutdown");
                    return Ok(RunEnd::ShutdownRequested(cause));
                }
                maybe = report_rx.recv() => {
                    if let Some(report) = maybe {
                        self.apply_report(session, &mut trackers, &mut unhealthy_since, report);
                    }
                }
                _ = sweep.tick() => {
                    if session.handles.iter().all(|h| h.state.is_healthy()) {
                        if stretch_start.is_none() {
                            stretch_start = Some(Instant::now());
                        }
                    } else if let Some(start) = stretch_start.take() {
                        longest_stretch = longest_stretch.max(start.elapsed());
                    }

                    let mut failures: Vec<(String, String)> = Vec::new();
                    for handle in session.handles.iter_mut() {
                        if handle.state.is_running() {
                            if let Some(status) = handle.try_exit_status() {
                                failures.push((
                                    handle.name.clone(),
                                    format!("process exited: {status}"),
                                ));
                            }
                        }
                    }
                    for (name, since) in unhealthy_since.iter() {
                        if since.elapsed() >= grace && !failures.iter().any(|(n, _)| n == name) {
                            failures.push((
                                name.clone(),
                                format!("unhealthy for over {}s", grace.as_secs()),
                            ));
                        }
                    }

                    for (service, reason) in failures {
                        let outcome = self
                            .handle_service_failure(
                                session,
                                &mut trackers,
                                &mut unhealthy_since,
                                &service,
                                &reason,
                                shutdown,
                            )
                            .await;
                        match outcome {
                            FailureOutcome::RestartedInPlace => {}
                            FailureOutcome::ShutdownDuring(cause) => {
                                return Ok(RunEnd::ShutdownRequested(cause));
                            }
                            FailureOutcome::GaveUp { service, reason } => {
                                if let Some(start) = stretch_start.take() {
                                    longest_stretch = longest_stretch.max(start.elapsed());
                                }
                                return Ok(RunEnd::Degraded {
                                    service,
                                    reason,
                                    longest_healthy_stretch: longest_stretch,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fold one poller observation into the service's tracker; only the
    /// supervisor flips state, and only on a full hysteresis streak.
    fn apply_report(
        &self,
        session: &mut SupervisionSession,
        trackers: &mut HashMap<String, HysteresisTracker>,
        unhealthy_since: &mut HashMap<String, Instant>,
        report: HealthReport,
    ) {
        let Some(handle) = session.find_mut(&report.service) else {
            return;
        };
        // Reports only count for services under observation; anything mid
        // restart or terminal is ignored
        if !matches!(
            handle.state,
            ServiceState::Healthy | ServiceState::Unhealthy
        ) {
            return;
        }
        let tracker = trackers
            .entry(report.service.clone())
            .or_insert_with(|| HysteresisTracker::new(self.monitor_config.hysteresis));

        match tracker.observe(report.healthy) {
            Some(HealthTransition::WentUnhealthy) => {
                let reason = format!(
                    "{} consecutive failed health polls",
                    self.monitor_config.hysteresis
                );
                let from = handle.state;
                warn!(service = %report.service, %reason, "service degraded");
                handle.mark(ServiceState::Unhealthy, Some(&reason));
                unhealthy_since.insert(report.service.clone(), Instant::now());
                self.emit(SupervisorEvent::StateChanged {
                    service: report.service,
                    from,
                    to: ServiceState::Unhealthy,
                    reason,
                });
            }
            Some(HealthTransition::Recovered) => {
                let reason = format!(
                    "{} consecutive successful health polls",
                    self.monitor_config.hysteresis
                );
                let from = handle.state;
                info!(service = %report.service, "service recovered without restart");
                handle.mark(ServiceState::Healthy, Some(&reason));
                unhealthy_since.remove(&report.service);
                self.emit(SupervisorEvent::StateChanged {
                    service: report.service,
                    from,
                    to: ServiceState::Healthy,
                    reason,
                });
            }
            None => {}
        }
    }

    /// Clean up a failed service and try to restart it in place. Gives up
    /// once the rolling-window budget is spent.
    async fn handle_service_failure(
        &mut self,
        session: &mut SupervisionSession,
        trackers: &mut HashMap<String, HysteresisTracker>,
        unhealthy_since: &mut HashMap<String, Instant>,
        service: &str,
        reason: &str,
        shutdown: &mut ShutdownToken,
    ) -> FailureOutcome {
        warn!(service = %service, reason = %reason, "service failed");
        if let Some(handle) = session.find_mut(service) {
            handle.kill_and_clean().await;
        }
        trackers.remove(service);
        unhealthy_since.remove(service);

        loop {
            if shutdown.is_shutdown() {
                return FailureOutcome::ShutdownDuring(
                    shutdown.cause().unwrap_or(ShutdownCause::Fatal),
                );
            }
            if !self.can_restart(service) {
                let attempts = self.monitor_config.max_service_restarts;
                error!(
                    service = %service,
                    attempts = attempts,
                    window_secs = self.monitor_config.service_restart_window_secs,
                    "in-place restart budget exhausted"
                );
                self.emit(SupervisorEvent::RestartExhausted {
                    service: service.to_string(),
                    attempts,
                });
                return FailureOutcome::GaveUp {
                    service: service.to_string(),
                    reason: reason.to_string(),
                };
            }

            let attempt = self.note_restart(service);
            info!(service = %service, attempt = attempt, "attempting in-place restart");
            self.emit(SupervisorEvent::RestartAttempt {
                service: service.to_string(),
                attempt,
            });

            match self.restart_service(session, service, shutdown).await {
                Ok(pid) => {
                    session.restarts += 1;
                    trackers.insert(
                        service.to_string(),
                        HysteresisTracker::new(self.monitor_config.hysteresis),
                    );
                    self.emit(SupervisorEvent::RestartSucceeded {
                        service: service.to_string(),
                        pid,
                    });
                    return FailureOutcome::RestartedInPlace;
                }
                Err(PitbossError::Interrupted) => {
                    return FailureOutcome::ShutdownDuring(
                        shutdown.cause().unwrap_or(ShutdownCause::Fatal),
                    );
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "in-place restart failed");
                }
            }
        }
    }

    /// Respawn one failed service and wait for it to come back healthy. The
    /// fresh handle replaces the old one at the same position so reverse
    /// stop order is preserved.
    async fn restart_service(
        &self,
        session: &mut SupervisionSession,
        service: &str,
        shutdown: &mut ShutdownToken,
    ) -> Result<u32> {
        let spec = self
            .spec(service)
            .cloned()
            .ok_or_else(|| PitbossError::Internal(format!("no spec for service '{service}'")))?;
        let idx = session
            .handles
            .iter()
            .position(|h| h.name == service)
            .ok_or_else(|| PitbossError::Internal(format!("no handle for service '{service}'")))?;

        let mut handle = ProcessHandle::spawn(&spec, &self.paths.run_dir, &self.paths.log_dir)?;
        let timeout = spec.startup_timeout(self.monitor_config.default_startup_timeout_secs);

        match self
            .await_service_healthy(&mut handle, &spec.health, timeout, shutdown)
            .await
        {
            StartupWait::Healthy => {
                handle.mark(ServiceState::Healthy, Some("restart probe succeeded"));
                let pid = handle.pid;
                session.handles[idx] = handle;
                Ok(pid)
            }
            StartupWait::Exited(status) => {
                handle.kill_and_clean().await;
                Err(PitbossError::SpawnFailed {
                    service: service.to_string(),
                    reason: format!("exited during restart: {status}"),
                })
            }
            StartupWait::TimedOut => {
                handle.kill_and_clean().await;
                Err(PitbossError::StartupTimeout {
                    service: service.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            StartupWait::Cancelled => {
                // Not in the session yet, so teardown will not reach it
                handle.kill_and_clean().await;
                Err(PitbossError::Interrupted)
            }
        }
    }

    /// First-success startup wait: no hysteresis, one good probe is enough.
    /// Watches for the child dying and for shutdown the whole time.
    async fn await_service_healthy(
        &self,
        handle: &mut ProcessHandle,
        target: &HealthTarget,
        timeout: Duration,
        shutdown: &mut ShutdownToken,
    ) -> StartupWait {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if shutdown.is_shutdown() {
                return StartupWait::Cancelled;
            }
            if let Some(status) = handle.try_exit_status() {
                return StartupWait::Exited(status);
            }
            if self.monitor.probe_once(target).await {
                return StartupWait::Healthy;
            }
            if tokio::time::Instant::now() >= deadline {
                return StartupWait::TimedOut;
            }
            tokio::select! {
                biased;
                _ = shutdown.wait() => return StartupWait::Cancelled,
                _ = tokio::time::sleep(STARTUP_POLL_INTERVAL) => {}
            }
        }
    }

    /// Bounded wait for a declared port to be bindable before spawning
    async fn wait_port_free(&self, service: &str, port: u16) -> Result<()> {
        let budget = Duration::from_secs(self.pipeline_config.port_wait_secs);
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if port_free(port) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PitbossError::SpawnFailed {
                    service: service.to_string(),
                    reason: format!("port {port} still in use after {}s", budget.as_secs()),
                });
            }
            debug!(service = %service, port = port, "waiting for port to free up");
            tokio::time::sleep(PORT_WAIT_POLL).await;
        }
    }

    fn can_restart(&mut self, service: &str) -> bool {
        let window =
            chrono::Duration::seconds(self.monitor_config.service_restart_window_secs as i64);
        let cutoff = Utc::now() - window;
        let log = self.restart_log.entry(service.to_string()).or_default();
        log.retain(|t| *t > cutoff);
        (log.len() as u32) < self.monitor_config.max_service_restarts
    }

    /// Record one restart; returns the attempt number within the window
    fn note_restart(&mut self, service: &str) -> u32 {
        let log = self.restart_log.entry(service.to_string()).or_default();
        log.push(Utc::now());
        log.len() as u32
    }

    fn spec(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
