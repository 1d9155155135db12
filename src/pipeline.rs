//! Pipeline Orchestration
//!
//! Sequences one run of the system: dependency and environment validation,
//! then the performance and risk gates, then dependency-ordered service
//! startup and continuous supervision. Gates run strictly one after
//! another; services start only if both gates pass. Continuous mode wraps
//! the whole cycle in the bounded session restart loop.
//!
//! Exit semantics: a signal while the system is up and healthy is a clean
//! stop; a signal during validation, gates, or startup aborts the run with
//! the interrupted error instead.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cli::{Cli, RunMode};
use crate::config::AppConfig;
use crate::coordination::restart::RestartPolicy;
use crate::coordination::shutdown::{ShutdownCause, ShutdownCoordinator, ShutdownToken};
use crate::error::{PitbossError, Result};
use crate::gates::{PerformanceGate, ReportWriter, RiskSimulationGate};
use crate::preflight::{DependencyValidator, EnvironmentValidator};
use crate::supervisor::manager::{RunEnd, ServiceSupervisor, SupervisionSession};
use crate::supervisor::monitor::HealthMonitor;

/// CLI-level choices that shape a run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub mode: RunMode,
    pub skip_performance_gate: bool,
    pub skip_risk_gate: bool,
    pub include_satellites: bool,
    pub startup_timeout_override_secs: Option<u64>,
    pub max_restarts_override: Option<u32>,
}

impl PipelineOptions {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            mode: cli.mode,
            skip_performance_gate: cli.skip_performance_gate,
            skip_risk_gate: cli.skip_risk_gate,
            include_satellites: !cli.no_satellites,
            startup_timeout_override_secs: cli.timeout,
            max_restarts_override: cli.max_restarts,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            skip_performance_gate: false,
            skip_risk_gate: false,
            include_satellites: true,
            startup_timeout_override_secs: None,
            max_restarts_override: None,
        }
    }
}

/// How one validate-gate-start-supervise cycle ended (continuous mode)
enum CycleEnd {
    /// Signal while the system was up; session torn down, done
    CleanStop,
    /// Signal before the system was up; run aborted
    Interrupted,
    /// Session failed in a way the restart loop may retry
    Retryable {
        error: PitbossError,
        healthy_stretch: std::time::Duration,
    },
}

pub struct Pipeline {
    config: AppConfig,
    options: PipelineOptions,
    coordinator: Arc<ShutdownCoordinator>,
    writer: ReportWriter,
}

impl Pipeline {
    pub fn new(mut config: AppConfig, options: PipelineOptions) -> Self {
        if options.skip_performance_gate {
            config.gates.performance.enabled = false;
        }
        if options.skip_risk_gate {
            config.gates.risk_simulation.enabled = false;
        }
        if let Some(max) = options.max_restarts_override {
            config.restart.max_restarts = max;
        }

        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown.clone()));
        let writer = ReportWriter::new(config.paths.reports_dir.clone());
        Self {
            config,
            options,
            coordinator,
            writer,
        }
    }

    /// For installing signal handlers and for tests that drive shutdown
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        self.coordinator.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(mode = %self.options.mode, "pipeline starting");
        let outcome = match self.options.mode {
            RunMode::Full => self.run_full().await,
            RunMode::GateOnly => self.run_gate_only().await,
            RunMode::ServicesOnly => self.run_services_only().await,
            RunMode::Continuous => self.run_continuous().await,
        };

        // The fan-out fires exactly once whatever ends the run; requesting
        // again after a signal is a no-op
        match &outcome {
            Ok(()) => {
                self.coordinator.request(ShutdownCause::Complete);
                info!(mode = %self.options.mode, "pipeline finished");
            }
            Err(PitbossError::Interrupted) => {}
            Err(e) => {
                self.coordinator.request(ShutdownCause::Fatal);
                error!(error = %e, exit_code = e.exit_code(), "pipeline failed");
            }
        }
        outcome
    }

    async fn run_full(&mut self) -> Result<()> {
        self.run_validation().await?;
        let mut token = self.coordinator.subscribe();
        self.run_gates(&mut token).await?;
        self.run_session_once().await
    }

    async fn run_gate_only(&mut self) -> Result<()> {
        self.run_validation().await?;
        let mut token = self.coordinator.subscribe();
        self.run_gates(&mut token).await?;
        info!("all gates passed; services untouched in gate-only mode");
        Ok(())
    }

    async fn run_services_only(&mut self) -> Result<()> {
        self.run_validation().await?;
        info!("gates skipped in services-only mode");
        self.run_session_once().await
    }

    /// Dependency checks then environment checks; both fail fast with every
    /// violation itemized, never just the first.
    async fn run_validation(&self) -> Result<()> {
        let service_ports: Vec<(String, u16)> = self
            .config
            .services
            .iter()
            .filter_map(|s| s.port.map(|p| (s.name.clone(), p)))
            .collect();

        let deps = DependencyValidator::new(
            self.config.dependencies.clone(),
            self.config.paths.run_dir.clone(),
            service_ports,
        );
        deps.validate_all().await.into_result()?;

        let env = EnvironmentValidator::new(self.config.environment.clone());
        env.validate_all().into_result()?;
        Ok(())
    }

    /// Performance gate then risk gate, strictly sequential. Either gate
    /// failing (thresholds or job error) blocks startup.
    async fn run_gates(&self, token: &mut ShutdownToken) -> Result<()> {
        if self.config.gates.performance.enabled {
            let gate = PerformanceGate::new(self.config.gates.performance.clone());
            let result = gate.run(&self.writer, token).await?;
            if !result.is_pass() {
                return Err(result.into_error());
            }
        } else {
            info!(gate = PerformanceGate::NAME, "gate disabled, skipping");
        }

        if self.config.gates.risk_simulation.enabled {
            let gate = RiskSimulationGate::new(self.config.gates.risk_simulation.clone());
            let result = gate.run(&self.writer, token).await?;
            if !result.is_pass() {
                return Err(result.into_error());
            }
        } else {
            info!(gate = RiskSimulationGate::NAME, "gate disabled, skipping");
        }
        Ok(())
    }

    fn new_supervisor(&self) -> ServiceSupervisor {
        ServiceSupervisor::new(
            self.config.monitor.clone(),
            self.config.pipeline.clone(),
            self.config.paths.clone(),
            self.config.services.clone(),
            HealthMonitor::new(self.config.monitor.clone()),
        )
    }

    /// One session with no restart loop (full and services-only modes)
    async fn run_session_once(&mut self) -> Result<()> {
        let mut supervisor = self.new_supervisor();
        let mut token = self.coordinator.subscribe();
        let mut session = SupervisionSession::new();

        if let Err(e) = supervisor
            .start_all(
                &mut session,
                self.options.include_satellites,
                self.options.startup_timeout_override_secs,
                &mut token,
            )
            .await
        {
            self.abort_startup(&mut session, &e).await;
            return Err(e);
        }

        match supervisor.run(&mut session, &mut token).await? {
            RunEnd::ShutdownRequested(cause) => {
                self.coordinator
                    .shutdown_session(&mut session, &cause.to_string(), Some(&self.writer))
                    .await;
                match cause {
                    ShutdownCause::Signal | ShutdownCause::Complete => Ok(()),
                    ShutdownCause::Fatal => Err(PitbossError::Internal(
                        "shutdown coordinator lost during supervision".to_string(),
                    )),
                }
            }
            RunEnd::Degraded {
                service, reason, ..
            } => {
                self.coordinator
                    .shutdown_session(&mut session, "runtime degradation", Some(&self.writer))
                    .await;
                Err(PitbossError::RuntimeDegradation { service, reason })
            }
        }
    }

    /// Startup failed partway. A signal always tears down what started; a
    /// plain failure rolls back only when configured to, otherwise the
    /// healthy predecessors stay up for inspection.
    async fn abort_startup(&self, session: &mut SupervisionSession, err: &PitbossError) {
        if matches!(err, PitbossError::Interrupted) {
            self.coordinator
                .shutdown_session(session, "signal during startup", Some(&self.writer))
                .await;
            return;
        }

        if self.config.pipeline.rollback_on_startup_failure {
            warn!("rolling back partially started session");
            self.coordinator
                .shutdown_session(session, "startup failure rollback", Some(&self.writer))
                .await;
        } else {
            warn!(
                still_running = session.healthy_count(),
                states = ?session.states(),
                "leaving already-started services running for inspection"
            );
            // Stops this session's pollers; the services themselves stay up
            session.mark_torn_down();
        }
    }

    /// The bounded restart loop: each attempt reruns the entire
    /// validate-gate-start-supervise cycle, strictly sequentially.
    async fn run_continuous(&mut self) -> Result<()> {
        let mut policy = RestartPolicy::new(self.config.restart.clone());
        let mut token = self.coordinator.subscribe();
        // One supervisor across attempts so per-service restart windows persist
        let mut supervisor = self.new_supervisor();

        loop {
            match self.run_cycle(&mut supervisor, &mut token).await? {
                CycleEnd::CleanStop => return Ok(()),
                CycleEnd::Interrupted => return Err(PitbossError::Interrupted),
                CycleEnd::Retryable {
                    error,
                    healthy_stretch,
                } => {
                    policy.note_sustained_healthy(healthy_stretch);
                    if !policy.can_attempt() {
                        error!(
                            attempts = policy.attempts(),
                            max = policy.max_restarts(),
                            last_error = %error,
                            "session restart budget exhausted, giving up"
                        );
                        return Err(policy.give_up());
                    }
                    let attempt = policy.next_attempt();
                    warn!(
                        attempt = attempt,
                        max = policy.max_restarts(),
                        error = %error,
                        backoff_secs = policy.backoff().as_secs(),
                        "session failed, restarting after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = token.wait() => return Err(PitbossError::Interrupted),
                        _ = tokio::time::sleep(policy.backoff()) => {}
                    }
                }
            }
        }
    }

    /// One full cycle for continuous mode. Dependency, environment, and
    /// config problems stay fatal (`Err`); gate and session failures come
    /// back as retryable. Unlike one-shot modes, a failed cycle always
    /// tears its session down so the next attempt starts clean.
    async fn run_cycle(
        &mut self,
        supervisor: &mut ServiceSupervisor,
        token: &mut ShutdownToken,
    ) -> Result<CycleEnd> {
        self.run_validation().await?;
        if token.is_shutdown() {
            return Ok(CycleEnd::Interrupted);
        }

        match self.run_gates(token).await {
            Ok(()) => {}
            Err(PitbossError::Interrupted) => return Ok(CycleEnd::Interrupted),
            Err(e @ (PitbossError::GateFailed { .. } | PitbossError::GateJob { .. })) => {
                return Ok(CycleEnd::Retryable {
                    error: e,
                    healthy_stretch: std::time::Duration::ZERO,
                });
            }
            Err(e) => return Err(e),
        }

        let mut session = SupervisionSession::new();
        match supervisor
            .start_all(
                &mut session,
                self.options.include_satellites,
                self.options.startup_timeout_override_secs,
                token,
            )
            .await
        {
            Ok(()) => {}
            Err(PitbossError::Interrupted) => {
                self.coordinator
                    .shutdown_session(&mut session, "signal during startup", Some(&self.writer))
                    .await;
                return Ok(CycleEnd::Interrupted);
            }
            Err(e) => {
                self.coordinator
                    .shutdown_session(&mut session, "startup failure", Some(&self.writer))
                    .await;
                return Ok(CycleEnd::Retryable {
                    error: e,
                    healthy_stretch: std::time::Duration::ZERO,
                });
            }
        }

        match supervisor.run(&mut session, token).await? {
            RunEnd::ShutdownRequested(cause) => {
                self.coordinator
                    .shutdown_session(&mut session, &cause.to_string(), Some(&self.writer))
                    .await;
                match cause {
                    ShutdownCause::Signal | ShutdownCause::Complete => Ok(CycleEnd::CleanStop),
                    ShutdownCause::Fatal => Err(PitbossError::Internal(
                        "shutdown coordinator lost during supervision".to_string(),
                    )),
                }
            }
            RunEnd::Degraded {
                service,
                reason,
                longest_healthy_stretch,
            } => {
                self.coordinator
                    .shutdown_session(&mut session, "runtime degradation", Some(&self.writer))
                    .await;
                Ok(CycleEnd::Retryable {
                    error: PitbossError::RuntimeDegradation { service, reason },
                    healthy_stretch: longest_healthy_stretch,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DependencyConfig, EnvironmentConfig, GateConfig, GatesConfig, LoggingConfig,
        MonitorConfig, PathsConfig, PipelineConfig, RestartConfig,
    };
    use crate::coordination::shutdown::ShutdownConfig;
    use crate::gates::{Comparator, Threshold};
    use crate::supervisor::spec::{HealthTarget, ServiceSpec};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn passing_gate(json: &str, metric: &str, limit: rust_decimal::Decimal) -> GateConfig {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            metric.to_string(),
            Threshold {
                op: Comparator::Gte,
                limit,
            },
        );
        GateConfig {
            enabled: true,
            command: "echo".to_string(),
            args: vec![json.to_string()],
            timeout_secs: 10,
            thresholds,
        }
    }

    fn test_config(dir: &std::path::Path, mode_key: &str) -> AppConfig {
        AppConfig {
            pipeline: PipelineConfig {
                rollback_on_startup_failure: false,
                port_wait_secs: 1,
            },
            monitor: MonitorConfig {
                poll_interval_secs: 1,
                probe_timeout_secs: 1,
                hysteresis: 3,
                unhealthy_grace_secs: 60,
                max_service_restarts: 0,
                service_restart_window_secs: 300,
                default_startup_timeout_secs: 5,
            },
            restart: RestartConfig {
                max_restarts: 1,
                backoff_secs: 0,
                reset_after_healthy_secs: 600,
            },
            shutdown: ShutdownConfig {
                term_grace_secs: 5,
                kill_wait_secs: 5,
            },
            paths: PathsConfig {
                run_dir: dir.join("run"),
                log_dir: dir.join("logs"),
                reports_dir: dir.join("reports"),
            },
            gates: GatesConfig {
                performance: passing_gate(r#"{"win_rate": 0.55}"#, "win_rate", dec!(0.30)),
                risk_simulation: passing_gate(
                    r#"{"p05_return": 0.01}"#,
                    "p05_return",
                    dec!(-0.05),
                ),
            },
            environment: EnvironmentConfig {
                required: Vec::new(),
                mode_key: mode_key.to_string(),
                safe_mode: "paper".to_string(),
            },
            dependencies: DependencyConfig::default(),
            services: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    fn tcp_service(name: &str, addr: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            port: None,
            health: HealthTarget::Tcp {
                addr: addr.to_string(),
            },
            startup_timeout_secs: None,
            depends_on: vec![],
            satellite: false,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_gate_only_passes_and_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "PB_TEST_MODE_GATEONLY");
        let options = PipelineOptions {
            mode: RunMode::GateOnly,
            ..PipelineOptions::default()
        };

        let mut pipeline = Pipeline::new(config, options);
        pipeline.run().await.unwrap();

        // Both gate reports written, no pid files anywhere
        let reports: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(reports.iter().any(|n| n.starts_with("performance_")));
        assert!(reports.iter().any(|n| n.starts_with("risk_simulation_")));
        let pids = std::fs::read_dir(dir.path().join("run"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(pids, 0);
    }

    #[tokio::test]
    async fn test_failing_performance_gate_blocks_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), "PB_TEST_MODE_GATEFAIL");
        config.gates.performance =
            passing_gate(r#"{"win_rate": 0.28}"#, "win_rate", dec!(0.30));

        let mut pipeline = Pipeline::new(
            config,
            PipelineOptions {
                mode: RunMode::GateOnly,
                ..PipelineOptions::default()
            },
        );
        let err = pipeline.run().await.unwrap_err();
        match err {
            PitbossError::GateFailed { ref gate, ref violations } => {
                assert_eq!(gate, "performance");
                assert!(violations.contains("win_rate"));
                assert!(violations.contains("0.28"));
            }
            other => panic!("expected GateFailed, got {other}"),
        }
        assert_eq!(err.exit_code(), 12);
    }

    #[tokio::test]
    async fn test_skip_flags_disable_gates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), "PB_TEST_MODE_SKIP");
        // Would fail if actually run
        config.gates.performance = passing_gate(r#"{"win_rate": 0.0}"#, "win_rate", dec!(0.99));
        config.gates.risk_simulation =
            passing_gate(r#"{"p05_return": -9.0}"#, "p05_return", dec!(0.0));

        let mut pipeline = Pipeline::new(
            config,
            PipelineOptions {
                mode: RunMode::GateOnly,
                skip_performance_gate: true,
                skip_risk_gate: true,
                ..PipelineOptions::default()
            },
        );
        pipeline.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_services_only_clean_stop_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        // A real listener makes the health target genuinely reachable
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut config = test_config(dir.path(), "PB_TEST_MODE_SVCONLY");
        config.services = vec![tcp_service("market-data", &addr)];

        let mut pipeline = Pipeline::new(
            config,
            PipelineOptions {
                mode: RunMode::ServicesOnly,
                ..PipelineOptions::default()
            },
        );
        let coordinator = pipeline.coordinator();
        tokio::spawn(async move {
            // Past startup and into steady-state supervision by then
            tokio::time::sleep(Duration::from_secs(2)).await;
            coordinator.request(ShutdownCause::Signal);
        });

        tokio::time::timeout(Duration::from_secs(15), pipeline.run())
            .await
            .expect("pipeline should stop after the signal")
            .unwrap();

        // Confirmed stop removed the pid file
        assert!(!dir.path().join("run").join("market-data.pid").exists());
        // Session summary persisted
        let summaries = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("session_"))
            .count();
        assert_eq!(summaries, 1);
    }

    #[tokio::test]
    async fn test_signal_during_startup_exits_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        // Dead target: startup keeps polling until signalled
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = test_config(dir.path(), "PB_TEST_MODE_MIDSTART");
        config.services = vec![tcp_service("market-data", &addr)];
        config.monitor.default_startup_timeout_secs = 30;

        let mut pipeline = Pipeline::new(
            config,
            PipelineOptions {
                mode: RunMode::ServicesOnly,
                ..PipelineOptions::default()
            },
        );
        let coordinator = pipeline.coordinator();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            coordinator.request(ShutdownCause::Signal);
        });

        let err = tokio::time::timeout(Duration::from_secs(15), pipeline.run())
            .await
            .expect("pipeline should abort after the signal")
            .unwrap_err();
        assert!(matches!(err, PitbossError::Interrupted));
        assert_eq!(err.exit_code(), 16);
        // The starting service was torn down, not orphaned
        assert!(!dir.path().join("run").join("market-data.pid").exists());
    }

    #[tokio::test]
    async fn test_continuous_mode_exhausts_restart_budget() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut config = test_config(dir.path(), "PB_TEST_MODE_CONT");
        // Service dies after a second; in-place budget is zero, session
        // budget is one, so: degrade, restart session, degrade, give up
        config.services = vec![ServiceSpec {
            command: "sleep".to_string(),
            args: vec!["1".to_string()],
            ..tcp_service("flaky", &addr)
        }];
        config.gates.performance.enabled = false;
        config.gates.risk_simulation.enabled = false;

        let mut pipeline = Pipeline::new(
            config,
            PipelineOptions {
                mode: RunMode::Continuous,
                ..PipelineOptions::default()
            },
        );
        let err = tokio::time::timeout(Duration::from_secs(30), pipeline.run())
            .await
            .expect("continuous mode should give up in time")
            .unwrap_err();
        match err {
            PitbossError::RestartsExhausted { attempts } => assert_eq!(attempts, 1),
            other => panic!("expected RestartsExhausted, got {other}"),
        }
        assert_eq!(err.exit_code(), 15);
    }
}
