use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::coordination::shutdown::ShutdownConfig;
use crate::gates::Threshold;
use crate::supervisor::spec::{validate_specs, HealthTarget, ServiceSpec};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    pub gates: GatesConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    /// Managed services, one node each in the startup DAG
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    /// Stop already-healthy services when a later one fails to start.
    /// Off by default: predecessors stay up for operator inspection.
    #[serde(default)]
    pub rollback_on_startup_failure: bool,
    /// How long to wait for a declared port to free before giving up
    #[serde(default = "default_port_wait_secs")]
    pub port_wait_secs: u64,
}

fn default_port_wait_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between health polls for a running service
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Per-poll probe timeout, independent of the startup timeout
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive identical observations required to flip health state
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u32,
    /// Seconds a service may stay Unhealthy before escalating to Failed
    #[serde(default = "default_unhealthy_grace_secs")]
    pub unhealthy_grace_secs: u64,
    /// In-place restarts allowed per service within the rolling window
    #[serde(default = "default_max_service_restarts")]
    pub max_service_restarts: u32,
    /// Rolling window for the per-service restart count
    #[serde(default = "default_service_restart_window_secs")]
    pub service_restart_window_secs: u64,
    /// Startup timeout applied when a service does not declare its own
    #[serde(default = "default_startup_timeout_secs")]
    pub default_startup_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_hysteresis() -> u32 {
    3
}

fn default_unhealthy_grace_secs() -> u64 {
    30
}

fn default_max_service_restarts() -> u32 {
    2
}

fn default_service_restart_window_secs() -> u64 {
    300
}

fn default_startup_timeout_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            hysteresis: default_hysteresis(),
            unhealthy_grace_secs: default_unhealthy_grace_secs(),
            max_service_restarts: default_max_service_restarts(),
            service_restart_window_secs: default_service_restart_window_secs(),
            default_startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    /// Full-session restart attempts before the loop gives up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Base delay between session restart attempts
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Sustained-healthy period after which the attempt counter resets
    #[serde(default = "default_reset_after_healthy_secs")]
    pub reset_after_healthy_secs: u64,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_reset_after_healthy_secs() -> u64 {
    600
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            backoff_secs: default_backoff_secs(),
            reset_after_healthy_secs: default_reset_after_healthy_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// PID files, one per managed service
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Child stdout/stderr capture, one log per service
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Gate reports and session summaries
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/opt/pitboss/run")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/opt/pitboss/logs")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("/opt/pitboss/reports")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            log_dir: default_log_dir(),
            reports_dir: default_reports_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatesConfig {
    pub performance: GateConfig,
    pub risk_simulation: GateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Batch job executable
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard ceiling on job runtime; exceeding it is a job error
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// Metric name -> acceptance rule; every listed metric must appear
    /// in the job's output
    pub thresholds: BTreeMap<String, Threshold>,
}

fn default_true() -> bool {
    true
}

fn default_gate_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// Credential variables that must be present and well-formed
    #[serde(default)]
    pub required: Vec<CredentialRule>,
    /// Variable forced to `safe_mode` regardless of its incoming value
    #[serde(default = "default_mode_key")]
    pub mode_key: String,
    #[serde(default = "default_safe_mode")]
    pub safe_mode: String,
}

fn default_mode_key() -> String {
    "PITBOSS_TRADING_MODE".to_string()
}

fn default_safe_mode() -> String {
    "paper".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            mode_key: default_mode_key(),
            safe_mode: default_safe_mode(),
        }
    }
}

/// Shape requirements for one credential variable
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRule {
    pub key: String,
    #[serde(default)]
    pub min_len: usize,
    /// 0 = unbounded
    #[serde(default)]
    pub max_len: usize,
    #[serde(default)]
    pub alphanumeric: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DependencyConfig {
    /// Executables that must resolve on PATH
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub optional_commands: Vec<String>,
    /// Package probes, e.g. `python3 -c "import pandas"`
    #[serde(default)]
    pub packages: Vec<PackageProbe>,
    /// Ports that must be free beyond the services' own declared ports
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Created if absent
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageProbe {
    pub name: String,
    /// Command plus args; exit 0 means the package is usable
    pub probe: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PITBOSS_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PITBOSS_PATHS__RUN_DIR, etc.)
            .add_source(
                Environment::with_prefix("PITBOSS")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values, collecting every problem so operators
    /// can fix them in one pass
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.monitor.poll_interval_secs == 0 {
            errors.push("monitor.poll_interval_secs must be at least 1".to_string());
        }

        if self.monitor.probe_timeout_secs == 0 {
            errors.push("monitor.probe_timeout_secs must be at least 1".to_string());
        }

        if self.monitor.hysteresis == 0 {
            errors.push("monitor.hysteresis must be at least 1".to_string());
        }

        if self.monitor.unhealthy_grace_secs < self.monitor.poll_interval_secs {
            errors.push(format!(
                "monitor.unhealthy_grace_secs ({}) is shorter than one poll interval ({})",
                self.monitor.unhealthy_grace_secs, self.monitor.poll_interval_secs
            ));
        }

        if self.monitor.default_startup_timeout_secs == 0 {
            errors.push("monitor.default_startup_timeout_secs must be at least 1".to_string());
        }

        // A zero term grace is a legal "kill immediately" policy, but the
        // post-SIGKILL confirmation always needs some budget
        if self.shutdown.kill_wait_secs == 0 {
            errors.push("shutdown.kill_wait_secs must be at least 1".to_string());
        }

        for (name, gate) in [
            ("gates.performance", &self.gates.performance),
            ("gates.risk_simulation", &self.gates.risk_simulation),
        ] {
            if !gate.enabled {
                continue;
            }
            if gate.command.trim().is_empty() {
                errors.push(format!("{name}.command must not be empty"));
            }
            if gate.timeout_secs == 0 {
                errors.push(format!("{name}.timeout_secs must be at least 1"));
            }
            if gate.thresholds.is_empty() {
                errors.push(format!("{name}.thresholds must list at least one metric"));
            }
        }

        for rule in &self.environment.required {
            if rule.key.trim().is_empty() {
                errors.push("environment.required contains an empty key".to_string());
            }
            if rule.max_len > 0 && rule.max_len < rule.min_len {
                errors.push(format!(
                    "environment.required.{}: max_len ({}) below min_len ({})",
                    rule.key, rule.max_len, rule.min_len
                ));
            }
        }

        for probe in &self.dependencies.packages {
            if probe.probe.is_empty() {
                errors.push(format!(
                    "dependencies.packages.{}: probe command must not be empty",
                    probe.name
                ));
            }
        }

        for spec in &self.services {
            match &spec.health {
                HealthTarget::Http { url } => {
                    if url::Url::parse(url).is_err() {
                        errors.push(format!(
                            "services.{}: health url '{}' is not a valid URL",
                            spec.name, url
                        ));
                    }
                }
                HealthTarget::Tcp { addr } => {
                    // Hostnames are resolved at probe time; only the
                    // host:port shape is checked here
                    let well_formed = addr
                        .rsplit_once(':')
                        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                        .unwrap_or(false);
                    if !well_formed {
                        errors.push(format!(
                            "services.{}: health addr '{}' is not host:port",
                            spec.name, addr
                        ));
                    }
                }
            }
        }

        // Graph problems surface here too, so one validate pass reports
        // everything wrong with the file
        if let Err(graph_errors) = validate_specs(&self.services) {
            errors.extend(graph_errors.iter().map(|e| e.to_string()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::Comparator;
    use rust_decimal_macros::dec;

    fn gate_config() -> GateConfig {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            "sharpe_ratio".to_string(),
            Threshold {
                op: Comparator::Gte,
                limit: dec!(1.0),
            },
        );
        GateConfig {
            enabled: true,
            command: "backtest".to_string(),
            args: vec![],
            timeout_secs: 300,
            thresholds,
        }
    }

    fn base_config() -> AppConfig {
        AppConfig {
            pipeline: PipelineConfig::default(),
            monitor: MonitorConfig::default(),
            restart: RestartConfig::default(),
            shutdown: ShutdownConfig::default(),
            paths: PathsConfig::default(),
            gates: GatesConfig {
                performance: gate_config(),
                risk_simulation: gate_config(),
            },
            environment: EnvironmentConfig::default(),
            dependencies: DependencyConfig::default(),
            services: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn zero_hysteresis_is_rejected() {
        let mut cfg = base_config();
        cfg.monitor.hysteresis = 0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("hysteresis")));
    }

    #[test]
    fn enabled_gate_requires_thresholds() {
        let mut cfg = base_config();
        cfg.gates.performance.thresholds.clear();
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.contains("gates.performance.thresholds")));
    }

    #[test]
    fn disabled_gate_skips_checks() {
        let mut cfg = base_config();
        cfg.gates.performance.enabled = false;
        cfg.gates.performance.command = String::new();
        cfg.gates.performance.thresholds.clear();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn all_problems_reported_in_one_pass() {
        let mut cfg = base_config();
        cfg.monitor.hysteresis = 0;
        cfg.monitor.poll_interval_secs = 0;
        cfg.gates.risk_simulation.command = "  ".to_string();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.len() >= 3, "expected every violation, got {errors:?}");
    }

    #[test]
    fn malformed_health_targets_are_rejected() {
        let service = |name: &str, health: HealthTarget| ServiceSpec {
            name: name.to_string(),
            command: "/usr/local/bin/svc".to_string(),
            args: vec![],
            port: None,
            health,
            startup_timeout_secs: None,
            depends_on: vec![],
            satellite: false,
            env: BTreeMap::new(),
        };

        let mut cfg = base_config();
        cfg.services = vec![
            service(
                "bad-url",
                HealthTarget::Http {
                    url: "not a url".to_string(),
                },
            ),
            service(
                "bad-addr",
                HealthTarget::Tcp {
                    addr: "no-port-here".to_string(),
                },
            ),
            service(
                "good-addr",
                HealthTarget::Tcp {
                    addr: "localhost:6379".to_string(),
                },
            ),
        ];
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "got {errors:?}");
        assert!(errors.iter().any(|e| e.contains("bad-url")));
        assert!(errors.iter().any(|e| e.contains("bad-addr")));
    }
}
