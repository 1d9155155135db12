use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum PitbossError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Preflight errors
    #[error("Dependency check failed ({failed} of {total} required): {details}")]
    Dependency {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("Environment validation failed ({count} problem(s)): {details}")]
    Environment { count: usize, details: String },

    // Gate errors
    #[error("Gate '{gate}' could not run: {reason}")]
    GateJob { gate: String, reason: String },

    #[error("Gate '{gate}' rejected the run: {violations}")]
    GateFailed { gate: String, violations: String },

    // Service graph errors
    #[error("Invalid service graph: {0}")]
    ServiceGraph(String),

    // Supervision errors
    #[error("Service '{service}' failed to spawn: {reason}")]
    SpawnFailed { service: String, reason: String },

    #[error("Service '{service}' did not become healthy within {timeout_secs}s")]
    StartupTimeout { service: String, timeout_secs: u64 },

    #[error("Service '{service}' degraded at runtime: {reason}")]
    RuntimeDegradation { service: String, reason: String },

    #[error("Restart budget exhausted after {attempts} attempt(s)")]
    RestartsExhausted { attempts: u32 },

    #[error("Interrupted by shutdown signal")]
    Interrupted,

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PitbossError {
    /// Stable process exit code per failure class, so calling scripts and CI
    /// can branch on what went wrong.
    pub fn exit_code(&self) -> i32 {
        match self {
            PitbossError::Dependency { .. } => 10,
            PitbossError::Config(_)
            | PitbossError::InvalidConfig(_)
            | PitbossError::Environment { .. }
            | PitbossError::ServiceGraph(_) => 11,
            PitbossError::GateFailed { .. } => 12,
            PitbossError::GateJob { .. } => 13,
            PitbossError::SpawnFailed { .. } | PitbossError::StartupTimeout { .. } => 14,
            PitbossError::RuntimeDegradation { .. } | PitbossError::RestartsExhausted { .. } => 15,
            PitbossError::Interrupted => 16,
            _ => 1,
        }
    }
}

/// Result type alias for PitbossError
pub type Result<T> = std::result::Result<T, PitbossError>;

/// Specific error types for service graph validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate service name: {name}")]
    DuplicateName { name: String },

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("service '{service}' depends on itself")]
    SelfDependency { service: String },

    #[error("dependency cycle involving: {services}")]
    Cycle { services: String },

    #[error("service '{service}' depends on satellite '{dependency}'")]
    SatelliteDependency { service: String, dependency: String },
}

impl From<GraphError> for PitbossError {
    fn from(err: GraphError) -> Self {
        PitbossError::ServiceGraph(err.to_string())
    }
}
