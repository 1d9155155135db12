pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod gates;
pub mod pipeline;
pub mod preflight;
pub mod supervisor;

pub use cli::{Cli, RunMode};
pub use config::AppConfig;
pub use coordination::{
    RestartPolicy, SessionSummary, ShutdownCause, ShutdownConfig, ShutdownCoordinator,
    ShutdownToken,
};
pub use error::{PitbossError, Result};
pub use gates::{
    evaluate, Comparator, GateResult, MetricsMap, PerformanceGate, ReportWriter,
    RiskSimulationGate, Threshold, Verdict, Violation,
};
pub use pipeline::{Pipeline, PipelineOptions};
pub use preflight::{DependencyValidator, EnvironmentValidator};
pub use supervisor::{
    startup_order, validate_specs, HealthMonitor, HealthTarget, ProcessHandle, RunEnd,
    ServiceSpec, ServiceState, ServiceSupervisor, SupervisionSession, SupervisorEvent,
};
