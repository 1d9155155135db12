//! Command Line Interface

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(name = "pitboss")]
#[command(version = "0.1.0")]
#[command(about = "Validation-gated process orchestrator and health supervisor", long_about = None)]
pub struct Cli {
    /// Pipeline mode
    #[arg(short, long, value_enum, default_value_t = RunMode::Full)]
    pub mode: RunMode,

    /// Config directory (default.toml plus an optional per-env file)
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Override every service's startup timeout, in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Skip the historical performance gate
    #[arg(long)]
    pub skip_performance_gate: bool,

    /// Skip the risk simulation gate
    #[arg(long)]
    pub skip_risk_gate: bool,

    /// Do not start satellite services (dashboards and other extras)
    #[arg(long)]
    pub no_satellites: bool,

    /// Override the session restart budget for continuous mode
    #[arg(long)]
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Validate, run both gates, start services, supervise until stopped
    Full,
    /// Validate and run the gates; never start services
    GateOnly,
    /// Skip the gates: validate, start services, supervise
    ServicesOnly,
    /// Full cycle wrapped in the bounded session restart loop
    Continuous,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::GateOnly => write!(f, "gate-only"),
            RunMode::ServicesOnly => write!(f, "services-only"),
            RunMode::Continuous => write!(f, "continuous"),
        }
    }
}
