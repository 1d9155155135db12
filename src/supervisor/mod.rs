//! Service Supervision Layer
//!
//! Everything that owns and watches managed processes:
//! - Service specs and the startup DAG
//! - Process handles (spawn, signal, PID bookkeeping)
//! - Health monitoring with hysteresis
//! - The supervisor itself (ordered startup, continuous loop, in-place restarts)

pub mod manager;
pub mod monitor;
pub mod process;
pub mod spec;

pub use manager::{RunEnd, ServiceSupervisor, SupervisionSession, SupervisorEvent};
pub use monitor::{HealthMonitor, HealthReport, HysteresisTracker};
pub use process::{pid_alive, ProcessHandle, ServiceState, StopOutcome};
pub use spec::{startup_order, validate_specs, HealthTarget, ServiceSpec};
