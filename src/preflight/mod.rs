//! Preflight Validation
//!
//! The two fail-fast checks that run before any gate or service:
//! - Dependency validation (tools, packages, ports, directories)
//! - Environment validation (credentials, safe-mode override)

pub mod deps;
pub mod environment;

pub use deps::{CheckStatus, DependencyReport, DependencyValidator};
pub use environment::{EnvironmentReport, EnvironmentValidator};
