//! Coordination Layer
//!
//! Cross-cutting run control:
//! - Shutdown coordination (single cancellation fan-out, reverse-order teardown)
//! - Bounded session restart policy for continuous mode

pub mod restart;
pub mod shutdown;

pub use restart::RestartPolicy;
pub use shutdown::{
    install_signal_handlers, SessionSummary, ShutdownCause, ShutdownConfig, ShutdownCoordinator,
    ShutdownToken,
};
