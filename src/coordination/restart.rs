//! Session Restart Policy
//!
//! Explicit bounded counter for full-session restarts in continuous mode.
//! The pipeline's restart loop is the only mutator. Spending the budget
//! puts the policy into a terminal gave-up state; a sustained all-healthy
//! stretch earns the counter back to zero.

use std::time::Duration;
use tracing::{info, warn};

use crate::config::RestartConfig;
use crate::error::PitbossError;

#[derive(Debug)]
pub struct RestartPolicy {
    config: RestartConfig,
    attempts: u32,
    gave_up: bool,
}

impl RestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            attempts: 0,
            gave_up: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_restarts(&self) -> u32 {
        self.config.max_restarts
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn can_attempt(&self) -> bool {
        !self.gave_up && self.attempts < self.config.max_restarts
    }

    /// Count the next restart attempt; 1-based. Callers must check
    /// `can_attempt` first.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempts += 1;
        warn!(
            attempt = self.attempts,
            max = self.config.max_restarts,
            "session restart"
        );
        self.attempts
    }

    /// Delay before the next attempt
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.config.backoff_secs)
    }

    /// A long enough all-healthy stretch earns a fresh budget
    pub fn note_sustained_healthy(&mut self, stretch: Duration) -> bool {
        let required = Duration::from_secs(self.config.reset_after_healthy_secs);
        if stretch >= required && self.attempts > 0 {
            info!(
                healthy_secs = stretch.as_secs(),
                "sustained healthy period, restart counter reset"
            );
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.gave_up = false;
    }

    /// Terminal: the loop stops retrying. Returns the error to propagate.
    pub fn give_up(&mut self) -> PitbossError {
        self.gave_up = true;
        PitbossError::RestartsExhausted {
            attempts: self.attempts,
        }
    }
}
