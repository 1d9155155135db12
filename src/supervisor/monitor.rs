//! Health Monitoring
//!
//! One poller task per running service, reporting raw observations over a
//! channel. Pollers never touch service state: the supervisor owns the
//! handle table and applies hysteresis to what the pollers saw. Each poll
//! carries its own short timeout, independent of any startup budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::spec::HealthTarget;
use crate::config::MonitorConfig;
use crate::coordination::shutdown::ShutdownToken;

/// Raw outcome of one poll, as sent to the supervisor
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub service: String,
    pub healthy: bool,
    pub observed_at: DateTime<Utc>,
}

/// Probe transport; swapped for a scripted fake in tests
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &HealthTarget, timeout: Duration) -> bool;
}

/// Real HTTP/TCP probing
pub struct NetworkProbe {
    client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn probe(&self, target: &HealthTarget, timeout: Duration) -> bool {
        match target {
            HealthTarget::Http { url } => {
                match self.client.get(url).timeout(timeout).send().await {
                    Ok(resp) => {
                        let ok = resp.status().is_success();
                        if !ok {
                            debug!(url = %url, status = %resp.status(), "health endpoint not ready");
                        }
                        ok
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "health probe failed");
                        false
                    }
                }
            }
            HealthTarget::Tcp { addr } => {
                match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        debug!(addr = %addr, error = %e, "tcp health probe refused");
                        false
                    }
                    Err(_) => {
                        debug!(addr = %addr, "tcp health probe timed out");
                        false
                    }
                }
            }
        }
    }
}

/// Spawns pollers and performs one-off probes for the supervisor
pub struct HealthMonitor {
    config: MonitorConfig,
    probe: Arc<dyn HealthProbe>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            probe: Arc::new(NetworkProbe::new()),
        }
    }

    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self { config, probe }
    }

    /// Single probe with the per-poll timeout; used by startup waits
    pub async fn probe_once(&self, target: &HealthTarget) -> bool {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        self.probe.probe(target, timeout).await
    }

    /// Start the continuous poll loop for one service. The task ends when
    /// shutdown is requested or the supervisor drops its receiver.
    pub fn spawn_poller(
        &self,
        service: String,
        target: HealthTarget,
        report_tx: mpsc::Sender<HealthReport>,
        mut shutdown: ShutdownToken,
    ) -> JoinHandle<()> {
        let probe = self.probe.clone();
        let interval_period = Duration::from_secs(self.config.poll_interval_secs);
        let probe_timeout = Duration::from_secs(self.config.probe_timeout_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {
                        let healthy = probe.probe(&target, probe_timeout).await;
                        let report = HealthReport {
                            service: service.clone(),
                            healthy,
                            observed_at: Utc::now(),
                        };
                        if report_tx.send(report).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(service = %service, "health poller stopped");
        })
    }
}

/// State flips the supervisor acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    WentUnhealthy,
    Recovered,
}

/// Consecutive-observation hysteresis. A single bad (or good) poll never
/// flips the reported state; `threshold` identical observations in a row do.
#[derive(Debug)]
pub struct HysteresisTracker {
    threshold: u32,
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl HysteresisTracker {
    /// Trackers begin healthy: a service only enters continuous monitoring
    /// after its startup probe succeeded.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn observe(&mut self, ok: bool) -> Option<HealthTransition> {
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if !self.healthy && self.consecutive_successes >= self.threshold {
                self.healthy = true;
                self.consecutive_successes = 0;
                return Some(HealthTransition::Recovered);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.healthy && self.consecutive_failures >= self.threshold {
                self.healthy = false;
                self.consecutive_failures = 0;
                return Some(HealthTransition::WentUnhealthy);
            }
        }
        None
    }
}

/// Scripted probe for tests: canned answers per target, then a fallback.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    pub struct ScriptedProbe {
        scripts: Mutex<HashMap<String, VecDeque<bool>>>,
        fallback: bool,
    }

    impl ScriptedProbe {
        pub fn new(fallback: bool) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                fallback,
            }
        }

        pub fn script(&self, target: &HealthTarget, outcomes: &[bool]) {
            self.scripts
                .lock()
                .unwrap()
                .entry(target.to_string())
                .or_default()
                .extend(outcomes.iter().copied());
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, target: &HealthTarget, _timeout: Duration) -> bool {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .get_mut(&target.to_string())
                .and_then(|q| q.pop_front())
                .unwrap_or(self.fallback)
        }
    }
}
