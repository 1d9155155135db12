//! Risk Simulation Gate
//!
//! Runs the Monte-Carlo/resampling job over the backtest's trade log and
//! holds the tail-risk metrics (5th-percentile return, probability of
//! profit, worst-case drawdown) against their thresholds. Same fail-closed
//! rules as the performance gate; a missing tail metric blocks startup.

use std::time::Duration;
use tracing::{error, info, warn};

use super::{evaluate, run_gate_job, GateResult, JobError};
use crate::config::GateConfig;
use crate::coordination::shutdown::ShutdownToken;
use crate::error::{PitbossError, Result};
use crate::gates::ReportWriter;

pub struct RiskSimulationGate {
    config: GateConfig,
}

impl RiskSimulationGate {
    pub const NAME: &'static str = "risk_simulation";

    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Run the simulation job against the trade log and evaluate tail risk.
    pub async fn run(
        &self,
        writer: &ReportWriter,
        shutdown: &mut ShutdownToken,
    ) -> Result<GateResult> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match run_gate_job(
            Self::NAME,
            &self.config.command,
            &self.config.args,
            timeout,
            shutdown,
        )
        .await
        {
            Ok(metrics) => {
                let result = evaluate(Self::NAME, &self.config.thresholds, &metrics);
                writer.write_gate_report(&result)?;
                if result.is_pass() {
                    info!(
                        gate = Self::NAME,
                        metrics = result.metrics.len(),
                        "risk simulation gate passed"
                    );
                } else {
                    warn!(
                        gate = Self::NAME,
                        violations = %result.violation_summary(),
                        "risk simulation gate failed"
                    );
                }
                Ok(result)
            }
            Err(JobError::Cancelled) => Err(PitbossError::Interrupted),
            Err(job_err) => {
                error!(gate = Self::NAME, reason = %job_err, "simulation job did not produce a usable report");
                let result = GateResult::from_job_error(Self::NAME, &job_err);
                writer.write_gate_report(&result)?;
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::shutdown::ShutdownCoordinator;
    use crate::gates::{Comparator, Threshold, Verdict};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn thresholds() -> BTreeMap<String, Threshold> {
        let mut map = BTreeMap::new();
        map.insert(
            "p05_return".to_string(),
            Threshold {
                op: Comparator::Gte,
                limit: dec!(-0.05),
            },
        );
        map.insert(
            "probability_of_profit".to_string(),
            Threshold {
                op: Comparator::Gte,
                limit: dec!(0.60),
            },
        );
        map
    }

    #[tokio::test]
    async fn test_tail_metrics_within_bounds_pass() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let coordinator = ShutdownCoordinator::with_defaults();
        let mut token = coordinator.subscribe();

        let gate = RiskSimulationGate::new(GateConfig {
            enabled: true,
            command: "echo".to_string(),
            args: vec![r#"{"p05_return": -0.02, "probability_of_profit": 0.71}"#.to_string()],
            timeout_secs: 10,
            thresholds: thresholds(),
        });
        let result = gate.run(&writer, &mut token).await.unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_missing_tail_metric_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let coordinator = ShutdownCoordinator::with_defaults();
        let mut token = coordinator.subscribe();

        // Simulation forgot probability_of_profit entirely
        let gate = RiskSimulationGate::new(GateConfig {
            enabled: true,
            command: "echo".to_string(),
            args: vec![r#"{"p05_return": -0.01}"#.to_string()],
            timeout_secs: 10,
            thresholds: thresholds(),
        });
        let result = gate.run(&writer, &mut token).await.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert!(result
            .violations
            .iter()
            .any(|v| v.metric == "probability_of_profit" && v.actual.is_none()));
    }

    #[tokio::test]
    async fn test_timeout_is_a_job_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let coordinator = ShutdownCoordinator::with_defaults();
        let mut token = coordinator.subscribe();

        let gate = RiskSimulationGate::new(GateConfig {
            enabled: true,
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            timeout_secs: 1,
            thresholds: thresholds(),
        });
        let result = gate.run(&writer, &mut token).await.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        let reason = result.job_error.expect("job error should be recorded");
        assert!(reason.contains("timed out"));
    }
}
