//! Historical Performance Gate
//!
//! Runs the configured backtest job and holds its report against the
//! acceptance thresholds (minimum Sharpe ratio, minimum win rate, maximum
//! drawdown and whatever else the config lists). Startup is blocked unless
//! every listed metric is present and within bounds.

use std::time::Duration;
use tracing::{error, info, warn};

use super::{evaluate, run_gate_job, GateResult, JobError};
use crate::config::GateConfig;
use crate::coordination::shutdown::ShutdownToken;
use crate::error::{PitbossError, Result};
use crate::gates::ReportWriter;

pub struct PerformanceGate {
    config: GateConfig,
}

impl PerformanceGate {
    pub const NAME: &'static str = "performance";

    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Run the backtest job, evaluate its metrics, persist the report.
    ///
    /// Job-level failures still produce a persisted (failed) result so the
    /// audit trail shows *why* nothing started; only a shutdown request
    /// aborts without a report.
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
                        "performance gate passed"
                    );
                } else {
                    warn!(
                        gate = Self::NAME,
                        violations = %result.violation_summary(),
                        "performance gate failed"
                    );
                }
                Ok(result)
            }
            Err(JobError::Cancelled) => Err(PitbossError::Interrupted),
            Err(job_err) => {
                error!(gate = Self::NAME, reason = %job_err, "backtest job did not produce a usable report");
                let result = GateResult::from_job_error(Self::NAME, &job_err);
                writer.write_gate_report(&result)?;
                Ok(result)
            }
        }
    }
}
