//! Validation Gates
//!
//! Pass/fail checkpoints between preflight and service startup:
//! - Typed thresholds (metric name -> comparator + limit)
//! - Fail-closed evaluation over a batch job's metrics map
//! - External job execution with bounded timeout and cancellation
//! - Report persistence for audit

pub mod job;
pub mod performance;
pub mod report;
pub mod risk_sim;

pub use job::{run_gate_job, JobError};
pub use performance::PerformanceGate;
pub use report::ReportWriter;
pub use risk_sim::RiskSimulationGate;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PitbossError;

/// Metric values parsed from a gate job's output
pub type MetricsMap = BTreeMap<String, Decimal>;

/// Comparison operator for one acceptance rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    pub fn holds(&self, actual: Decimal, limit: Decimal) -> bool {
        match self {
            Comparator::Gte => actual >= limit,
            Comparator::Lte => actual <= limit,
            Comparator::Gt => actual > limit,
            Comparator::Lt => actual < limit,
            Comparator::Eq => actual == limit,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Gte => ">=",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Eq => "==",
        };
        write!(f, "{s}")
    }
}

/// One acceptance rule: the metric must satisfy `op limit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub op: Comparator,
    pub limit: Decimal,
}

/// Gate outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// One violated acceptance rule, with the observed value if the metric
/// was present at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub metric: String,
    pub actual: Option<Decimal>,
    pub op: Comparator,
    pub limit: Decimal,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "{} {} !{} {}",
                self.metric, actual, self.op, self.limit
            ),
            None => write!(
                f,
                "{} missing from job output (required {} {})",
                self.metric, self.op, self.limit
            ),
        }
    }
}

/// Immutable record of one gate invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub verdict: Verdict,
    /// Every metric the job reported, violated or not
    pub metrics: MetricsMap,
    pub violations: Vec<Violation>,
    /// Set when the job could not produce metrics at all; distinguishes
    /// "validation could not run" from "validation ran and failed"
    pub job_error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Result for a job that crashed, timed out, or produced unusable output
    pub fn from_job_error(gate: &str, reason: &JobError) -> Self {
        Self {
            gate: gate.to_string(),
            verdict: Verdict::Fail,
            metrics: MetricsMap::new(),
            violations: Vec::new(),
            job_error: Some(reason.to_string()),
            evaluated_at: Utc::now(),
        }
    }

    pub fn violation_summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Convert a failed result into the matching error class. Callers must
    /// not invoke this on a passing result.
    pub fn into_error(self) -> PitbossError {
        if let Some(reason) = self.job_error {
            PitbossError::GateJob {
                gate: self.gate,
                reason,
            }
        } else {
            PitbossError::GateFailed {
                violations: self.violation_summary(),
                gate: self.gate,
            }
        }
    }
}

/// Evaluate a metrics map against the gate's thresholds.
///
/// Fail-closed: a metric listed in `thresholds` but absent from `metrics`
/// is a violation, never a pass. Deterministic for fixed inputs.
pub fn evaluate(
    gate: &str,
    thresholds: &BTreeMap<String, Threshold>,
    metrics: &MetricsMap,
) -> GateResult {
    let mut violations = Vec::new();

    for (metric, rule) in thresholds {
        match metrics.get(metric) {
            Some(actual) if rule.op.holds(*actual, rule.limit) => {}
            Some(actual) => violations.push(Violation {
                metric: metric.clone(),
                actual: Some(*actual),
                op: rule.op,
                limit: rule.limit,
            }),
            None => violations.push(Violation {
                metric: metric.clone(),
                actual: None,
                op: rule.op,
                limit: rule.limit,
            }),
        }
    }

    let verdict = if violations.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    GateResult {
        gate: gate.to_string(),
        verdict,
        metrics: metrics.clone(),
        violations,
        job_error: None,
        evaluated_at: Utc::now(),
    }
}
