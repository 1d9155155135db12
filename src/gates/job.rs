//! Gate Job Runner
//!
//! Runs a gate's external batch job with a hard timeout, parses its stdout
//! (a single JSON object of metric name -> number) into the typed metrics
//! map, and kills the job outright when shutdown is requested. Job-level
//! failures are kept distinct from threshold failures so callers can tell
//! "could not run" from "ran and failed".

use rust_decimal::Decimal;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::MetricsMap;
use crate::coordination::shutdown::ShutdownToken;

/// Failure modes of the batch job itself (as opposed to its metrics)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("exited with {status}: {stderr_tail}")]
    NonZeroExit { status: String, stderr_tail: String },

    #[error("unusable output: {reason}")]
    BadOutput { reason: String },

    #[error("killed by shutdown request")]
    Cancelled,
}

/// Run one gate job to completion, timeout, or cancellation.
///
/// The child is spawned with `kill_on_drop`, so abandoning the wait on the
/// timeout or shutdown branch reaps it instead of leaving an orphan.
pub async fn run_gate_job(
    gate: &str,
    command: &str,
    args: &[String],
    timeout: Duration,
    shutdown: &mut ShutdownToken,
) -> Result<MetricsMap, JobError> {
    info!(gate = %gate, command = %command, timeout_secs = timeout.as_secs(), "running gate job");

    let child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| JobError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    let output = tokio::select! {
        biased;
        cause = shutdown.wait() => {
            warn!(gate = %gate, cause = %cause, "gate job killed by shutdown");
            return Err(JobError::Cancelled);
        }
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
            Err(_) => {
                warn!(gate = %gate, timeout_secs = timeout.as_secs(), "gate job timed out");
                return Err(JobError::Timeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                return Err(JobError::Spawn {
                    command: command.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(output)) => output,
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::NonZeroExit {
            status: output.status.to_string(),
            stderr_tail: tail(&stderr, 400),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let metrics = parse_metrics(&stdout)?;
    debug!(gate = %gate, metric_count = metrics.len(), "gate job produced metrics");
    Ok(metrics)
}

/// Parse the job's stdout into a metrics map. Anything other than a single
/// JSON object with numeric values is a job error, not a threshold failure.
pub fn parse_metrics(stdout: &str) -> Result<MetricsMap, JobError> {
    let value: serde_json::Value =
        serde_json::from_str(stdout.trim()).map_err(|e| JobError::BadOutput {
            reason: format!("stdout is not valid JSON: {e}"),
        })?;

    let object = value.as_object().ok_or_else(|| JobError::BadOutput {
        reason: "stdout JSON is not an object".to_string(),
    })?;

    let mut metrics = MetricsMap::new();
    for (key, raw) in object {
        let parsed = match raw {
            serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
            serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
            _ => None,
        };
        match parsed {
            Some(decimal) => {
                metrics.insert(key.clone(), decimal);
            }
            None => {
                return Err(JobError::BadOutput {
                    reason: format!("metric '{key}' is not numeric: {raw}"),
                });
            }
        }
    }
    Ok(metrics)
}

fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let start = trimmed.len() - max;
        // Avoid slicing mid-codepoint
        let boundary = (start..trimmed.len())
            .find(|i| trimmed.is_char_boundary(*i))
            .unwrap_or(trimmed.len());
        trimmed[boundary..].to_string()
    }
}
