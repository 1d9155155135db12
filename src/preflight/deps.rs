//! Dependency Validation
//!
//! Verifies the machine can actually host the stack before anything is
//! spawned: required executables resolve on PATH, package probes succeed,
//! declared ports are free, working directories exist (created if absent),
//! and no live PID file is left over from a previous session. Required
//! failures produce a non-zero verdict; optional failures are warnings.
//! Safe to re-run; the only side effect is directory creation.

use serde::Serialize;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::DependencyConfig;
use crate::error::{PitbossError, Result};
use crate::supervisor::process::pid_alive;

const PACKAGE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one dependency check
#[derive(Debug, Clone, Serialize)]
pub struct CheckStatus {
    pub name: String,
    pub ok: bool,
    pub required: bool,
    pub message: String,
}

/// Counted report per the preflight contract
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub required_met: usize,
    pub required_total: usize,
    pub optional_met: usize,
    pub optional_total: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub checks: Vec<CheckStatus>,
}

impl DependencyReport {
    pub fn all_required_met(&self) -> bool {
        self.required_met == self.required_total
    }

    /// Escalate required failures into the dependency error class
    pub fn into_result(self) -> Result<DependencyReport> {
        if self.all_required_met() {
            Ok(self)
        } else {
            Err(PitbossError::Dependency {
                failed: self.required_total - self.required_met,
                total: self.required_total,
                details: self.errors.join("; "),
            })
        }
    }
}

pub struct DependencyValidator {
    config: DependencyConfig,
    run_dir: PathBuf,
    /// (service name, port) pairs the supervisor will claim
    service_ports: Vec<(String, u16)>,
}

impl DependencyValidator {
    pub fn new(
        config: DependencyConfig,
        run_dir: PathBuf,
        service_ports: Vec<(String, u16)>,
    ) -> Self {
        Self {
            config,
            run_dir,
            service_ports,
        }
    }

    /// Run every check and log a summary. Never fails early: operators get
    /// the full list of problems in one pass.
    pub async fn validate_all(&self) -> DependencyReport {
        let mut checks = Vec::new();

        for cmd in &self.config.commands {
            checks.push(check_command(cmd, true));
        }
        for cmd in &self.config.optional_commands {
            checks.push(check_command(cmd, false));
        }

        for probe in &self.config.packages {
            checks.push(check_package(&probe.name, &probe.probe, !probe.optional).await);
        }

        for port in &self.config.ports {
            checks.push(check_port_free("configured", *port));
        }
        for (service, port) in &self.service_ports {
            checks.push(check_port_free(service, *port));
        }

        for dir in &self.config.directories {
            checks.push(check_directory(dir));
        }
        checks.push(check_directory(&self.run_dir));

        let mut warnings = Vec::new();
        checks.extend(self.check_stale_pid_files(&mut warnings));

        let required_total = checks.iter().filter(|c| c.required).count();
        let required_met = checks.iter().filter(|c| c.required && c.ok).count();
        let optional_total = checks.iter().filter(|c| !c.required).count();
        let optional_met = checks.iter().filter(|c| !c.required && c.ok).count();

        let errors: Vec<String> = checks
            .iter()
            .filter(|c| c.required && !c.ok)
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect();
        warnings.extend(
            checks
                .iter()
                .filter(|c| !c.required && !c.ok)
                .map(|c| format!("{}: {}", c.name, c.message)),
        );

        let report = DependencyReport {
            required_met,
            required_total,
            optional_met,
            optional_total,
            errors,
            warnings,
            checks,
        };
        log_summary(&report);
        report
    }

    /// Leftover PID files: a dead holder is cleaned up with a warning, a
    /// live one means another session still owns the stack.
    fn check_stale_pid_files(&self, warnings: &mut Vec<String>) -> Vec<CheckStatus> {
        let mut checks = Vec::new();
        let entries = match std::fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(_) => return checks,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let pid = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok());
            match pid {
                Some(pid) if pid_alive(pid) => {
                    checks.push(CheckStatus {
                        name: format!("pid file {stem}"),
                        ok: false,
                        required: true,
                        message: format!(
                            "process {pid} from a previous session is still running"
                        ),
                    });
                }
                _ => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warnings.push(format!(
                            "stale pid file {}: could not remove: {e}",
                            path.display()
                        ));
                    } else {
                        warn!(service = %stem, path = %path.display(), "removed stale pid file");
                        warnings.push(format!("removed stale pid file for {stem}"));
                    }
                }
            }
        }
        checks
    }
}

fn check_command(cmd: &str, required: bool) -> CheckStatus {
    match resolve_on_path(cmd) {
        Some(path) => CheckStatus {
            name: format!("command {cmd}"),
            ok: true,
            required,
            message: format!("found at {}", path.display()),
        },
        None => CheckStatus {
            name: format!("command {cmd}"),
            ok: false,
            required,
            message: "not found on PATH".to_string(),
        },
    }
}

async fn check_package(name: &str, probe: &[String], required: bool) -> CheckStatus {
    let Some((cmd, args)) = probe.split_first() else {
        return CheckStatus {
            name: format!("package {name}"),
            ok: false,
            required,
            message: "empty probe command".to_string(),
        };
    };
    let run = Command::new(cmd)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(PACKAGE_PROBE_TIMEOUT, run).await {
        Ok(Ok(status)) if status.success() => CheckStatus {
            name: format!("package {name}"),
            ok: true,
            required,
            message: "probe succeeded".to_string(),
        },
        Ok(Ok(status)) => CheckStatus {
            name: format!("package {name}"),
            ok: false,
            required,
            message: format!("probe exited with {status}"),
        },
        Ok(Err(e)) => CheckStatus {
            name: format!("package {name}"),
            ok: false,
            required,
            message: format!("probe failed to run: {e}"),
        },
        Err(_) => CheckStatus {
            name: format!("package {name}"),
            ok: false,
            required,
            message: format!("probe timed out after {}s", PACKAGE_PROBE_TIMEOUT.as_secs()),
        },
    }
}

fn check_port_free(owner: &str, port: u16) -> CheckStatus {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => CheckStatus {
            name: format!("port {port} ({owner})"),
            ok: true,
            required: true,
            message: "free".to_string(),
        },
        Err(e) => CheckStatus {
            name: format!("port {port} ({owner})"),
            ok: false,
            required: true,
            message: format!("busy: {e}"),
        },
    }
}

fn check_directory(dir: &Path) -> CheckStatus {
    if dir.is_dir() {
        return CheckStatus {
            name: format!("directory {}", dir.display()),
            ok: true,
            required: true,
            message: "exists".to_string(),
        };
    }
    match std::fs::create_dir_all(dir) {
        Ok(()) => CheckStatus {
            name: format!("directory {}", dir.display()),
            ok: true,
            required: true,
            message: "created".to_string(),
        },
        Err(e) => CheckStatus {
            name: format!("directory {}", dir.display()),
            ok: false,
            required: true,
            message: format!("cannot create: {e}"),
        },
    }
}

/// Resolve a command the way the shell would, without shelling out.
/// Commands containing a path separator are checked directly.
fn resolve_on_path(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| is_executable(candidate))
}

/// Exec-bit check on unix; elsewhere any regular file counts
fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.is_file()
            && std::fs::metadata(path)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn log_summary(report: &DependencyReport) {
    for check in &report.checks {
        if check.ok {
            info!(check = %check.name, "{}", check.message);
        } else if check.required {
            error!(check = %check.name, "{}", check.message);
        } else {
            warn!(check = %check.name, "{}", check.message);
        }
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if report.all_required_met() {
        info!(
            required = format!("{}/{}", report.required_met, report.required_total),
            optional = format!("{}/{}", report.optional_met, report.optional_total),
            "dependency check passed"
        );
    } else {
        error!(
            required = format!("{}/{}", report.required_met, report.required_total),
            optional = format!("{}/{}", report.optional_met, report.optional_total),
            "dependency check failed"
        );
    }
}
