//! Environment Validation
//!
//! Checks the credential variables the managed services will inherit:
//! present, not a placeholder, and shaped like a real secret (length,
//! character class). Every violation is reported so operators fix the lot
//! in one pass. The trading-mode variable is forced to the safe value no
//! matter what the environment says; that override is logged, never an
//! error. Credential values are held in zeroizing buffers and only key
//! names appear in logs.

use serde::Serialize;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::{CredentialRule, EnvironmentConfig};
use crate::error::{PitbossError, Result};

const PLACEHOLDER_MARKERS: &[&str] = &["changeme", "your-", "your_", "placeholder", "xxx", "fixme"];

/// Outcome of validating the process environment
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    /// Keys that passed every check
    pub valid_keys: Vec<String>,
    /// One entry per missing/malformed key
    pub errors: Vec<String>,
    /// The mode value actually exported after the safety override
    pub forced_mode: String,
}

impl EnvironmentReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<EnvironmentReport> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(PitbossError::Environment {
                count: self.errors.len(),
                details: self.errors.join("; "),
            })
        }
    }
}

pub struct EnvironmentValidator {
    config: EnvironmentConfig,
}

impl EnvironmentValidator {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }

    /// Validate every required credential and apply the mode override.
    pub fn validate_all(&self) -> EnvironmentReport {
        let mut valid_keys = Vec::new();
        let mut errors = Vec::new();

        for rule in &self.config.required {
            match check_credential(rule) {
                Ok(()) => {
                    info!(key = %rule.key, "credential validated");
                    valid_keys.push(rule.key.clone());
                }
                Err(reason) => {
                    error!(key = %rule.key, reason = %reason, "credential rejected");
                    errors.push(format!("{}: {}", rule.key, reason));
                }
            }
        }

        let forced_mode = self.force_safe_mode();

        if errors.is_empty() {
            info!(
                keys = valid_keys.len(),
                mode = %forced_mode,
                "environment validation passed"
            );
        } else {
            error!(
                problems = errors.len(),
                "environment validation failed"
            );
        }

        EnvironmentReport {
            valid_keys,
            errors,
            forced_mode,
        }
    }

    /// Deliberate safety override: whatever the incoming mode flag says,
    /// managed services start in the safe mode.
    fn force_safe_mode(&self) -> String {
        let key = &self.config.mode_key;
        let safe = &self.config.safe_mode;
        match std::env::var(key) {
            Ok(incoming) if incoming == *safe => {}
            Ok(incoming) => {
                warn!(
                    key = %key,
                    incoming = %incoming,
                    forced = %safe,
                    "trading mode overridden to safe default"
                );
            }
            Err(_) => {
                info!(key = %key, forced = %safe, "trading mode set to safe default");
            }
        }
        std::env::set_var(key, safe);
        safe.clone()
    }
}

/// Distinct error per failure so each key's problem is actionable on its own
fn check_credential(rule: &CredentialRule) -> std::result::Result<(), String> {
    let value = match std::env::var(&rule.key) {
        Ok(v) => Zeroizing::new(v),
        Err(std::env::VarError::NotPresent) => return Err("not set".to_string()),
        Err(std::env::VarError::NotUnicode(_)) => return Err("not valid unicode".to_string()),
    };

    if value.trim().is_empty() {
        return Err("set but empty".to_string());
    }

    let lowered = Zeroizing::new(value.to_lowercase());
    if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err("looks like a placeholder value".to_string());
    }

    let len = value.len();
    if rule.min_len > 0 && len < rule.min_len {
        return Err(format!("too short ({len} < {} chars)", rule.min_len));
    }
    if rule.max_len > 0 && len > rule.max_len {
        return Err(format!("too long ({len} > {} chars)", rule.max_len));
    }
    if rule.alphanumeric && !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("contains non-alphanumeric characters".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(key: &str, min_len: usize, alphanumeric: bool) -> CredentialRule {
        CredentialRule {
            key: key.to_string(),
            min_len,
            max_len: 0,
            alphanumeric,
        }
    }

    fn validator_for(rules: Vec<CredentialRule>, mode_key: &str) -> EnvironmentValidator {
        EnvironmentValidator::new(EnvironmentConfig {
            required: rules,
            mode_key: mode_key.to_string(),
            safe_mode: "paper".to_string(),
        })
    }

    #[test]
    fn test_well_formed_credentials_pass() {
        std::env::set_var("PB_TEST_OK_KEY", "a1b2c3d4e5f6a1b2c3d4");
        let report =
            validator_for(vec![rule("PB_TEST_OK_KEY", 16, true)], "PB_TEST_MODE_A").validate_all();
        assert!(report.is_ok());
        assert_eq!(report.valid_keys, vec!["PB_TEST_OK_KEY".to_string()]);
    }

    #[test]
    fn test_each_bad_key_gets_its_own_error() {
        std::env::remove_var("PB_TEST_MISSING_KEY");
        std::env::set_var("PB_TEST_SHORT_KEY", "abc");
        std::env::set_var("PB_TEST_PLACEHOLDER_KEY", "your-api-key-here");

        let report = validator_for(
            vec![
                rule("PB_TEST_MISSING_KEY", 0, false),
                rule("PB_TEST_SHORT_KEY", 16, false),
                rule("PB_TEST_PLACEHOLDER_KEY", 0, false),
            ],
            "PB_TEST_MODE_B",
        )
        .validate_all();

        assert_eq!(report.errors.len(), 3);
        assert!(report.errors.iter().any(|e| e.contains("PB_TEST_MISSING_KEY")
            && e.contains("not set")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("PB_TEST_SHORT_KEY") && e.contains("too short")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("PB_TEST_PLACEHOLDER_KEY") && e.contains("placeholder")));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_alphanumeric_shape_enforced() {
        std::env::set_var("PB_TEST_SHAPE_KEY", "has spaces and ! marks");
        let report =
            validator_for(vec![rule("PB_TEST_SHAPE_KEY", 0, true)], "PB_TEST_MODE_C").validate_all();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("non-alphanumeric"));
    }

    #[test]
    fn test_mode_is_forced_to_paper_even_when_live() {
        std::env::set_var("PB_TEST_MODE_D", "live");
        let report = validator_for(vec![], "PB_TEST_MODE_D").validate_all();
        // Override is a safety action, not a validation failure
        assert!(report.is_ok());
        assert_eq!(report.forced_mode, "paper");
        assert_eq!(std::env::var("PB_TEST_MODE_D").unwrap(), "paper");
    }

    #[test]
    fn test_mode_set_when_absent() {
        std::env::remove_var("PB_TEST_MODE_E");
        let report = validator_for(vec![], "PB_TEST_MODE_E").validate_all();
        assert!(report.is_ok());
        assert_eq!(std::env::var("PB_TEST_MODE_E").unwrap(), "paper");
    }
}
