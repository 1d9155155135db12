//! Service Specifications and Startup Ordering
//!
//! A `ServiceSpec` is one immutable node in the startup DAG: how to launch
//! the process, how to probe it, what it depends on. Graph validation and
//! the topological startup order live here so both config validation and
//! the supervisor share one source of truth.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use crate::error::GraphError;

/// Readiness probe target for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthTarget {
    /// HTTP GET; 2xx within the probe timeout means ready
    Http { url: String },
    /// Raw TCP connect within the probe timeout means ready
    Tcp { addr: String },
}

impl fmt::Display for HealthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthTarget::Http { url } => write!(f, "{url}"),
            HealthTarget::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

/// One managed service; immutable once loaded
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Port the service will claim; checked free before spawn
    #[serde(default)]
    pub port: Option<u16>,
    pub health: HealthTarget,
    /// Overrides the global default when set
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    /// Names of services that must be Healthy before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Dashboard-class extra; skippable and never depended upon
    #[serde(default)]
    pub satellite: bool,
    /// Extra environment for the child process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn startup_timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(default_secs))
    }
}

/// Validate the whole graph, collecting every problem: duplicate names,
/// unknown or self dependencies, dependencies on satellites, cycles.
pub fn validate_specs(specs: &[ServiceSpec]) -> Result<(), Vec<GraphError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            errors.push(GraphError::DuplicateName {
                name: spec.name.clone(),
            });
        }
    }

    let satellites: HashSet<&str> = specs
        .iter()
        .filter(|s| s.satellite)
        .map(|s| s.name.as_str())
        .collect();

    for spec in specs {
        for dep in &spec.depends_on {
            if dep == &spec.name {
                errors.push(GraphError::SelfDependency {
                    service: spec.name.clone(),
                });
            } else if !seen.contains(dep.as_str()) {
                errors.push(GraphError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                });
            } else if satellites.contains(dep.as_str()) {
                errors.push(GraphError::SatelliteDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cycle detection only makes sense on an otherwise well-formed graph
    if errors.is_empty() {
        if let Err(cycle) = startup_order(specs) {
            errors.push(cycle);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Topological startup order, stable by declaration order among services
/// whose dependencies are equally satisfied. Shutdown uses the reverse.
pub fn startup_order(specs: &[ServiceSpec]) -> Result<Vec<String>, GraphError> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order: Vec<String> = Vec::with_capacity(specs.len());

    while order.len() < specs.len() {
        let mut progressed = false;
        for spec in specs {
            if placed.contains(spec.name.as_str()) {
                continue;
            }
            if spec
                .depends_on
                .iter()
                .all(|dep| placed.contains(dep.as_str()))
            {
                placed.insert(spec.name.as_str());
                order.push(spec.name.clone());
                progressed = true;
            }
        }
        if !progressed {
            let stuck: Vec<&str> = specs
                .iter()
                .filter(|s| !placed.contains(s.name.as_str()))
                .map(|s| s.name.as_str())
                .collect();
            return Err(GraphError::Cycle {
                services: stuck.join(", "),
            });
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: format!("/usr/local/bin/{name}"),
            args: vec![],
            port: None,
            health: HealthTarget::Tcp {
                addr: "127.0.0.1:9000".to_string(),
            },
            startup_timeout_secs: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            satellite: false,
            env: BTreeMap::new(),
        }
    }

    fn satellite(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            satellite: true,
            ..spec(name, deps)
        }
    }

    #[test]
    fn test_chain_orders_dependencies_first() {
        let specs = vec![
            spec("execution-engine", &["risk-manager"]),
            spec("risk-manager", &["market-data"]),
            spec("market-data", &[]),
        ];
        let order = startup_order(&specs).unwrap();
        assert_eq!(order, vec!["market-data", "risk-manager", "execution-engine"]);
    }

    #[test]
    fn test_diamond_respects_every_edge() {
        let specs = vec![
            spec("sink", &["left", "right"]),
            spec("left", &["source"]),
            spec("right", &["source"]),
            spec("source", &[]),
        ];
        let order = startup_order(&specs).unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("source") < pos("left"));
        assert!(pos("source") < pos("right"));
        assert!(pos("left") < pos("sink"));
        assert!(pos("right") < pos("sink"));
    }

    #[test]
    fn test_independent_services_keep_declaration_order() {
        let specs = vec![spec("alpha", &[]), spec("beta", &[]), spec("gamma", &[])];
        let order = startup_order(&specs).unwrap();
        assert_eq!(order, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_cycle_is_detected_and_named() {
        let specs = vec![
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
            spec("standalone", &[]),
        ];
        let err = startup_order(&specs).unwrap_err();
        match err {
            GraphError::Cycle { services } => {
                assert!(services.contains('a'));
                assert!(services.contains('b'));
                assert!(services.contains('c'));
                assert!(!services.contains("standalone"));
            }
            other => panic!("expected Cycle, got {other}"),
        }
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let specs = vec![
            spec("dup", &[]),
            spec("dup", &[]),
            spec("selfish", &["selfish"]),
            spec("dangling", &["nowhere"]),
        ];
        let errors = validate_specs(&specs).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, GraphError::DuplicateName { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, GraphError::SelfDependency { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, GraphError::UnknownDependency { .. })));
    }

    #[test]
    fn test_depending_on_a_satellite_is_rejected() {
        let specs = vec![
            satellite("dashboard", &[]),
            spec("api", &["dashboard"]),
        ];
        let errors = validate_specs(&specs).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, GraphError::SatelliteDependency { .. })));
    }

    #[test]
    fn test_valid_graph_passes() {
        let specs = vec![
            spec("market-data", &[]),
            spec("risk-manager", &["market-data"]),
            spec("execution-engine", &["risk-manager"]),
            satellite("dashboard", &[]),
        ];
        assert!(validate_specs(&specs).is_ok());
    }
}
