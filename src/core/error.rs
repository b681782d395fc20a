//! Error taxonomy for the reconciliation engine.
//!
//! Configuration and lock errors abort before any side effect. Provider
//! errors live in [`crate::provider::ProviderError`] and never escape an
//! apply as `Err`: they become step outcomes in the apply report.

use super::types::Address;
use thiserror::Error;

/// A problem with the declared configuration. Always fatal before execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("dependency cycle: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<Address> },

    #[error("resource '{address}' references itself")]
    SelfReference { address: Address },

    #[error("unresolved reference: '{from}' references '{target}', which is not declared")]
    UnresolvedReference { from: Address, target: Address },

    #[error("resource '{from}' depends on unknown resource '{target}'")]
    UnknownDependency { from: Address, target: String },

    #[error("duplicate resource address '{address}'")]
    DuplicateAddress { address: Address },

    #[error("schema violation in '{address}': {message}")]
    SchemaViolation { address: String, message: String },

    #[error("resource '{address}' has prevent_destroy set but the plan would {action} it")]
    PreventDestroy { address: Address, action: String },

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),
}

fn format_cycle(cycle: &[Address]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(|a| a.to_string()).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

/// Another run holds the lock on an address this plan targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{address}' is locked by {holder} since {since}")]
pub struct LockConflict {
    pub address: Address,
    pub holder: String,
    pub since: String,
}

/// State store failures.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is invalid: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state schema {found} is not supported (expected {expected})")]
    UnsupportedSchema { found: String, expected: String },

    #[error("state was modified externally (serial {found}, expected {expected})")]
    Conflict { expected: u64, found: u64 },

    #[error("record '{address}' is at version {found}, expected {expected}")]
    VersionMismatch {
        address: Address,
        expected: u64,
        found: u64,
    },

    #[error("'{address}' is not locked by {owner}")]
    NotLocked { address: Address, owner: String },
}

impl StateError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn corrupt(path: &std::path::Path, source: serde_json::Error) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The planner could not produce a safe ordering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan cannot be scheduled; residual ordering cycle among: {}", .steps.join(", "))]
    Unschedulable { steps: Vec<String> },
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{} configuration error(s): {}", .0.len(), join_errors(.0))]
    Configuration(Vec<ConfigError>),

    #[error("plan refused: {0}")]
    Lock(#[from] LockConflict),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Usage(String),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(vec![e])
    }
}

impl From<Vec<ConfigError>> for EngineError {
    fn from(errors: Vec<ConfigError>) -> Self {
        Self::Configuration(errors)
    }
}

impl EngineError {
    /// Process exit code. Every engine error is raised before any operation
    /// was attempted, so they all map to "refused".
    pub fn exit_code(&self) -> i32 {
        2
    }

    /// Configuration errors carried by this error, if any.
    pub fn config_errors(&self) -> &[ConfigError] {
        match self {
            Self::Configuration(errors) => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_cycle_message_closes_loop() {
        let e = ConfigError::Cycle {
            cycle: vec![addr("network.a"), addr("subnetwork.b")],
        };
        assert_eq!(
            e.to_string(),
            "dependency cycle: network.a -> subnetwork.b -> network.a"
        );
    }

    #[test]
    fn test_unresolved_reference_message() {
        let e = ConfigError::UnresolvedReference {
            from: addr("compute-service.api"),
            target: addr("managed-database.main"),
        };
        assert!(e.to_string().starts_with("unresolved reference"));
        assert!(e.to_string().contains("managed-database.main"));
    }

    #[test]
    fn test_engine_error_wraps_config_list() {
        let e: EngineError = vec![
            ConfigError::Parse("bad".into()),
            ConfigError::UnknownEnvironment("qa".into()),
        ]
        .into();
        assert_eq!(e.config_errors().len(), 2);
        assert!(e.to_string().starts_with("2 configuration error(s)"));
        assert_eq!(e.exit_code(), 2);
    }
}
