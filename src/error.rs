//! Error types for the storage conformance engine
//!
//! Every failure a scenario can hit maps onto one variant here. Variants are
//! grouped by [`ErrorClass`] so callers can tell a bad configuration from a
//! platform hiccup, a blown timeout budget or a genuine provisioning bug.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("Config file parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Platform Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind} {name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind} {name}")]
    ResourceExists { kind: String, name: String },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    #[error("Timed out after {budget:?} waiting for {waiting_for} ({resource})")]
    Timeout {
        waiting_for: String,
        resource: String,
        budget: Duration,
    },

    // =========================================================================
    // Invariant Violations
    // =========================================================================
    #[error("{check} check failed for {resource}: expected {expected}, got {actual}")]
    InvariantViolation {
        resource: String,
        check: String,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Workload Errors
    // =========================================================================
    #[error("Pod {pod} failed: {reason}")]
    WorkloadFailed { pod: String, reason: String },

    #[error("Route {uri} did not become available: {reason}")]
    RouteUnavailable { uri: String, reason: String },

    // =========================================================================
    // Aggregated Errors
    // =========================================================================
    #[error("Cleanup failed ({} failure(s)): {}", .failures.len(), .failures.join("; "))]
    Cleanup { failures: Vec<String> },

    #[error("{} of {total} parallel workflows failed: {}", .failures.len(), .failures.join("; "))]
    Parallel { total: usize, failures: Vec<String> },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad category of an error, used for reporting and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Raised before any platform resource exists
    Configuration,
    /// Unexpected control plane failure
    Platform,
    /// A bounded wait ran out of budget
    Timeout,
    /// Observed state diverged from the expected state
    Invariant,
    /// A verification workload failed
    Workload,
    /// Teardown could not remove everything it created
    Cleanup,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Configuration => write!(f, "configuration"),
            ErrorClass::Platform => write!(f, "platform"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::Invariant => write!(f, "invariant"),
            ErrorClass::Workload => write!(f, "workload"),
            ErrorClass::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Configuration(_) | Error::CapacityParse(_) | Error::YamlParse(_) => {
                ErrorClass::Configuration
            }

            Error::Timeout { .. } => ErrorClass::Timeout,

            Error::InvariantViolation { .. } => ErrorClass::Invariant,

            Error::WorkloadFailed { .. } | Error::RouteUnavailable { .. } => {
                ErrorClass::Workload
            }

            Error::Cleanup { .. } => ErrorClass::Cleanup,

            // A parallel run is as bad as its members; report it as a workload failure
            Error::Parallel { .. } => ErrorClass::Workload,

            _ => ErrorClass::Platform,
        }
    }

    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether the error means the object was already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Shorthand for an invariant violation
    pub fn mismatch(
        resource: impl Into<String>,
        check: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Error::InvariantViolation {
            resource: resource.into(),
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceExists {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::Configuration("no overlap".into());
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err = Error::Timeout {
            waiting_for: "claim Bound".into(),
            resource: "ns/pvc-1".into(),
            budget: Duration::from_secs(300),
        };
        assert_eq!(err.class(), ErrorClass::Timeout);

        let err = Error::mismatch("ns/pvc-1", "capacity", "1Gi", "2Gi");
        assert_eq!(err.class(), ErrorClass::Invariant);

        let err = Error::Cleanup {
            failures: vec!["pod ns/a: boom".into()],
        };
        assert_eq!(err.class(), ErrorClass::Cleanup);

        let err = Error::not_found("Pod", "ns/a");
        assert_eq!(err.class(), ErrorClass::Platform);
    }

    #[test]
    fn test_not_found_and_exists() {
        assert!(Error::not_found("PersistentVolumeClaim", "ns/a").is_not_found());
        assert!(!Error::not_found("PersistentVolumeClaim", "ns/a").is_already_exists());
        assert!(Error::exists("StorageClass", "fast").is_already_exists());
        assert!(!Error::Platform("flaky".into()).is_not_found());
    }

    #[test]
    fn test_messages_carry_identity_and_values() {
        let err = Error::mismatch("ns/pvc-1", "reclaim policy", "Delete", "Retain");
        let msg = err.to_string();
        assert!(msg.contains("ns/pvc-1"));
        assert!(msg.contains("Delete"));
        assert!(msg.contains("Retain"));

        let err = Error::Cleanup {
            failures: vec!["claim ns/a: denied".into(), "pod ns/b: denied".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 failure(s)"));
        assert!(msg.contains("claim ns/a"));
        assert!(msg.contains("pod ns/b"));
    }
}
