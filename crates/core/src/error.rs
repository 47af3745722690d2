//! Error taxonomy shared across the workspace. Validation errors and
//! per-catalog failures are aggregated so operators see every problem in a
//! single diagnostic pass.

use thiserror::Error;

/// Secret resolution failures. `Transient` is the only retryable variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {0:?} not found")]
    NotFound(String),
    #[error("secret {0:?} access denied")]
    Unauthorized(String),
    #[error("secret {id:?} missing field {field:?}")]
    Malformed { id: String, field: String },
    #[error("secret {id:?} temporarily unavailable: {reason}")]
    Transient { id: String, reason: String },
}

impl SecretError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SecretError::Transient { .. })
    }
}

/// Trust material failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("certificate import failed for {id:?}: {reason}")]
    Import { id: String, reason: String },
}

/// Per-catalog rendering failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unsupported connector {0:?}")]
    UnsupportedConnector(String),
    #[error("catalog {catalog:?} references {{SSL_*}} placeholders but no trust material was supplied")]
    MissingTrustMaterial { catalog: String },
    #[error("catalog {catalog:?} missing required field {field:?}")]
    MissingField { catalog: String, field: String },
    #[error("catalog {catalog:?} expects a {expected} secret")]
    SecretShape { catalog: String, expected: &'static str },
    #[error("catalog {catalog:?} has an invalid config line {line:?}")]
    InvalidConfig { catalog: String, line: String },
}

/// Anything that can sink one catalog within a pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Bad references or duplicates in the declarative spec, rejected before any
/// secret is resolved. Carries every problem found, not just the first.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid catalog spec: {}", problems.join("; "))]
pub struct SpecValidationError {
    pub problems: Vec<String>,
}

/// A whole reconciliation pass failing. The previously-applied set is
/// retained unmodified in every case.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] SpecValidationError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error("{} catalog(s) failed: {}", failures.len(),
        failures.iter().map(|(n, e)| format!("{n}: {e}")).collect::<Vec<_>>().join("; "))]
    Catalogs { failures: Vec<(String, CatalogError)> },
    #[error("spec parse error: {0}")]
    Parse(String),
    #[error("apply failed for catalog {catalog:?}: {reason}")]
    Apply { catalog: String, reason: String },
}

/// Delivery to a dependent node failed or the dependent cannot converge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PropagationError {
    #[error("dependent {node:?} unreachable after {attempts} attempts")]
    Unreachable { node: String, attempts: u32 },
    #[error("dependent {node:?} degraded; last good fingerprint {last_good:?}")]
    Degraded { node: String, last_good: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_problem() {
        let err = SpecValidationError {
            problems: vec![
                "duplicate catalog name \"sales\"".to_string(),
                "catalog \"ops\" references unknown backend \"dwh2\"".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("sales"));
        assert!(msg.contains("dwh2"));
    }

    #[test]
    fn catalog_failures_are_aggregated() {
        let err = ReconcileError::Catalogs {
            failures: vec![
                ("a".to_string(), SecretError::NotFound("s1".to_string()).into()),
                (
                    "b".to_string(),
                    RenderError::MissingTrustMaterial { catalog: "b".to_string() }.into(),
                ),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 catalog(s) failed"));
        assert!(msg.contains("a: secret"));
        assert!(msg.contains("trust material"));
    }

    #[test]
    fn only_transient_secret_errors_retry() {
        assert!(SecretError::Transient { id: "x".into(), reason: "io".into() }.is_transient());
        assert!(!SecretError::NotFound("x".into()).is_transient());
        assert!(!SecretError::Malformed { id: "x".into(), field: "replicas".into() }
            .is_transient());
    }
}
