//! Controller error type and its retry policy.

use std::time::Duration;

use azure_cloud::CloudError;
use thiserror::Error;

use crate::classify::{classify, ErrorKind};
use crate::config::RetryConfig;

/// Errors of the reconcilers.
#[derive(Error, Debug)]
pub enum Error {
    /// Provider configuration could not be decoded or a lookup missed.
    #[error("Provider configuration error: {0}")]
    Config(#[from] azure_config::Error),

    /// Azure call failed.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The resource or one of its inputs is invalid.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An error wrapped with its classification.
    #[error("{source}")]
    Classified {
        kind: ErrorKind,
        codes: Vec<&'static str>,
        #[source]
        source: Box<Error>,
    },

    /// The reconcile must be repeated later.
    #[error("Requeue in {after:?}: {reason}")]
    Requeue { after: Duration, reason: String },

    /// Dependency failures persisted beyond the retry budget.
    #[error("Giving up after {attempts} attempts: {source}")]
    BudgetExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Object has no name or namespace.
    #[error("Missing object key")]
    MissingObjectKey,

    /// A referenced resource does not exist.
    #[error("Missing resource: {0}")]
    MissingResource(String),

    /// Controller configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Key material could not be generated or encoded.
    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The reconcile was cancelled.
    #[error("Reconcile cancelled")]
    Cancelled,

    /// The reconcile ran past its deadline.
    #[error("Reconcile deadline exceeded")]
    DeadlineExceeded,
}

/// Result alias for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn requeue(after: Duration, reason: impl Into<String>) -> Self {
        Self::Requeue {
            after,
            reason: reason.into(),
        }
    }

    /// Classification of this error, if any matcher applies.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Classified { kind, .. } => Some(*kind),
            Self::BudgetExhausted { source, .. } => source.kind(),
            Self::Requeue { reason, .. } => classify(reason),
            Self::Cancelled => None,
            Self::DeadlineExceeded => Some(ErrorKind::RetryableDependencies),
            other => classify(&other.to_string()),
        }
    }

    /// Error codes reported in resource status.
    #[must_use]
    pub fn codes(&self) -> Vec<&'static str> {
        match self {
            Self::Classified { codes, .. } => codes.clone(),
            other => other.kind().map(|kind| vec![kind.code()]).unwrap_or_default(),
        }
    }

    /// Returns `true` when the cloud reported a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cloud(err) => err.is_not_found(),
            Self::Classified { source, .. } | Self::BudgetExhausted { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn retry_after(&self, retry: &RetryConfig) -> Duration {
        match self {
            Self::Requeue { after, .. } => return *after,
            Self::BudgetExhausted { .. } => return retry.long_retry_period(),
            _ => {}
        }
        match self.kind() {
            Some(
                ErrorKind::Unauthenticated
                | ErrorKind::Unauthorized
                | ErrorKind::QuotaExceeded
                | ErrorKind::ConfigProblem
                | ErrorKind::ResourcesDepleted,
            ) => retry.long_retry_period(),
            Some(kind) if kind.is_retryable() => retry.retry_after(),
            Some(ErrorKind::Dependencies) => retry.backoff_base(),
            _ => retry.unclassified(),
        }
    }
}

/// Wraps `err` with its classification.
///
/// Codes already known to the caller are added to the matched kind's code.
/// Errors without a match are returned unchanged.
#[must_use]
pub fn determine_error(err: Error, known_codes: &[&'static str]) -> Error {
    if matches!(
        err,
        Error::Classified { .. }
            | Error::Requeue { .. }
            | Error::BudgetExhausted { .. }
            | Error::Cancelled
    ) {
        return err;
    }
    let Some(kind) = err.kind() else {
        return err;
    };
    let mut codes = vec![kind.code()];
    for code in known_codes {
        if !codes.contains(code) {
            codes.push(code);
        }
    }
    Error::Classified {
        kind,
        codes,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, code: &str, message: &str) -> Error {
        Error::Cloud(CloudError::Api {
            status,
            code: Some(code.to_string()),
            message: message.to_string(),
        })
    }

    #[test]
    fn determine_error_attaches_codes() {
        let err = determine_error(
            api(409, "InUseSubnetCannotBeDeleted", "in use"),
            &["ERR_INFRA_DEPENDENCIES", "ERR_CLEANUP_CLUSTER_RESOURCES"],
        );
        assert_eq!(err.kind(), Some(ErrorKind::Dependencies));
        assert_eq!(
            err.codes(),
            vec!["ERR_INFRA_DEPENDENCIES", "ERR_CLEANUP_CLUSTER_RESOURCES"]
        );
        assert!(err.to_string().contains("InUseSubnetCannotBeDeleted"));
    }

    #[test]
    fn unmatched_errors_stay_unclassified() {
        let err = determine_error(Error::Validation("odd".to_string()), &[]);
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.codes().is_empty());
    }

    #[test]
    fn retry_periods_follow_the_kind() {
        let retry = RetryConfig::default();
        assert_eq!(
            api(401, "InvalidAuthenticationTokenTenant", "x").retry_after(&retry),
            Duration::from_secs(300)
        );
        assert_eq!(
            api(429, "TooManyRequests", "x").retry_after(&retry),
            Duration::from_secs(30)
        );
        assert_eq!(
            api(400, "InUseSubnetCannotBeDeleted", "x").retry_after(&retry),
            Duration::from_secs(5)
        );
        assert_eq!(
            Error::Validation("odd".to_string()).retry_after(&retry),
            Duration::from_secs(30)
        );
        assert_eq!(
            Error::requeue(Duration::from_secs(5), "bastion not ready").retry_after(&retry),
            Duration::from_secs(5)
        );
        let exhausted = Error::BudgetExhausted {
            attempts: 11,
            source: Box::new(api(400, "InUseSubnetCannotBeDeleted", "x")),
        };
        assert_eq!(exhausted.retry_after(&retry), Duration::from_secs(300));
        assert_eq!(exhausted.kind(), Some(ErrorKind::Dependencies));
    }

    #[test]
    fn not_found_survives_classification() {
        let err = determine_error(api(404, "ResourceNotFound", "notFound"), &[]);
        assert!(err.is_not_found());
    }
}
