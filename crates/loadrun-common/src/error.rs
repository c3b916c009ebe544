//! Error types for the loadrun operator
//!
//! Errors carry the name of the test run they relate to where one is known,
//! so a failed reconciliation can be traced back to a resource from the logs
//! alone.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for loadrun operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid TestRun spec or referenced configuration
    #[error("validation error for {run}: {message}")]
    Validation {
        /// Name of the test run with invalid configuration
        run: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.parallelism")
        field: Option<String>,
    },

    /// Cloud control-plane error
    #[error("cloud error for {run}: {message}")]
    Cloud {
        /// Name of the test run being coordinated
        run: String,
        /// Description of what failed
        message: String,
    },

    /// Runner REST API error
    #[error("runner error [{runner}]: {message}")]
    Runner {
        /// Name of the runner endpoint
        runner: String,
        /// Description of what failed
        message: String,
    },

    /// Stage value outside the known lifecycle
    #[error("invalid stage '{stage}' for {run}")]
    InvalidStage {
        /// Name of the test run
        run: String,
        /// The stage value found in status
        stage: String,
    },

    /// One or more runner jobs could not be deleted
    #[error("failed to delete {failed}/{total} runner jobs for {run}: {message}")]
    WorkerCleanup {
        /// Name of the test run
        run: String,
        /// Number of failed deletions
        failed: usize,
        /// Number of jobs matched by the selector
        total: usize,
        /// Individual failures joined together
        message: String,
    },

    /// Reconciliation did not finish before its deadline
    #[error("reconciliation of {run} cancelled after {after:?}")]
    Cancelled {
        /// Name of the test run
        run: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error without run context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            run: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with run context
    pub fn validation_for(run: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            run: run.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with run context and field path
    pub fn validation_for_field(
        run: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            run: run.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cloud error with run context
    pub fn cloud_for(run: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            run: run.into(),
            message: msg.into(),
        }
    }

    /// Create a runner API error
    pub fn runner(runner: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runner {
            runner: runner.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid stage error
    pub fn invalid_stage(run: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::InvalidStage {
            run: run.into(),
            stage: stage.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change; an invalid
    /// stage needs a human. Everything else is expected to clear on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is an optimistic-lock loss, worth an immediate retry
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Cloud { .. } => true,
            Error::Runner { .. } => true,
            Error::InvalidStage { .. } => false,
            Error::WorkerCleanup { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server rejected a write because the object changed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the test run name if this error is associated with one
    pub fn run(&self) -> Option<&str> {
        match self {
            Error::Validation { run, .. }
            | Error::Cloud { run, .. }
            | Error::InvalidStage { run, .. }
            | Error::WorkerCleanup { run, .. }
            | Error::Cancelled { run, .. } => Some(run),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// True if a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if a kube error is a 409 AlreadyExists/Conflict from the API server
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a status patch loses the optimistic lock race
    ///
    /// Another writer changed the TestRun between our read and our patch.
    /// The error must be recognisable as a conflict and remain retryable so
    /// the whole reconciliation runs again against fresh state.
    #[test]
    fn story_conflict_is_retryable() {
        let err = Error::from(api_error(409));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("kubernetes error"));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = Error::from(api_error(422));
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(Error::from(api_error(503)).is_retryable());
    }

    #[test]
    fn invalid_stage_is_terminal() {
        let err = Error::invalid_stage("smoke", "paused");
        assert!(!err.is_retryable());
        assert_eq!(err.run(), Some("smoke"));
        assert_eq!(err.to_string(), "invalid stage 'paused' for smoke");
    }

    #[test]
    fn worker_cleanup_reports_counts() {
        let err = Error::WorkerCleanup {
            run: "soak".to_string(),
            failed: 1,
            total: 3,
            message: "soak-2: forbidden".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("1/3"));
        assert!(err.to_string().contains("soak-2: forbidden"));
    }

    #[test]
    fn validation_carries_field_path() {
        let err = Error::validation_for_field("smoke", "spec.parallelism", "must be positive");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.parallelism"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn default_context_is_unknown() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        assert_eq!(Error::validation("x").run(), Some(UNKNOWN_CONTEXT));
    }

    #[test]
    fn not_found_helpers() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_already_exists(&api_error(409)));
    }
}
