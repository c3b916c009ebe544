//! Cloud client errors

use thiserror::Error;

/// Failure talking to the cloud control plane
#[derive(Debug, Error)]
pub enum CloudError {
    /// Request never produced a response
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Target URL
        url: String,
        /// Transport error text
        message: String,
    },

    /// Control plane answered with a non-success status
    #[error("{url} returned {status}: {message}")]
    Http {
        /// Target URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Message from the error body, or the raw body
        message: String,
    },

    /// Response body did not match the expected shape
    #[error("invalid response from {url}: {message}")]
    Decode {
        /// Target URL
        url: String,
        /// Decoder error text
        message: String,
    },

    /// HTTP client could not be constructed
    #[error("failed to build cloud client: {0}")]
    Build(String),
}

impl CloudError {
    /// HTTP status, if the control plane answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Attach the run name and convert into the shared error type
    pub fn for_run(self, run: impl Into<String>) -> loadrun_common::Error {
        loadrun_common::Error::cloud_for(run, self.to_string())
    }
}

impl From<CloudError> for loadrun_common::Error {
    fn from(e: CloudError) -> Self {
        e.for_run(loadrun_common::error::UNKNOWN_CONTEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_includes_server_message() {
        let err = CloudError::Http {
            url: "https://ingest.example/v1/tests".to_string(),
            status: 403,
            message: "token expired".to_string(),
        };
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("token expired"));
    }

    #[test]
    fn converts_with_run_context() {
        let err = CloudError::Build("no tls".to_string()).for_run("smoke");
        assert_eq!(err.run(), Some("smoke"));
        assert!(err.is_retryable());
    }
}
