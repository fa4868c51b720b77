//! Error types for the queue worker.
//!
//! Each concern gets its own error type; the engine converts all of them
//! into a delivery disposition and only [`TransportError`] and
//! [`ConfigError`] ever reach the process boundary.

use std::path::PathBuf;
use thiserror::Error;

/// HTTP status codes that mark an executor failure as permanent.
const PERMANENT_STATUS_CODES: [u16; 2] = [403, 404];

/// A delivery payload could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid JSON or does not match any envelope.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope is missing the section its job type requires.
    #[error("job '{job}' is missing '{field}'")]
    MissingSection {
        /// The job type of the envelope.
        job: String,
        /// The absent top-level field.
        field: &'static str,
    },
}

/// A well-formed cache clear request that cannot be honoured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Cache eviction is only supported for the disk strategy.
    #[error("cache strategy '{0}' does not support eviction")]
    UnsupportedStrategy(String),

    /// No cache root is configured.
    #[error("cache path is empty")]
    EmptyCachePath,

    /// A required request field is empty.
    #[error("cache request field '{0}' is empty")]
    EmptyField(&'static str),

    /// A path segment would escape the cache root.
    #[error("cache request segment '{0}' is not a plain directory name")]
    UnsafeSegment(String),

    /// The request is not a cache delete.
    #[error("unsupported cache request: resource '{resource}', action '{action}'")]
    UnsupportedRequest {
        /// The requested resource.
        resource: String,
        /// The requested action.
        action: String,
    },
}

/// An error reported by an executor backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutorError {
    /// The HTTP-style status of the failure, if the backend reported one.
    pub status: Option<u16>,
    /// The error text. Backends without a status prefix it with the code.
    pub message: String,
}

impl ExecutorError {
    /// Creates an error without a status code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Creates an error from an HTTP response status and body.
    #[must_use]
    pub fn http(status: u16, body: impl AsRef<str>) -> Self {
        Self {
            status: Some(status),
            message: format!("{status} {}", body.as_ref()).trim_end().to_string(),
        }
    }

    /// Whether retrying can never help (forbidden or not found).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        if let Some(status) = self.status {
            return PERMANENT_STATUS_CODES.contains(&status);
        }
        self.message
            .get(..3)
            .and_then(|prefix| prefix.parse::<u16>().ok())
            .is_some_and(|code| PERMANENT_STATUS_CODES.contains(&code))
    }
}

/// The outcome of an isolated dispatch unit that did not complete normally.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The backend returned an error.
    #[error("{0}")]
    Executor(#[from] ExecutorError),

    /// The unit panicked.
    #[error("dispatch unit terminated abnormally: {0}")]
    Panicked(String),

    /// The unit exceeded the configured dispatch timeout and was aborted.
    #[error("dispatch unit timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The unit was cancelled before it produced a result.
    #[error("dispatch unit was cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether the failure is a permanent client-side condition.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Executor(err) if err.is_permanent())
    }
}

/// Deleting a cache directory failed.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The filesystem refused the deletion.
    #[error("failed to remove {path}: {source}")]
    Remove {
        /// The directory being removed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The eviction unit terminated abnormally.
    #[error("cache eviction unit terminated abnormally: {0}")]
    Panicked(String),

    /// The eviction unit exceeded the configured timeout and was aborted.
    #[error("cache eviction timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The eviction unit was cancelled before it finished.
    #[error("cache eviction was cancelled")]
    Cancelled,
}

/// The build status update call failed.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The request could not be sent or its response read.
    #[error("status update request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The API answered with something other than 200.
    #[error("status update rejected with HTTP {status}: {body}")]
    Rejected {
        /// The response status code.
        status: u16,
        /// The response body.
        body: String,
    },
}

/// Publishing a verify envelope to the retry queue failed.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The envelope could not be serialized.
    #[error("failed to encode retry envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker rejected or failed the publish.
    #[error("failed to publish to retry queue: {0}")]
    Broker(#[from] lapin::Error),

    /// The broker negatively acknowledged the publish.
    #[error("retry queue publish was not confirmed")]
    NotConfirmed,
}

/// Broker connection failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// A consumer stream ended while the connection was expected to be up.
    #[error("consumer for queue '{0}' was closed by the broker")]
    ConsumerClosed(String),

    /// Reconnection was attempted more times than allowed.
    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectLimitExceeded {
        /// Number of failed attempts.
        attempts: u32,
        /// The last connection error.
        last_error: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// A loaded value is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_error_permanent_by_status() {
        assert!(ExecutorError::http(403, "Forbidden").is_permanent());
        assert!(ExecutorError::http(404, "Not Found").is_permanent());
        assert!(!ExecutorError::http(500, "Internal Server Error").is_permanent());
    }

    #[test]
    fn test_executor_error_permanent_by_message_prefix() {
        assert!(ExecutorError::new("403 Reason: forbidden").is_permanent());
        assert!(ExecutorError::new("404").is_permanent());
        assert!(!ExecutorError::new("4").is_permanent());
        assert!(!ExecutorError::new("connection reset").is_permanent());
        assert!(!ExecutorError::new("500 Reason: 404 upstream").is_permanent());
    }

    #[test]
    fn test_http_error_message_includes_status() {
        let err = ExecutorError::http(503, "");
        assert_eq!(err.to_string(), "503");
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn test_dispatch_error_classification() {
        assert!(DispatchError::from(ExecutorError::http(404, "gone")).is_permanent());
        assert!(!DispatchError::Panicked("boom".to_string()).is_permanent());
        assert!(!DispatchError::TimedOut(std::time::Duration::from_secs(1)).is_permanent());
    }

    #[test]
    fn test_reconnect_limit_display() {
        let err = TransportError::ReconnectLimitExceeded {
            attempts: 11,
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "gave up reconnecting after 11 attempts: connection refused"
        );
    }

    #[test]
    fn test_cache_timeout_is_not_reported_as_abnormal() {
        let err = CacheError::TimedOut(std::time::Duration::from_secs(2));
        assert_eq!(err.to_string(), "cache eviction timed out after 2s");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyField("pipelineId");
        assert_eq!(err.to_string(), "cache request field 'pipelineId' is empty");
    }
}
