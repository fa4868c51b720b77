//! Executor backends.
//!
//! An [`Executor`] starts, stops and verifies builds on some external
//! system. The [`ExecutorRouter`] maps backend names to executors and picks
//! one per build: an explicit annotation wins, otherwise the process-wide
//! default chosen once at boot by [`select_weighted`].

mod http;
mod router;
mod selection;

pub use http::HttpExecutor;
pub use router::ExecutorRouter;
pub use selection::{select_weighted, ExecutorDescriptor};

use async_trait::async_trait;

use crate::errors::ExecutorError;
use crate::messages::BuildConfig;

/// What a backend reported for a call that completed without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The backend accepted the request.
    Succeeded,
    /// The backend answered but could not do the work.
    Failed {
        /// Backend-supplied reason.
        message: Option<String>,
    },
}

impl DispatchOutcome {
    /// Creates a soft failure with a reason.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: Some(message.into()),
        }
    }

    /// Whether the backend reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The failure reason, if the outcome is a failure that carries one.
    #[must_use]
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::Failed { message } => message.as_deref(),
            Self::Succeeded => None,
        }
    }
}

/// A build execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name the backend is registered under.
    fn name(&self) -> &str;

    /// Starts a build.
    async fn start(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError>;

    /// Stops a build. The config never carries the API token.
    async fn stop(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError>;

    /// Checks on a build whose start was deferred to the retry queue.
    ///
    /// Backends that cannot inspect builds report success.
    async fn verify(&self, _config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        Ok(DispatchOutcome::Succeeded)
    }
}
