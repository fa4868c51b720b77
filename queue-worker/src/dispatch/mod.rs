//! Build job dispatch.
//!
//! The [`Dispatcher`] resolves the executor for a build and runs the call
//! in an isolated unit. The caller observes exactly one of: a result, a
//! backend error, or abnormal termination of the unit.

mod unit;

pub use unit::{run_isolated, UnitFailure};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::errors::{DispatchError, ExecutorError};
use crate::executor::{DispatchOutcome, ExecutorRouter};
use crate::messages::{BuildConfig, JobKind};

/// Runs build jobs against executor backends.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    router: Arc<ExecutorRouter>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    /// Creates a dispatcher without a unit deadline.
    #[must_use]
    pub fn new(router: Arc<ExecutorRouter>) -> Self {
        Self {
            router,
            timeout: None,
        }
    }

    /// Sets the unit deadline; `None` waits indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dispatches one job.
    ///
    /// `start`, `stop` and `verify` call the resolved backend; `stop`
    /// carries no token. Any other job succeeds without a backend call.
    pub async fn dispatch(
        &self,
        job: &JobKind,
        config: &BuildConfig,
    ) -> Result<DispatchOutcome, DispatchError> {
        let router = Arc::clone(&self.router);
        let job = job.clone();
        let config = config.clone();

        run_isolated(run_job(router, job, config), self.timeout)
            .await?
            .map_err(DispatchError::from)
    }
}

async fn run_job(
    router: Arc<ExecutorRouter>,
    job: JobKind,
    config: BuildConfig,
) -> Result<DispatchOutcome, ExecutorError> {
    info!(
        job_id = %config.job_id,
        build_id = %config.build_id,
        job = %job,
        "submitting job"
    );

    match job {
        JobKind::Start => router.resolve(&config)?.start(&config).await,
        JobKind::Stop => {
            let config = config.without_token();
            router.resolve(&config)?.stop(&config).await
        }
        JobKind::Verify => router.resolve(&config)?.verify(&config).await,
        JobKind::Clear | JobKind::Other(_) => {
            info!(job = %job, "job type expected: 'start' or 'stop', nothing to dispatch");
            Ok(DispatchOutcome::Succeeded)
        }
    }
}
