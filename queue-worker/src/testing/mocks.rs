//! Mock executor backends.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use crate::errors::ExecutorError;
use crate::executor::{DispatchOutcome, Executor};
use crate::messages::BuildConfig;

/// An executor that records calls and answers with a configurable result.
#[derive(Debug)]
pub struct MockExecutor {
    name: String,
    outcome: Mutex<DispatchOutcome>,
    error: Mutex<Option<ExecutorError>>,
    delay: Mutex<Option<Duration>>,
    panics: Mutex<bool>,
    calls: Mutex<Vec<(String, BuildConfig)>>,
}

impl MockExecutor {
    /// Creates a mock that succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Mutex::new(DispatchOutcome::Succeeded),
            error: Mutex::new(None),
            delay: Mutex::new(None),
            panics: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the outcome returned by every call.
    pub fn set_outcome(&self, outcome: DispatchOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Makes every call fail with `error`.
    pub fn fail_with(&self, error: ExecutorError) {
        *self.error.lock() = Some(error);
    }

    /// Makes every call panic.
    pub fn panic_on_call(&self) {
        *self.panics.lock() = true;
    }

    /// Makes every call sleep before answering.
    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Operation name and config of each call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, BuildConfig)> {
        self.calls.lock().clone()
    }

    /// Clears recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    async fn answer(&self, operation: &str, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.calls.lock().push((operation.to_string(), config.clone()));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.panics.lock() {
            panic!("{} executor crashed during {operation}", self.name);
        }
        if let Some(error) = self.error.lock().clone() {
            return Err(error);
        }
        Ok(self.outcome.lock().clone())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.answer("start", config).await
    }

    async fn stop(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.answer("stop", config).await
    }

    async fn verify(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.answer("verify", config).await
    }
}
