//! Message consumption and retry engine.
//!
//! Every delivery ends in exactly one [`Disposition`]:
//!
//! | Situation | Disposition |
//! |---|---|
//! | payload does not decode | ack |
//! | cache clear, valid or not, deleted or not | ack |
//! | dispatch succeeded (soft failures deferred or escalated first) | ack |
//! | dispatch error classified permanent | ack |
//! | dispatch error, retries exhausted (build marked failed first) | ack |
//! | dispatch error, retries left | reject without requeue |

mod delivery;
mod stats;

pub use delivery::{Delivery, DeliveryHandle, Disposition};
pub use stats::EngineStats;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::CacheEvictor;
use crate::config::RabbitmqConfig;
use crate::dispatch::Dispatcher;
use crate::errors::DispatchError;
use crate::executor::DispatchOutcome;
use crate::messages::{decode, BuildConfig, BuildJobEnvelope, CacheClearEnvelope, Envelope, JobKind};
use crate::reporter::{StatusReporter, StatusUpdate};
use crate::retry_queue::RetryPublisher;

/// Message used when a verify outcome fails without a reason.
const VERIFY_FAILED: &str = "build verification failed";

/// Redelivery limits and queue names the engine logs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Redeliveries tolerated on the primary queue.
    pub reprocess_limit: u64,
    /// Redeliveries tolerated on the retry queue.
    pub retry_reprocess_limit: u64,
    /// Primary queue name.
    pub queue: String,
    /// Retry queue name.
    pub retry_queue: String,
}

impl EngineSettings {
    /// Reads the limits from the broker settings.
    #[must_use]
    pub fn from_config(config: &RabbitmqConfig) -> Self {
        Self {
            reprocess_limit: config.message_reprocess_limit,
            retry_reprocess_limit: config.retry_reprocess_limit(),
            queue: config.queue.clone(),
            retry_queue: config.retry_queue.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RabbitmqConfig::default())
    }
}

/// Decides and applies the disposition of each delivery.
pub struct MessageEngine {
    dispatcher: Dispatcher,
    evictor: CacheEvictor,
    reporter: Arc<dyn StatusReporter>,
    retry_queue: Arc<dyn RetryPublisher>,
    settings: EngineSettings,
    stats: Arc<EngineStats>,
}

impl MessageEngine {
    /// Creates an engine.
    pub fn new(
        dispatcher: Dispatcher,
        evictor: CacheEvictor,
        reporter: Arc<dyn StatusReporter>,
        retry_queue: Arc<dyn RetryPublisher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            dispatcher,
            evictor,
            reporter,
            retry_queue,
            settings,
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Outcome counters.
    #[must_use]
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Handles a delivery from the primary queue.
    pub async fn on_message(&self, delivery: Delivery) -> Disposition {
        self.stats.record_received();

        let disposition = match decode(delivery.payload()) {
            Ok(Envelope::CacheClear(envelope)) => self.clear_cache(envelope).await,
            Ok(Envelope::Build(envelope)) => self.run_build(envelope, delivery.retry_count()).await,
            Err(err) => {
                self.stats.record_decode_failure();
                error!(
                    error = %err,
                    queue = %self.settings.queue,
                    payload = %String::from_utf8_lossy(delivery.payload()),
                    "acknowledge, cannot decode payload"
                );
                Disposition::Ack
            }
        };

        self.finish(delivery, disposition).await
    }

    /// Handles a delivery from the retry queue.
    pub async fn on_retry_message(&self, delivery: Delivery) -> Disposition {
        self.stats.record_received();

        let disposition = match decode(delivery.payload()) {
            Ok(Envelope::Build(envelope)) => self.verify_build(envelope, delivery.retry_count()).await,
            Ok(Envelope::CacheClear(_)) => {
                warn!(
                    queue = %self.settings.retry_queue,
                    "acknowledge, cache clear jobs are not retried"
                );
                Disposition::Ack
            }
            Err(err) => {
                self.stats.record_decode_failure();
                error!(
                    error = %err,
                    queue = %self.settings.retry_queue,
                    payload = %String::from_utf8_lossy(delivery.payload()),
                    "acknowledge, cannot decode payload"
                );
                Disposition::Ack
            }
        };

        self.finish(delivery, disposition).await
    }

    async fn finish(&self, delivery: Delivery, disposition: Disposition) -> Disposition {
        delivery.settle(disposition).await;
        self.stats.record_disposition(disposition);
        disposition
    }

    async fn run_build(&self, envelope: BuildJobEnvelope, retry_count: u64) -> Disposition {
        let job = envelope.describe();
        let limit = self.settings.reprocess_limit;
        info!(job = %job, "processing");
        log_retry(&job, retry_count, limit);

        let BuildJobEnvelope { job: kind, build_config } = envelope;
        match self.dispatcher.dispatch(&kind, &build_config).await {
            Ok(outcome) => {
                info!(job = %job, success = outcome.is_success(), "acknowledge, job completed");
                if !outcome.is_success() && kind == JobKind::Start {
                    self.defer(&build_config).await;
                }
                Disposition::Ack
            }
            Err(err) => self.on_dispatch_error(&build_config, &job, &err, retry_count, limit).await,
        }
    }

    async fn verify_build(&self, envelope: BuildJobEnvelope, retry_count: u64) -> Disposition {
        let job = envelope.describe();
        let limit = self.settings.retry_reprocess_limit;
        info!(job = %job, queue = %self.settings.retry_queue, "processing");
        log_retry(&job, retry_count, limit);

        let BuildJobEnvelope { job: kind, build_config } = envelope;
        match self.dispatcher.dispatch(&kind, &build_config).await {
            Ok(outcome) => {
                info!(job = %job, success = outcome.is_success(), "acknowledge, job completed");
                if let DispatchOutcome::Failed { message } = outcome {
                    let message = message.unwrap_or_else(|| VERIFY_FAILED.to_string());
                    self.escalate(&build_config, message).await;
                }
                Disposition::Ack
            }
            Err(err) => self.on_dispatch_error(&build_config, &job, &err, retry_count, limit).await,
        }
    }

    async fn on_dispatch_error(
        &self,
        config: &BuildConfig,
        job: &str,
        err: &DispatchError,
        retry_count: u64,
        limit: u64,
    ) -> Disposition {
        if err.is_permanent() {
            info!(job = %job, error = %err, "acknowledge, permanent failure");
            return Disposition::Ack;
        }

        if retry_count >= limit {
            info!(job = %job, error = %err, retry_count, limit, "acknowledge, max retries exceeded");
            self.escalate(config, err.to_string()).await;
            return Disposition::Ack;
        }

        info!(
            job = %job,
            error = %err,
            retry_count,
            limit,
            "don't acknowledge, rejecting for redelivery"
        );
        Disposition::Reject
    }

    /// Marks the build failed upstream. Reporter errors are logged only.
    async fn escalate(&self, config: &BuildConfig, message: String) {
        self.stats.record_escalation();
        match self
            .reporter
            .update_status(config, &StatusUpdate::failure(message))
            .await
        {
            Ok(()) => info!(build_id = %config.build_id, "build status successfully updated"),
            Err(err) => error!(
                build_id = %config.build_id,
                error = %err,
                "failed to update build status to FAILURE"
            ),
        }
    }

    /// Hands a soft-failed start to the retry queue. Publish errors do not
    /// change the disposition.
    async fn defer(&self, config: &BuildConfig) {
        self.stats.record_deferred();
        let correlation_id = config.build_id.to_string();
        if let Err(err) = self.retry_queue.push(config, &correlation_id).await {
            error!(build_id = %config.build_id, error = %err, "failed to defer build to retry queue");
        }
    }

    async fn clear_cache(&self, envelope: CacheClearEnvelope) -> Disposition {
        let request = envelope.cache_config;
        info!(
            scope = %request.scope,
            pipeline_id = %request.pipeline_id,
            id = %request.id,
            "processing jobType: clear"
        );

        let dir = match self.evictor.resolve(&request) {
            Ok(dir) => dir,
            Err(err) => {
                error!(error = %err, request = ?request, "acknowledge, required conditions not met");
                return Disposition::Ack;
            }
        };

        info!(dir = %dir.display(), "cache directory to clean");
        match self.evictor.evict(dir.clone()).await {
            Ok(()) => info!(dir = %dir.display(), "acknowledge, clear cache job completed"),
            Err(err) => info!(dir = %dir.display(), error = %err, "acknowledge, clear cache job failed"),
        }
        Disposition::Ack
    }
}

impl std::fmt::Debug for MessageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEngine")
            .field("dispatcher", &self.dispatcher)
            .field("evictor", &self.evictor)
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn log_retry(job: &str, retry_count: u64, limit: u64) {
    if retry_count > 0 {
        info!(job = %job, retry_count, limit, "retrying");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::errors::{ExecutorError, PublishError, ReportError};
    use crate::executor::ExecutorRouter;
    use crate::messages::DeathRecord;
    use crate::reporter::MockStatusReporter;
    use crate::retry_queue::MockRetryPublisher;
    use crate::testing::{recorded_delivery, MockExecutor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LIMIT: u64 = 3;

    struct Harness {
        executor: Arc<MockExecutor>,
        reporter: MockStatusReporter,
        retry_queue: MockRetryPublisher,
        cache: CacheSettings,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                executor: Arc::new(MockExecutor::new("mock")),
                reporter: MockStatusReporter::new(),
                retry_queue: MockRetryPublisher::new(),
                cache: CacheSettings {
                    strategy: "disk".to_string(),
                    path: String::new(),
                },
            }
        }

        fn build(self) -> (MessageEngine, Arc<MockExecutor>) {
            let router = ExecutorRouter::new("mock", "executor").with_executor(self.executor.clone());
            let engine = MessageEngine::new(
                Dispatcher::new(Arc::new(router)),
                CacheEvictor::new(self.cache),
                Arc::new(self.reporter),
                Arc::new(self.retry_queue),
                EngineSettings {
                    reprocess_limit: LIMIT,
                    retry_reprocess_limit: LIMIT,
                    queue: "default".to_string(),
                    retry_queue: "delayed".to_string(),
                },
            );
            (engine, self.executor)
        }
    }

    fn start_payload(build_id: i64) -> Vec<u8> {
        json!({
            "job": "start",
            "buildConfig": {"buildId": build_id, "jobId": 2, "apiUri": "http://api", "token": "t"}
        })
        .to_string()
        .into_bytes()
    }

    fn verify_payload(build_id: i64) -> Vec<u8> {
        json!({"job": "verify", "buildConfig": {"buildId": build_id, "apiUri": "http://api"}})
            .to_string()
            .into_bytes()
    }

    fn redelivered(count: u64) -> Vec<DeathRecord> {
        vec![DeathRecord::new(count, "rejected")]
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked_without_dispatch() {
        let (engine, executor) = Harness::new().build();

        let payloads: [&[u8]; 3] = [b"not json", br#"{"job":"start"}"#, b"[]"];
        for payload in payloads {
            let (delivery, log) = recorded_delivery(payload.to_vec(), Vec::new());
            assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
            assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        }

        assert!(executor.calls().is_empty());
        assert_eq!(engine.stats().decode_failures(), 3);
    }

    #[tokio::test]
    async fn test_successful_start_is_acked() {
        let (engine, executor) = Harness::new().build();
        let (delivery, log) = recorded_delivery(start_payload(1), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_failed_start_is_deferred_and_acked() {
        let mut harness = Harness::new();
        harness
            .retry_queue
            .expect_push()
            .times(1)
            .withf(|config, correlation_id| {
                config.build_id.to_string() == "8609" && correlation_id == "8609"
            })
            .returning(|_, _| Ok(()));
        harness.reporter.expect_update_status().never();
        let (engine, executor) = harness.build();
        executor.set_outcome(DispatchOutcome::failed("no capacity"));

        let (delivery, log) = recorded_delivery(start_payload(8609), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert_eq!(engine.stats().deferred(), 1);
    }

    #[tokio::test]
    async fn test_failed_deferral_still_acks() {
        let mut harness = Harness::new();
        harness
            .retry_queue
            .expect_push()
            .times(1)
            .returning(|_, _| Err(PublishError::NotConfirmed));
        let (engine, executor) = harness.build();
        executor.set_outcome(DispatchOutcome::failed("no capacity"));

        let (delivery, log) = recorded_delivery(start_payload(1), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_soft_failed_stop_is_not_deferred() {
        let mut harness = Harness::new();
        harness.retry_queue.expect_push().never();
        let (engine, executor) = harness.build();
        executor.set_outcome(DispatchOutcome::failed("already gone"));

        let payload = json!({"job": "stop", "buildConfig": {"buildId": 1, "token": "t"}})
            .to_string()
            .into_bytes();
        let (delivery, _log) = recorded_delivery(payload, Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_transient_error_with_budget_is_rejected() {
        let mut harness = Harness::new();
        harness.reporter.expect_update_status().never();
        harness.retry_queue.expect_push().never();
        let (engine, executor) = harness.build();
        executor.fail_with(ExecutorError::new("500 Reason: upstream unavailable"));

        let (delivery, log) = recorded_delivery(start_payload(1), redelivered(1));

        assert_eq!(engine.on_message(delivery).await, Disposition::Reject);
        assert_eq!(log.dispositions(), vec![Disposition::Reject]);
        assert_eq!(engine.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_and_ack() {
        let mut harness = Harness::new();
        harness
            .reporter
            .expect_update_status()
            .times(1)
            .withf(|config, update| {
                config.build_id.to_string() == "5"
                    && update.status.as_deref() == Some("FAILURE")
                    && update
                        .status_message
                        .as_deref()
                        .is_some_and(|m| m.contains("upstream unavailable"))
            })
            .returning(|_, _| Ok(()));
        let (engine, executor) = harness.build();
        executor.fail_with(ExecutorError::new("500 Reason: upstream unavailable"));

        let (delivery, log) = recorded_delivery(start_payload(5), redelivered(LIMIT));

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert_eq!(engine.stats().escalations(), 1);
    }

    #[tokio::test]
    async fn test_escalation_acks_even_when_report_fails() {
        let mut harness = Harness::new();
        harness
            .reporter
            .expect_update_status()
            .times(1)
            .returning(|_, _| {
                Err(ReportError::Rejected {
                    status: 500,
                    body: String::new(),
                })
            });
        let (engine, executor) = harness.build();
        executor.fail_with(ExecutorError::new("connection reset"));

        let (delivery, log) = recorded_delivery(start_payload(5), redelivered(LIMIT + 2));

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_permanent_error_is_acked_silently() {
        let mut harness = Harness::new();
        harness.reporter.expect_update_status().never();
        harness.retry_queue.expect_push().never();
        let (engine, executor) = harness.build();
        executor.fail_with(ExecutorError::new("403 Reason: forbidden"));

        let (delivery, log) = recorded_delivery(start_payload(1), redelivered(LIMIT));

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_panicking_backend_is_transient() {
        let mut harness = Harness::new();
        harness.reporter.expect_update_status().never();
        let (engine, executor) = harness.build();
        executor.panic_on_call();

        let (delivery, log) = recorded_delivery(start_payload(1), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Reject);
        assert_eq!(log.dispositions(), vec![Disposition::Reject]);
    }

    #[tokio::test]
    async fn test_unknown_job_is_acked_without_backend_call() {
        let (engine, executor) = Harness::new().build();
        let payload = br#"{"job":"restart","buildConfig":{"buildId":1}}"#.to_vec();
        let (delivery, _log) = recorded_delivery(payload, Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_clear_deletes_and_acks() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("jobs").join("12").join("34");
        std::fs::create_dir_all(&target).unwrap();

        let mut harness = Harness::new();
        harness.cache.path = root.path().to_string_lossy().into_owned();
        let (engine, executor) = harness.build();

        let payload = br#"{"job":"clear","cacheConfig":{"resource":"caches","action":"delete","scope":"jobs","prefix":"","pipelineId":12,"id":34}}"#;
        let (delivery, log) = recorded_delivery(payload.to_vec(), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert!(!target.exists());
        assert!(root.path().join("jobs").join("12").exists());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cache_clear_is_acked() {
        let (engine, _executor) = Harness::new().build();

        let payload = br#"{"job":"clear","cacheConfig":{"resource":"caches","action":"delete","scope":"pipelines","pipelineId":1,"id":1}}"#;
        let (delivery, log) = recorded_delivery(payload.to_vec(), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_failed_cache_deletion_is_acked() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("pipelines")).unwrap();
        std::fs::write(root.path().join("pipelines").join("1"), "not a dir").unwrap();

        let mut harness = Harness::new();
        harness.cache.path = root.path().to_string_lossy().into_owned();
        let (engine, _executor) = harness.build();

        let payload = br#"{"job":"clear","cacheConfig":{"resource":"caches","action":"delete","scope":"pipelines","prefix":"","pipelineId":1,"id":1}}"#;
        let (delivery, log) = recorded_delivery(payload.to_vec(), Vec::new());

        assert_eq!(engine.on_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_verify_failure_is_escalated_immediately() {
        let mut harness = Harness::new();
        harness
            .reporter
            .expect_update_status()
            .times(1)
            .withf(|_, update| update.status_message.as_deref() == Some("pod never scheduled"))
            .returning(|_, _| Ok(()));
        harness.retry_queue.expect_push().never();
        let (engine, executor) = harness.build();
        executor.set_outcome(DispatchOutcome::failed("pod never scheduled"));

        let (delivery, log) = recorded_delivery(verify_payload(9), Vec::new());

        assert_eq!(engine.on_retry_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert_eq!(executor.calls()[0].0, "verify");
    }

    #[tokio::test]
    async fn test_verify_success_is_acked() {
        let mut harness = Harness::new();
        harness.reporter.expect_update_status().never();
        let (engine, _executor) = harness.build();

        let (delivery, log) = recorded_delivery(verify_payload(9), Vec::new());

        assert_eq!(engine.on_retry_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_verify_error_uses_retry_limit() {
        let mut harness = Harness::new();
        harness.reporter.expect_update_status().times(1).returning(|_, _| Ok(()));
        let (engine, executor) = harness.build();
        executor.fail_with(ExecutorError::new("connection reset"));

        let (early, early_log) = recorded_delivery(verify_payload(9), redelivered(LIMIT - 1));
        assert_eq!(engine.on_retry_message(early).await, Disposition::Reject);
        assert_eq!(early_log.dispositions(), vec![Disposition::Reject]);

        let (late, late_log) = recorded_delivery(verify_payload(9), redelivered(LIMIT));
        assert_eq!(engine.on_retry_message(late).await, Disposition::Ack);
        assert_eq!(late_log.dispositions(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_malformed_retry_payload_is_acked() {
        let (engine, executor) = Harness::new().build();
        let (delivery, log) = recorded_delivery(b"{".to_vec(), Vec::new());

        assert_eq!(engine.on_retry_message(delivery).await, Disposition::Ack);
        assert_eq!(log.dispositions(), vec![Disposition::Ack]);
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let config = RabbitmqConfig {
            message_reprocess_limit: 5,
            retry_message_reprocess_limit: Some(1),
            ..RabbitmqConfig::default()
        };
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.reprocess_limit, 5);
        assert_eq!(settings.retry_reprocess_limit, 1);
    }
}
