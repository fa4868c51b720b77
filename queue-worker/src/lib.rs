//! # Queue Worker
//!
//! A build dispatch worker. It consumes build lifecycle messages from an
//! AMQP queue and routes them to executor backends.
//!
//! The worker handles:
//!
//! - **Build jobs**: `start` and `stop` dispatched to a weighted or annotated executor
//! - **Cache eviction**: `clear` jobs removing a pipeline or job cache directory
//! - **Deferred verification**: soft-failed starts republished to a retry queue
//! - **Retry accounting**: dead-letter redelivery counts with escalation to `FAILURE`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use queue_worker::prelude::*;
//!
//! let config = WorkerConfig::load()?;
//! let router = ExecutorRouter::from_config(&config.executor)?;
//! let engine = MessageEngine::new(
//!     Dispatcher::new(Arc::new(router)),
//!     CacheEvictor::new(config.ecosystem.cache.clone()),
//!     Arc::new(HttpStatusReporter::new()?),
//!     Arc::new(AmqpRetryQueue::new(&config.rabbitmq)),
//!     EngineSettings::from_config(&config.rabbitmq),
//! );
//!
//! ConnectionManager::new(config.rabbitmq, Arc::new(engine), ConnectionState::new())
//!     .run(tokio::signal::ctrl_c().map(|_| ()))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod messages;
pub mod reporter;
pub mod retry_queue;
pub mod server;
pub mod telemetry;
pub mod testing;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::CacheEvictor;
    pub use crate::config::WorkerConfig;
    pub use crate::dispatch::Dispatcher;
    pub use crate::engine::{Delivery, DeliveryHandle, Disposition, EngineSettings, MessageEngine};
    pub use crate::errors::{
        CacheError, ConfigError, DecodeError, DispatchError, ExecutorError, PublishError,
        ReportError, TransportError, ValidationError,
    };
    pub use crate::executor::{DispatchOutcome, Executor, ExecutorRouter, HttpExecutor};
    pub use crate::messages::{BuildConfig, Envelope, JobKind};
    pub use crate::reporter::{HttpStatusReporter, StatusReporter, StatusUpdate};
    pub use crate::retry_queue::{AmqpRetryQueue, RetryPublisher};
    pub use crate::transport::{ConnectionManager, ConnectionState};
}
