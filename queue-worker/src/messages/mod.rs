//! Queue message model.
//!
//! This module provides:
//! - Envelope types for build, cache clear and verify messages
//! - Payload decoding with job classification
//! - Dead-letter history and the redelivery count derived from it

mod envelope;
mod headers;

pub use envelope::{
    decode, BuildConfig, BuildJobEnvelope, CacheClearEnvelope, CacheClearRequest, Envelope,
    Identifier, JobKind, RetryEnvelope, CONTENT_TYPE_JSON,
};
pub use headers::{retry_count, DeathRecord};
