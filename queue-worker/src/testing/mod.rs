//! Test doubles for the queue worker.
//!
//! This module provides:
//! - A recording executor backend with injectable failures
//! - In-memory deliveries that record how they were settled

mod deliveries;
mod mocks;

pub use deliveries::{recorded_delivery, DispositionLog, RecordingHandle};
pub use mocks::MockExecutor;
