//! Isolated units of work.
//!
//! A unit runs on its own tokio task so that a panicking or hung backend
//! call never blocks or unwinds the consumption loop.

use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::errors::{CacheError, DispatchError};

/// How a unit ended when it did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFailure {
    /// The unit panicked; carries the panic message.
    Panicked(String),
    /// The unit ran past its deadline and was aborted.
    TimedOut(Duration),
    /// The unit was cancelled by the runtime.
    Cancelled,
}

impl From<UnitFailure> for DispatchError {
    fn from(failure: UnitFailure) -> Self {
        match failure {
            UnitFailure::Panicked(message) => Self::Panicked(message),
            UnitFailure::TimedOut(limit) => Self::TimedOut(limit),
            UnitFailure::Cancelled => Self::Cancelled,
        }
    }
}

impl From<UnitFailure> for CacheError {
    fn from(failure: UnitFailure) -> Self {
        match failure {
            UnitFailure::Panicked(message) => Self::Panicked(message),
            UnitFailure::TimedOut(limit) => Self::TimedOut(limit),
            UnitFailure::Cancelled => Self::Cancelled,
        }
    }
}

/// Runs `future` on its own task and waits for exactly one outcome.
///
/// With a deadline, the task is aborted when it expires.
pub async fn run_isolated<F, T>(future: F, deadline: Option<Duration>) -> Result<T, UnitFailure>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(future);

    let joined = match deadline {
        Some(limit) => match timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(UnitFailure::TimedOut(limit));
            }
        },
        None => handle.await,
    };

    joined.map_err(|err| {
        if err.is_panic() {
            UnitFailure::Panicked(panic_message(err.into_panic()))
        } else {
            UnitFailure::Cancelled
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
