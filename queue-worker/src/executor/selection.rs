//! Weighted executor selection.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A configured executor backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    /// Backend name, also the annotation value that selects it.
    pub name: String,
    /// Relative share of builds; zero never wins a weighted pick.
    #[serde(default, alias = "weight")]
    pub weightage: u32,
    /// Base URL of an HTTP backend.
    #[serde(default)]
    pub url: Option<String>,
    /// Request timeout for an HTTP backend.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

impl ExecutorDescriptor {
    /// Creates a descriptor without backend options.
    #[must_use]
    pub fn new(name: impl Into<String>, weightage: u32) -> Self {
        Self {
            name: name.into(),
            weightage,
            url: None,
            timeout_secs: None,
        }
    }

    /// Sets the HTTP backend URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Picks a descriptor with probability `weightage / total`.
///
/// Returns `None` when the list is empty or every weight is zero; callers
/// then fall back to the configured default.
pub fn select_weighted<'a, R>(
    descriptors: &'a [ExecutorDescriptor],
    rng: &mut R,
) -> Option<&'a ExecutorDescriptor>
where
    R: Rng + ?Sized,
{
    let total: u64 = descriptors.iter().map(|d| u64::from(d.weightage)).sum();
    if total == 0 {
        return None;
    }

    let target = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    descriptors.iter().find(|descriptor| {
        cumulative += u64::from(descriptor.weightage);
        target < cumulative
    })
}
