//! Name-keyed executor lookup.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{select_weighted, Executor, ExecutorDescriptor, HttpExecutor};
use crate::config::ExecutorConfig;
use crate::errors::{ConfigError, ExecutorError};
use crate::messages::BuildConfig;

/// Prefix of the pre-release form of build annotations.
const BETA_PREFIX: &str = "beta.";

/// Registry of executor backends with a process-wide default.
///
/// The default is fixed at construction; a build annotation naming a
/// registered backend overrides it for that build only.
pub struct ExecutorRouter {
    executors: HashMap<String, Arc<dyn Executor>>,
    default_name: String,
    annotation_key: String,
}

impl ExecutorRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new(default_name: impl Into<String>, annotation_key: impl Into<String>) -> Self {
        Self {
            executors: HashMap::new(),
            default_name: default_name.into(),
            annotation_key: annotation_key.into(),
        }
    }

    /// Registers a backend under its own name.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    /// Registers a backend, builder style.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    /// Chooses the process-wide default: a weighted pick, or `fallback`
    /// when no descriptor carries weight.
    pub fn select_default<R>(descriptors: &[ExecutorDescriptor], fallback: &str, rng: &mut R) -> String
    where
        R: Rng + ?Sized,
    {
        select_weighted(descriptors, rng)
            .map_or_else(|| fallback.to_string(), |descriptor| descriptor.name.clone())
    }

    /// Builds a router of HTTP backends from configuration.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        let default_name =
            Self::select_default(&config.backends, &config.plugin, &mut rand::thread_rng());
        let mut router = Self::new(default_name, config.annotation_key.clone());

        for descriptor in &config.backends {
            let url = descriptor.url.as_deref().ok_or_else(|| {
                ConfigError::Invalid(format!("executor backend '{}' has no url", descriptor.name))
            })?;
            let timeout = descriptor
                .timeout_secs
                .filter(|secs| *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
            let executor = HttpExecutor::new(&descriptor.name, url, timeout)
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            router.register(Arc::new(executor));
        }

        info!(
            default_executor = %router.default_name,
            executors = ?router.names(),
            "executor router ready"
        );
        Ok(router)
    }

    /// The process-wide default backend name.
    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Registered backend names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves the backend for a build.
    ///
    /// The annotation is read under its configured key, then under the
    /// `beta.`-prefixed key older pipelines still send. An annotation
    /// naming an unknown backend falls back to the default.
    pub fn resolve(&self, config: &BuildConfig) -> Result<Arc<dyn Executor>, ExecutorError> {
        let requested = config
            .annotation(&self.annotation_key)
            .or_else(|| config.annotation(&format!("{BETA_PREFIX}{}", self.annotation_key)));
        if let Some(requested) = requested {
            if let Some(executor) = self.executors.get(requested) {
                return Ok(Arc::clone(executor));
            }
            warn!(
                requested = %requested,
                default_executor = %self.default_name,
                build_id = %config.build_id,
                "annotated executor is not registered, using default"
            );
        }

        self.executors
            .get(&self.default_name)
            .cloned()
            .ok_or_else(|| {
                ExecutorError::new(format!(
                    "no executor registered for '{}'",
                    self.default_name
                ))
            })
    }
}

impl std::fmt::Debug for ExecutorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRouter")
            .field("executors", &self.names())
            .field("default_name", &self.default_name)
            .field("annotation_key", &self.annotation_key)
            .finish()
    }
}
