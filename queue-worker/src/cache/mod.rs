//! Disk cache eviction.
//!
//! A cache clear request resolves to one directory under the configured
//! cache root:
//!
//! ```text
//! {path}[/{prefix}]/pipelines/{pipelineId}
//! {path}[/{prefix}]/jobs/{pipelineId}/{id}
//! ```
//!
//! Deletion runs in an isolated unit and a missing directory counts as
//! success.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::CacheSettings;
use crate::dispatch::run_isolated;
use crate::errors::{CacheError, ValidationError};
use crate::messages::CacheClearRequest;

const RESOURCE_CACHES: &str = "caches";
const ACTION_DELETE: &str = "delete";
const SCOPE_PIPELINES: &str = "pipelines";

/// Resolves and deletes cache directories.
#[derive(Debug, Clone)]
pub struct CacheEvictor {
    settings: CacheSettings,
    timeout: Option<Duration>,
}

impl CacheEvictor {
    /// Creates an evictor for the configured cache.
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            timeout: None,
        }
    }

    /// Sets the deletion deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates a request and returns the directory it targets.
    pub fn resolve(&self, request: &CacheClearRequest) -> Result<PathBuf, ValidationError> {
        resolve_cache_dir(&self.settings, request)
    }

    /// Deletes `dir` recursively in an isolated unit.
    pub async fn evict(&self, dir: PathBuf) -> Result<(), CacheError> {
        info!(dir = %dir.display(), "attempting to clear cache directory");
        run_isolated(remove_tree(dir), self.timeout).await?
    }
}

/// Applies the cache path rule after validating the request.
pub fn resolve_cache_dir(
    settings: &CacheSettings,
    request: &CacheClearRequest,
) -> Result<PathBuf, ValidationError> {
    if !settings.is_disk() {
        return Err(ValidationError::UnsupportedStrategy(settings.strategy.clone()));
    }
    if settings.path.is_empty() {
        return Err(ValidationError::EmptyCachePath);
    }
    if request.resource != RESOURCE_CACHES || request.action != ACTION_DELETE {
        return Err(ValidationError::UnsupportedRequest {
            resource: request.resource.clone(),
            action: request.action.clone(),
        });
    }
    if request.scope.is_empty() {
        return Err(ValidationError::EmptyField("scope"));
    }
    if request.pipeline_id.is_empty() {
        return Err(ValidationError::EmptyField("pipelineId"));
    }
    if request.id.is_empty() {
        return Err(ValidationError::EmptyField("id"));
    }

    let mut dir = PathBuf::from(&settings.path);
    if !request.prefix.is_empty() {
        dir.push(plain_segment(&request.prefix)?);
    }
    dir.push(plain_segment(&request.scope)?);
    dir.push(plain_segment(&request.pipeline_id.to_string())?);
    if request.scope != SCOPE_PIPELINES {
        dir.push(plain_segment(&request.id.to_string())?);
    }

    Ok(dir)
}

fn plain_segment(segment: &str) -> Result<&Path, ValidationError> {
    let unsafe_segment = segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\');
    if unsafe_segment {
        return Err(ValidationError::UnsafeSegment(segment.to_string()));
    }
    Ok(Path::new(segment))
}

async fn remove_tree(dir: PathBuf) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Remove { path: dir, source }),
    }
}
