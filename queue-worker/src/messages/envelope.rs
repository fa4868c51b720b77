//! Envelope types and payload decoding.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::DecodeError;

/// Content type of every envelope published by the worker.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An identifier that producers send either as a number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    /// Numeric identifier.
    Number(i64),
    /// Textual identifier.
    Text(String),
}

impl Identifier {
    /// Whether the identifier carries no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(text) if text.is_empty())
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// The lifecycle operation a message asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Start a build.
    Start,
    /// Stop a build.
    Stop,
    /// Verify a build deferred to the retry queue.
    Verify,
    /// Clear a cache directory.
    Clear,
    /// Anything else; dispatching it is a no-op.
    Other(String),
}

impl JobKind {
    /// The wire name of the job.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Verify => "verify",
            Self::Clear => "clear",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        match value {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "verify" => Self::Verify,
            "clear" => Self::Clear,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

/// Build configuration forwarded to executor backends.
///
/// Fields the worker does not interpret are kept in `extra` and forwarded
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Build being started or stopped.
    pub build_id: Identifier,
    /// Job the build belongs to.
    #[serde(default)]
    pub job_id: Identifier,
    /// Base URI of the upstream API.
    #[serde(default)]
    pub api_uri: String,
    /// Bearer token for the upstream API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Build annotations; one of them may name an executor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    /// Remaining backend-specific fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BuildConfig {
    /// Creates a build config with only the fields the worker reads.
    #[must_use]
    pub fn new(
        build_id: impl Into<Identifier>,
        job_id: impl Into<Identifier>,
        api_uri: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            job_id: job_id.into(),
            api_uri: api_uri.into(),
            token: Some(token.into()),
            annotations: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Returns a non-empty string annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// A copy of this config without the API token.
    #[must_use]
    pub fn without_token(&self) -> Self {
        Self {
            token: None,
            ..self.clone()
        }
    }
}

/// A decoded `start`/`stop` (or unrecognized) message.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildJobEnvelope {
    /// Requested operation.
    pub job: JobKind,
    /// Build to operate on.
    pub build_config: BuildConfig,
}

impl BuildJobEnvelope {
    /// A compact label used in log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "jobId: {}, jobType: {}, buildId: {}",
            self.build_config.job_id, self.job, self.build_config.build_id
        )
    }
}

/// A cache deletion request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheClearRequest {
    /// Always `caches`.
    #[serde(default)]
    pub resource: String,
    /// Always `delete`.
    #[serde(default)]
    pub action: String,
    /// `pipelines` or `jobs`.
    #[serde(default)]
    pub scope: String,
    /// Optional sub-directory of the cache root.
    #[serde(default)]
    pub prefix: String,
    /// Owning pipeline.
    #[serde(default)]
    pub pipeline_id: Identifier,
    /// Pipeline or job id, depending on the scope.
    #[serde(default)]
    pub id: Identifier,
}

/// A decoded `clear` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheClearEnvelope {
    /// The deletion request.
    pub cache_config: CacheClearRequest,
}

/// Payload published to the retry queue.
#[derive(Debug, Clone, Serialize)]
pub struct RetryEnvelope<'a> {
    /// Always [`JobKind::Verify`].
    pub job: JobKind,
    /// Build to verify.
    #[serde(rename = "buildConfig")]
    pub build_config: &'a BuildConfig,
}

impl<'a> RetryEnvelope<'a> {
    /// Wraps a build config in a verify envelope.
    #[must_use]
    pub fn verify(build_config: &'a BuildConfig) -> Self {
        Self {
            job: JobKind::Verify,
            build_config,
        }
    }
}

/// A decoded delivery payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Start, stop, verify or unrecognized build job.
    Build(BuildJobEnvelope),
    /// Cache directory deletion.
    CacheClear(CacheClearEnvelope),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    job: Option<JobKind>,
    #[serde(default)]
    build_config: Option<BuildConfig>,
    #[serde(default)]
    cache_config: Option<CacheClearRequest>,
}

/// Decodes and classifies a delivery payload.
///
/// `clear` jobs need a `cacheConfig`; every other job needs a `buildConfig`.
pub fn decode(payload: &[u8]) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(payload)?;
    let job = raw.job.unwrap_or_else(|| JobKind::Other(String::new()));

    if job == JobKind::Clear {
        let cache_config = raw.cache_config.ok_or_else(|| DecodeError::MissingSection {
            job: job.to_string(),
            field: "cacheConfig",
        })?;
        return Ok(Envelope::CacheClear(CacheClearEnvelope { cache_config }));
    }

    let build_config = raw.build_config.ok_or_else(|| DecodeError::MissingSection {
        job: job.to_string(),
        field: "buildConfig",
    })?;
    Ok(Envelope::Build(BuildJobEnvelope { job, build_config }))
}
