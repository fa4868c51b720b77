//! Upstream build status updates.
//!
//! When a build can no longer be dispatched the worker marks it failed
//! through the API that scheduled it. Callers treat this as best effort.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::errors::ReportError;
use crate::messages::BuildConfig;

/// Status written when a build is given up on.
pub const STATUS_FAILURE: &str = "FAILURE";

const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a build status update; empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// New build status.
    #[serde(skip_serializing_if = "is_blank")]
    pub status: Option<String>,
    /// Human readable reason.
    #[serde(skip_serializing_if = "is_blank")]
    pub status_message: Option<String>,
}

#[allow(clippy::ref_option)]
fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

impl StatusUpdate {
    /// A `FAILURE` update with a reason.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Some(STATUS_FAILURE.to_string()),
            status_message: Some(message.into()),
        }
    }
}

/// Writes build status to the upstream API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Applies `update` to the build identified by `config`.
    async fn update_status(
        &self,
        config: &BuildConfig,
        update: &StatusUpdate,
    ) -> Result<(), ReportError>;
}

/// Reporter that issues `PUT {apiUri}/v4/builds/{buildId}` with the
/// build's bearer token.
#[derive(Debug, Clone)]
pub struct HttpStatusReporter {
    client: reqwest::Client,
}

impl HttpStatusReporter {
    /// Creates a reporter with the default request timeout.
    pub fn new() -> Result<Self, ReportError> {
        Self::with_timeout(DEFAULT_REPORT_TIMEOUT)
    }

    /// Creates a reporter with a request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn build_url(config: &BuildConfig) -> String {
        format!(
            "{}/v4/builds/{}",
            config.api_uri.trim_end_matches('/'),
            config.build_id
        )
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn update_status(
        &self,
        config: &BuildConfig,
        update: &StatusUpdate,
    ) -> Result<(), ReportError> {
        let url = Self::build_url(config);
        debug!(url = %url, build_id = %config.build_id, "updating build status");

        let mut request = self.client.put(&url).json(update);
        if let Some(token) = config.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Captured {
        build_id: String,
        authorization: Option<String>,
        body: serde_json::Value,
    }

    async fn serve(status: StatusCode) -> (String, Arc<Mutex<Vec<Captured>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let router = Router::new().route(
            "/v4/builds/:id",
            put(
                move |Path(id): Path<String>,
                      headers: HeaderMap,
                      Json(body): Json<serde_json::Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(Captured {
                            build_id: id,
                            authorization: headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(String::from),
                            body,
                        });
                        status
                    }
                },
            ),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    #[test]
    fn test_status_update_omits_empty_fields() {
        let update = StatusUpdate {
            status: Some("FAILURE".to_string()),
            status_message: Some(String::new()),
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"status": "FAILURE"})
        );

        let message_only = StatusUpdate {
            status: None,
            status_message: Some("exhausted retries".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&message_only).unwrap(),
            serde_json::json!({"statusMessage": "exhausted retries"})
        );
    }

    #[test]
    fn test_build_url() {
        let config = BuildConfig::new(11111, 1111, "http://foo.bar/", "fake");
        assert_eq!(
            HttpStatusReporter::build_url(&config),
            "http://foo.bar/v4/builds/11111"
        );
    }

    #[tokio::test]
    async fn test_reports_failure_with_bearer_token() {
        let (api, captured) = serve(StatusCode::OK).await;
        let reporter = HttpStatusReporter::new().unwrap();
        let config = BuildConfig::new(11111, 1111, api, "fake");

        reporter
            .update_status(&config, &StatusUpdate::failure("exhausted retries"))
            .await
            .unwrap();

        let calls = captured.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].build_id, "11111");
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer fake"));
        assert_eq!(
            calls[0].body,
            serde_json::json!({"status": "FAILURE", "statusMessage": "exhausted retries"})
        );
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let (api, _captured) = serve(StatusCode::FORBIDDEN).await;
        let reporter = HttpStatusReporter::new().unwrap();
        let config = BuildConfig::new(1, 1, api, "fake");

        let err = reporter
            .update_status(&config, &StatusUpdate::failure("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        let reporter = HttpStatusReporter::with_timeout(Duration::from_secs(2)).unwrap();
        let config = BuildConfig::new(1, 1, "http://127.0.0.1:1", "fake");

        let err = reporter
            .update_status(&config, &StatusUpdate::failure("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::Request(_)));
    }
}
