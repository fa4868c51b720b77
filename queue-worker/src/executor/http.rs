//! Executor backend reached over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{DispatchOutcome, Executor};
use crate::errors::ExecutorError;
use crate::messages::BuildConfig;

/// Reply body a backend may send with a 2xx status.
#[derive(Debug, Default, Deserialize)]
struct ExecutorReply {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// An executor that POSTs the build config to `{url}/start`, `{url}/stop`
/// and `{url}/verify`.
///
/// Non-2xx responses become [`ExecutorError::http`] so that 403 and 404
/// classify as permanent. A 2xx body of `{"success": false}` is a soft
/// failure.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Creates an HTTP executor.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ExecutorError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| ExecutorError::new(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, operation: &str, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        let url = format!("{}/{operation}", self.base_url);
        debug!(executor = %self.name, url = %url, build_id = %config.build_id, "calling executor");

        let response = self
            .client
            .post(&url)
            .json(config)
            .send()
            .await
            .map_err(|err| ExecutorError::new(format!("{operation} request to {url} failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ExecutorError::new(format!("failed to read {operation} response: {err}")))?;

        if !status.is_success() {
            return Err(ExecutorError::http(status.as_u16(), body));
        }

        Ok(parse_reply(&body))
    }
}

fn parse_reply(body: &str) -> DispatchOutcome {
    let reply: ExecutorReply = serde_json::from_str(body).unwrap_or_default();
    match reply.success {
        Some(false) => DispatchOutcome::Failed {
            message: reply.message,
        },
        _ => DispatchOutcome::Succeeded,
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.call("start", config).await
    }

    async fn stop(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.call("stop", config).await
    }

    async fn verify(&self, config: &BuildConfig) -> Result<DispatchOutcome, ExecutorError> {
        self.call("verify", config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(""), DispatchOutcome::Succeeded);
        assert_eq!(parse_reply("ok"), DispatchOutcome::Succeeded);
        assert_eq!(parse_reply(r#"{"success":true}"#), DispatchOutcome::Succeeded);
        assert_eq!(
            parse_reply(r#"{"success":false,"message":"no capacity"}"#),
            DispatchOutcome::failed("no capacity")
        );
    }

    #[tokio::test]
    async fn test_start_posts_build_config() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let router = Router::new().route(
            "/start",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen_clone.clone();
                async move {
                    *seen.lock() = Some(body);
                    Json(serde_json::json!({"success": true}))
                }
            }),
        );
        let url = serve(router).await;
        let executor = HttpExecutor::new("k8s", format!("{url}/"), None).unwrap();

        let config = BuildConfig::new(42, 7, "http://api", "token");
        let outcome = executor.start(&config).await.unwrap();

        assert!(outcome.is_success());
        let body = seen.lock().clone().unwrap();
        assert_eq!(body["buildId"], 42);
        assert_eq!(body["token"], "token");
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let router = Router::new().route(
            "/stop",
            post(|| async { (StatusCode::NOT_FOUND, "build not found") }),
        );
        let url = serve(router).await;
        let executor = HttpExecutor::new("k8s", url, None).unwrap();

        let err = executor
            .stop(&BuildConfig::new(1, 1, "http://api", "t"))
            .await
            .unwrap_err();

        assert_eq!(err.status, Some(404));
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "404 build not found");
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let router = Router::new().route(
            "/start",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let url = serve(router).await;
        let executor = HttpExecutor::new("k8s", url, None).unwrap();

        let err = executor
            .start(&BuildConfig::new(1, 1, "http://api", "t"))
            .await
            .unwrap_err();

        assert!(!err.is_permanent());
    }
}
