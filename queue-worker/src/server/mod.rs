//! Health endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use tracing::info;

use crate::transport::ConnectionState;

/// Builds the health router.
pub fn router(state: ConnectionState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<ConnectionState>) -> (StatusCode, &'static str) {
    if state.is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

/// Serves the health router on `address` until `shutdown` resolves.
pub async fn serve<F>(address: &str, state: ConnectionState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "health endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
