//! Queue worker binary.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use queue_worker::cache::CacheEvictor;
use queue_worker::config::WorkerConfig;
use queue_worker::dispatch::Dispatcher;
use queue_worker::engine::{EngineSettings, MessageEngine};
use queue_worker::executor::ExecutorRouter;
use queue_worker::reporter::HttpStatusReporter;
use queue_worker::retry_queue::AmqpRetryQueue;
use queue_worker::server;
use queue_worker::telemetry::init_tracing;
use queue_worker::transport::{ConnectionManager, ConnectionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load().context("failed to load configuration")?;
    init_tracing(&config.logging);

    let router = ExecutorRouter::from_config(&config.executor)
        .context("failed to configure executor backends")?;
    let unit_timeout = config.executor.dispatch_timeout();
    let engine = MessageEngine::new(
        Dispatcher::new(Arc::new(router)).with_timeout(unit_timeout),
        CacheEvictor::new(config.ecosystem.cache.clone()).with_timeout(unit_timeout),
        Arc::new(HttpStatusReporter::new().context("failed to build status reporter")?),
        Arc::new(AmqpRetryQueue::new(&config.rabbitmq)),
        EngineSettings::from_config(&config.rabbitmq),
    );

    let state = ConnectionState::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    });

    let address = config.httpd.address();
    let health_state = state.clone();
    let health_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let health = tokio::spawn(async move {
        if let Err(err) = server::serve(&address, health_state, health_shutdown).await {
            error!(error = %err, "health endpoint failed");
        }
    });

    info!(queue = %config.rabbitmq.queue, "starting queue worker");
    let manager = ConnectionManager::new(config.rabbitmq, Arc::new(engine), state);
    let result = manager.run(wait_for_shutdown(shutdown_rx)).await;

    match result {
        Ok(()) => {
            let _ = health.await;
            info!("queue worker stopped");
            Ok(())
        }
        Err(err) => {
            health.abort();
            error!(error = %err, "broker connection lost for good");
            Err(err).context("queue consumer failed")
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    Ok(())
}
