//! `dns-worker` binary: wires configuration, the Redis log, the resolution
//! engine and the health surface, then runs the worker until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dns_worker::health::{self, HealthState};
use dns_worker::resolver::{random_source, DigLookup, ResolutionEngine};
use dns_worker::stream::redis::RedisStream;
use dns_worker::stream::StreamLog;
use dns_worker::telemetry::{self, Tracer};
use dns_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging();

    let config = WorkerConfig::load().context("failed to load configuration")?;
    info!(
        service = %config.service_name(),
        location = %config.location,
        redis_url = %config.redis_url,
        sequential_probability = config.chaos.sequential_probability,
        error_probability = config.chaos.error_probability,
        chaos_seed = ?config.chaos_seed,
        publish_failure_policy = %config.publish_failure_policy,
        "starting DNS worker"
    );

    let log: Arc<dyn StreamLog> = Arc::new(
        RedisStream::connect(&config.redis_url, config.block())
            .await
            .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?,
    );
    log.ping().await.context("Redis did not answer ping")?;
    info!("connected to Redis");

    let tracer = Tracer::default();
    let lookup =
        DigLookup::new(config.resolver_program.clone()).with_timeout(config.lookup_timeout());
    let engine = ResolutionEngine::new(
        Arc::new(lookup),
        random_source(config.chaos_seed),
        tracer.clone(),
        config.chaos,
    );
    let worker = Worker::new(Arc::clone(&log), engine, tracer, &config);

    let cancel = CancellationToken::new();
    tokio::spawn(handle_signals(cancel.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health surface on {addr}"))?;
    let health_state = Arc::new(HealthState::new(Arc::clone(&log), worker.stats(), &config));
    let health_task = tokio::spawn(health::serve(listener, health_state, cancel.clone()));

    let mut worker_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // The loop only returns on its own when startup fails.
    let outcome = tokio::select! {
        joined = &mut worker_task => Some(joined),
        () = cancel.cancelled() => None,
    };
    let outcome = match outcome {
        Some(joined) => {
            cancel.cancel();
            joined
        },
        None => {
            info!(grace_ms = config.shutdown_grace_ms, "shutting down");
            match tokio::time::timeout(config.shutdown_grace(), &mut worker_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("worker did not stop within the grace period, aborting");
                    worker_task.abort();
                    Ok(Ok(()))
                },
            }
        },
    };

    if let Err(e) = health_task.await.context("health surface panicked")? {
        error!(error = %e, "health surface failed");
    }

    outcome
        .context("worker task panicked")?
        .context("worker failed")?;
    info!("DNS worker stopped");
    Ok(())
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
async fn handle_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
    cancel.cancel();
}
