//! Worker startup and lifecycle

use crate::{WorkerConfig, WorkerState};
use keyward_core::{KeyStore, MemoryKeyStore, PgKeyStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run the worker until Ctrl-C
pub async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    run_worker_with_shutdown(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await
}

/// Run the worker until `shutdown_signal` resolves
pub async fn run_worker_with_shutdown(
    config: WorkerConfig,
    shutdown_signal: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let keyward = config.resolve()?;
    let interval = Duration::from_secs(config.maintenance_interval_secs.max(1));

    match config.database_url(&keyward) {
        Some(url) => {
            let store = Arc::new(PgKeyStore::connect(url, config.max_connections).await?);
            info!("Connected to PostgreSQL key store");
            let state = Arc::new(WorkerState::new(Arc::clone(&store), keyward)?);
            serve(state, interval, shutdown_signal).await?;
            store.pool().close().await;
        }
        None => {
            warn!("Using in-memory key store - data will NOT persist!");
            let state = Arc::new(WorkerState::new(Arc::new(MemoryKeyStore::new()), keyward)?);
            serve(state, interval, shutdown_signal).await?;
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Recover interrupted rotations, then run maintenance until shutdown
///
/// Rotations still queued or running when the signal arrives are allowed
/// to finish. Rotations owned by other live engines on the same store are
/// left alone; their leases keep them off the recovery list.
pub async fn serve<S: KeyStore>(
    state: Arc<WorkerState<S>>,
    maintenance_interval: Duration,
    shutdown_signal: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let recovered = state.rotations.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "Marked interrupted rotations as failed");
    }
    info!(
        batch_size = state.config.rotation.batch_size,
        share_base_url = %state.config.sharing.base_url,
        "Keyward worker ready"
    );

    let mut ticker = tokio::time::interval(maintenance_interval);
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => break,
            _ = ticker.tick() => maintain(&state).await,
        }
    }

    info!("Shutting down, waiting for running rotations");
    state.rotations.shutdown().await;
    Ok(())
}

/// One maintenance pass; failures are logged and retried on the next tick
async fn maintain<S: KeyStore>(state: &WorkerState<S>) {
    let limiter = state.shares.limiter();
    limiter.prune();

    match state.rotations.recover_interrupted().await {
        Ok(0) => {}
        Ok(recovered) => warn!(recovered, "Marked abandoned rotations as failed"),
        Err(e) => warn!(error = %e, "Rotation recovery pass failed"),
    }
    let pruned_logs = match state.shares.prune_access_logs().await {
        Ok(pruned) => pruned,
        Err(e) => {
            warn!(error = %e, "Access log pruning failed");
            0
        }
    };

    debug!(
        tracked = limiter.tracked(),
        running_rotations = state.rotations.running(),
        pruned_logs,
        "Maintenance pass"
    );
}
