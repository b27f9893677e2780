//! The three periodic loops: sync, monitor, scheduler
//!
//! Each loop runs its tick inline, so a slow tick delays the next one and
//! missed ticks are skipped rather than queued.

use crate::engine::Engine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Run every enabled loop until `shutdown` resolves, then close all sessions.
pub async fn run(engine: Arc<Engine>, shutdown: impl Future<Output = ()>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let config = engine.config().clone();
    let mut tasks = Vec::new();

    if config.sync.enabled {
        let engine = Arc::clone(&engine);
        tasks.push(spawn_loop("sync", config.sync_interval(), stop_rx.clone(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.synchronizer().tick().await;
            }
        }));
    }

    if let Some(monitor) = engine.monitor().cloned() {
        tasks.push(spawn_loop(
            "monitor",
            config.monitor_interval(),
            stop_rx.clone(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    if let Err(e) = monitor.tick().await {
                        error!(error = %e, "Monitor tick failed");
                    }
                }
            },
        ));
    }

    if config.scheduler.enabled {
        let scheduler = Arc::clone(engine.scheduler());
        tasks.push(spawn_loop(
            "scheduler",
            config.scheduler_interval(),
            stop_rx.clone(),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    if let Err(e) = scheduler.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            },
        ));
    }

    info!(loops = tasks.len(), "Daemon started");
    shutdown.await;
    info!("Shutdown requested, waiting for running ticks");

    let _ = stop_tx.send(true);
    futures::future::join_all(tasks).await;
    engine.shutdown().await;
    info!("Daemon stopped");
}

/// Resolves on Ctrl-C
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Ctrl-C handler failed");
        std::future::pending::<()>().await;
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(loop_name = name, period_secs = period.as_secs(), "Loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = stop.changed() => break,
            }
        }

        debug!(loop_name = name, "Loop stopped");
    })
}
