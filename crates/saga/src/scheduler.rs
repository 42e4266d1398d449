//! Periodic timeout handling and retention purge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::SagaEngine;

/// Drives [`SagaEngine::tick`] on a fixed interval.
pub struct Scheduler {
    engine: Arc<SagaEngine>,
    interval: Duration,
    retention: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<SagaEngine>, interval: Duration, retention: Duration) -> Self {
        Self {
            engine,
            interval,
            retention,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Ticks until `shutdown` flips to true. A tick in progress always
    /// finishes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "saga scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => self.run_once().await,
            }
        }
        tracing::info!("saga scheduler stopped");
    }

    /// One tick followed by one purge.
    pub async fn run_once(&self) {
        match self.engine.tick().await {
            Ok(0) => {}
            Ok(changed) => tracing::debug!(changed, "saga tick"),
            Err(e) => tracing::error!(error = %e, "saga tick failed"),
        }
        if let Err(e) = self.engine.purge(self.retention).await {
            tracing::error!(error = %e, "saga purge failed");
        }
    }
}
