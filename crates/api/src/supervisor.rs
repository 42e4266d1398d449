//! Owns the long-lived background tasks and their shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use messaging::{Broker, RetryPolicy, TopicRegistry};
use saga::{SagaEngine, Scheduler, spawn_consumers};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long [`Supervisor::shutdown`] waits for a task before abandoning it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Background task settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub consumer_group_id: String,
    pub consumer_retry: RetryPolicy,
    pub tick_interval: Duration,
    pub retention: Duration,
}

/// Consumers and scheduler of one orchestrator process.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<messaging::Result<()>>>,
    scheduler: JoinHandle<()>,
}

impl Supervisor {
    /// Recovers in-flight sagas, then starts consuming and ticking.
    pub async fn start(
        engine: Arc<SagaEngine>,
        broker: Arc<dyn Broker>,
        topics: Arc<TopicRegistry>,
        config: SupervisorConfig,
    ) -> saga::Result<Self> {
        let resumed = engine.recover().await?;
        tracing::info!(resumed, "saga recovery finished");

        let (shutdown, rx) = watch::channel(false);
        let consumers = spawn_consumers(
            Arc::clone(&engine),
            broker,
            topics,
            &config.consumer_group_id,
            config.consumer_retry,
            &rx,
        );
        let scheduler = Scheduler::new(engine, config.tick_interval, config.retention).spawn(rx);

        tracing::info!(
            consumers = consumers.len(),
            group_id = %config.consumer_group_id,
            "orchestrator started"
        );
        Ok(Self {
            shutdown,
            consumers,
            scheduler,
        })
    }

    /// A receiver that flips to true once shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signals every task and waits for in-flight work to finish.
    pub async fn shutdown(self) {
        tracing::info!("stopping orchestrator tasks");
        let _ = self.shutdown.send(true);

        for consumer in self.consumers {
            match tokio::time::timeout(DRAIN_TIMEOUT, consumer).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::error!(error = %e, "consumer exited with error"),
                Ok(Err(e)) => tracing::error!(error = %e, "consumer task panicked"),
                Err(_) => tracing::warn!("consumer did not stop in time"),
            }
        }
        match tokio::time::timeout(DRAIN_TIMEOUT, self.scheduler).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "scheduler task panicked"),
            Err(_) => tracing::warn!("scheduler did not stop in time"),
        }
        tracing::info!("orchestrator tasks stopped");
    }
}
