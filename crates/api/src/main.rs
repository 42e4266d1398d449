//! Saga orchestrator entry point.

use std::error::Error;
use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::routes::sagas::AppState;
use api::supervisor::Supervisor;
use messaging::{Broker, BrokerProducer, InMemoryBroker, Producer, TopicRegistry};
use saga::{SagaEngine, SagaRepository};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Partitions per topic of the in-process broker.
const IN_MEMORY_PARTITIONS: u32 = 8;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn saga_store(config: &Config) -> Result<Arc<dyn SagaStore>, Box<dyn Error>> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, sagas are kept in memory");
        return Ok(Arc::new(InMemorySagaStore::new()));
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    let store = PostgresSagaStore::new(pool);
    store.run_migrations().await?;
    tracing::info!("saga store connected to PostgreSQL");
    Ok(Arc::new(store))
}

#[cfg(feature = "kafka")]
fn broker(config: &Config) -> Result<Arc<dyn Broker>, Box<dyn Error>> {
    use messaging::broker::kafka::{KafkaBroker, KafkaConfig};

    match &config.bootstrap_servers {
        Some(servers) => Ok(Arc::new(KafkaBroker::new(KafkaConfig::new(servers))?)),
        None => {
            tracing::warn!("BOOTSTRAP_SERVERS not set, using the in-process broker");
            Ok(Arc::new(InMemoryBroker::new(IN_MEMORY_PARTITIONS)))
        }
    }
}

#[cfg(not(feature = "kafka"))]
fn broker(config: &Config) -> Result<Arc<dyn Broker>, Box<dyn Error>> {
    if config.bootstrap_servers.is_some() {
        tracing::warn!("built without the kafka feature, ignoring BOOTSTRAP_SERVERS");
    }
    Ok(Arc::new(InMemoryBroker::new(IN_MEMORY_PARTITIONS)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(config.log_format);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Store, broker and engine
    let store = saga_store(&config).await?;
    let broker = broker(&config)?;
    let topics = Arc::new(TopicRegistry::from_env());
    let producer: Arc<dyn Producer> = Arc::new(BrokerProducer::new(
        Arc::clone(&broker),
        Arc::clone(&topics),
        config.producer_retry.clone(),
    ));
    let engine = Arc::new(SagaEngine::with_config(
        SagaRepository::new(store),
        Arc::clone(&producer),
        config.engine_config(),
    ));

    // 4. Recover in-flight sagas, start consumers and the scheduler
    let supervisor = Supervisor::start(
        Arc::clone(&engine),
        broker,
        topics,
        config.supervisor_config(),
    )
    .await?;

    // 5. Serve HTTP until a signal arrives
    let app = api::create_app(Arc::new(AppState { engine, producer }), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting saga orchestrator");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 6. Drain background tasks even if the server failed
    supervisor.shutdown().await;
    served?;

    tracing::info!("saga orchestrator shut down gracefully");
    Ok(())
}
