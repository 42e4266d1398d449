//! Consumer handlers feeding the engine.

use std::sync::Arc;

use async_trait::async_trait;
use messaging::topic::COMMAND_TOPIC_SAGA;
use messaging::{
    Broker, Consumer, ConsumerConfig, Envelope, Inbound, MessageHandler, OperationContext,
    RetryPolicy, StatusEnvelope, TopicRegistry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::action::status_topics;
use crate::engine::SagaEngine;
use crate::error::SagaError;
use crate::events::SAGA_CREATE;
use crate::model::SagaDefinition;
use crate::router::{CorrelationRouter, Routed};

/// Creates sagas from the saga command topic.
pub struct SagaCommandHandler {
    engine: Arc<SagaEngine>,
}

impl SagaCommandHandler {
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageHandler for SagaCommandHandler {
    type Payload = Envelope<SagaDefinition>;

    async fn handle(
        &self,
        ctx: &OperationContext,
        message: Inbound<Self::Payload>,
    ) -> messaging::Result<()> {
        let envelope = message.payload;
        if envelope.kind != SAGA_CREATE {
            tracing::debug!(kind = %envelope.kind, "ignoring saga command");
            return Ok(());
        }

        match self.engine.create(ctx, envelope.body).await {
            Ok(_) => Ok(()),
            Err(SagaError::Validation(reason)) => {
                tracing::warn!(
                    transaction_id = %envelope.transaction_id,
                    %reason,
                    "rejected saga create"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Feeds domain status events to the correlation router.
pub struct StatusEventHandler {
    router: CorrelationRouter,
}

impl StatusEventHandler {
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self {
            router: CorrelationRouter::new(engine),
        }
    }
}

#[async_trait]
impl MessageHandler for StatusEventHandler {
    type Payload = StatusEnvelope;

    async fn handle(
        &self,
        ctx: &OperationContext,
        message: Inbound<Self::Payload>,
    ) -> messaging::Result<()> {
        let routed = self
            .router
            .route(ctx, &message.topic, &message.payload)
            .await?;
        if routed == Routed::Unmatched {
            tracing::trace!(topic = %message.topic, kind = %message.payload.kind, "status not awaited");
        }
        Ok(())
    }
}

/// Starts the saga command consumer and one consumer per status topic.
pub fn spawn_consumers(
    engine: Arc<SagaEngine>,
    broker: Arc<dyn Broker>,
    topics: Arc<TopicRegistry>,
    group_id: &str,
    retry: RetryPolicy,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<messaging::Result<()>>> {
    let mut handles = Vec::new();

    let commands = ConsumerConfig::new("saga_command", group_id, COMMAND_TOPIC_SAGA)
        .retry(retry.clone());
    handles.push(
        Consumer::new(
            commands,
            Arc::clone(&broker),
            Arc::clone(&topics),
            Arc::new(SagaCommandHandler::new(Arc::clone(&engine))),
        )
        .spawn(shutdown.clone()),
    );

    let statuses = Arc::new(StatusEventHandler::new(engine));
    for topic in status_topics() {
        let config = ConsumerConfig::new(format!("saga_status:{topic}"), group_id, topic)
            .retry(retry.clone());
        handles.push(
            Consumer::new(
                config,
                Arc::clone(&broker),
                Arc::clone(&topics),
                Arc::clone(&statuses),
            )
            .spawn(shutdown.clone()),
        );
    }
    handles
}
