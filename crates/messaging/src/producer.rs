use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::Broker;
use crate::context::OperationContext;
use crate::envelope::{Message, Record};
use crate::retry::RetryPolicy;
use crate::topic::TopicRegistry;
use crate::Result;

/// Publishes staged records.
///
/// `topic` is always the symbolic name. Implementations attach the
/// operation's tenant and span headers.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, ctx: &OperationContext, topic: &str, record: Record) -> Result<()>;
}

/// Producer that resolves topics and sends through a [`Broker`], retrying
/// transient failures.
pub struct BrokerProducer {
    broker: Arc<dyn Broker>,
    topics: Arc<TopicRegistry>,
    retry: RetryPolicy,
}

impl BrokerProducer {
    pub fn new(broker: Arc<dyn Broker>, topics: Arc<TopicRegistry>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            topics,
            retry,
        }
    }
}

#[async_trait]
impl Producer for BrokerProducer {
    #[tracing::instrument(skip(self, ctx, record), fields(tenant_id = %ctx.tenant().id()))]
    async fn publish(&self, ctx: &OperationContext, topic: &str, record: Record) -> Result<()> {
        let message = Message {
            topic: self.topics.resolve(topic),
            key: record.key,
            headers: ctx.headers(),
            value: record.value,
        };

        let broker = &self.broker;
        self.retry
            .run("publish", || {
                let message = message.clone();
                async move { broker.send(message).await }
            })
            .await?;

        metrics::counter!("messages_published_total", "topic" => topic.to_string()).increment(1);
        Ok(())
    }
}
