//! Capture-and-replay producer for tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::broker::Broker;
use crate::context::OperationContext;
use crate::envelope::{Message, Record};
use crate::producer::Producer;
use crate::{MessagingError, Result};

#[derive(Debug, Default)]
struct CaptureState {
    messages: Vec<Message>,
    fail_after: Option<usize>,
}

/// Records every published message instead of sending it.
///
/// Topics are kept symbolic. Captured messages can later be replayed into
/// a real [`Broker`].
#[derive(Debug, Clone, Default)]
pub struct CapturingProducer {
    state: Arc<Mutex<CaptureState>>,
}

impl CapturingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails every publish once `count` messages have been captured.
    pub fn fail_after(&self, count: usize) {
        self.lock().fail_after = Some(count);
    }

    /// Lets publishes through again after [`fail_after`](Self::fail_after).
    pub fn stop_failing(&self) {
        self.lock().fail_after = None;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Message> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    /// Sends every captured message, in capture order, through `broker`.
    pub async fn replay_into(&self, broker: &dyn Broker) -> Result<usize> {
        let messages = self.messages();
        let count = messages.len();
        for message in messages {
            broker.send(message).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl Producer for CapturingProducer {
    async fn publish(&self, ctx: &OperationContext, topic: &str, record: Record) -> Result<()> {
        let mut state = self.lock();
        if let Some(limit) = state.fail_after
            && state.messages.len() >= limit
        {
            return Err(MessagingError::BrokerUnavailable(
                "capturing producer set to fail".to_string(),
            ));
        }
        state.messages.push(Message {
            topic: topic.to_string(),
            key: record.key,
            headers: ctx.headers(),
            value: record.value,
        });
        Ok(())
    }
}
