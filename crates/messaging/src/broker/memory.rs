use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Broker, Delivery, StartOffset, Subscription};
use crate::envelope::Message;
use crate::{MessagingError, Result};

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<Message>>,
    /// Every message in publish order, across partitions.
    sent: Vec<Message>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    committed: HashMap<(String, String, u32), u64>,
    failing_sends: u32,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    partitions: u32,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory partitioned log with consumer-group offsets.
///
/// Used by tests and by the orchestrator when no external broker is
/// configured. One subscription per group reads all partitions of a topic.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InMemoryBroker {
    /// Creates a broker whose topics have `partitions` partitions each.
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                partitions: partitions.max(1),
            }),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.partitions
    }

    /// Partition a key maps to. Empty keys go to partition 0.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        if key.is_empty() {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partitions)) as u32
    }

    /// Every message published to a physical topic, in publish order.
    pub fn sent(&self, topic: &str) -> Vec<Message> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|log| log.sent.clone())
            .unwrap_or_default()
    }

    /// Next offset the group will read on a partition, if it ever committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Makes the next `count` sends fail with a transient error.
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.lock().failing_sends = count;
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, message: Message) -> Result<()> {
        let partition = self.partition_for(&message.key) as usize;
        {
            let mut state = self.inner.lock();
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(MessagingError::BrokerUnavailable(
                    "in-memory broker refusing sends".to_string(),
                ));
            }
            let log = state
                .topics
                .entry(message.topic.clone())
                .or_insert_with(|| TopicLog {
                    partitions: vec![Vec::new(); self.inner.partitions as usize],
                    sent: Vec::new(),
                });
            log.partitions[partition].push(message.clone());
            log.sent.push(message);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>> {
        let partitions = self.inner.partitions;
        let positions = {
            let state = self.inner.lock();
            (0..partitions)
                .map(|p| match start {
                    StartOffset::Committed => state
                        .committed
                        .get(&(group_id.to_string(), topic.to_string(), p))
                        .copied()
                        .unwrap_or(0),
                    StartOffset::Latest => state
                        .topics
                        .get(topic)
                        .map(|log| log.partitions[p as usize].len() as u64)
                        .unwrap_or(0),
                })
                .collect()
        };

        tracing::debug!(group_id, topic, ?start, "joined consumer group");

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            positions,
            next_partition: 0,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    group_id: String,
    topic: String,
    positions: Vec<u64>,
    next_partition: usize,
}

impl MemorySubscription {
    /// Takes the next available message, rotating across partitions.
    fn poll(&mut self) -> Option<Delivery> {
        let state = self.inner.lock();
        let log = state.topics.get(&self.topic)?;
        let count = self.positions.len();

        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let offset = self.positions[partition];
            if let Some(message) = log.partitions[partition].get(offset as usize) {
                self.positions[partition] = offset + 1;
                self.next_partition = (partition + 1) % count;
                return Some(Delivery {
                    message: message.clone(),
                    partition: partition as u32,
                    offset,
                });
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery> {
        loop {
            let inner = Arc::clone(&self.inner);
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.poll() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        self.inner.lock().committed.insert(
            (self.group_id.clone(), self.topic.clone(), delivery.partition),
            delivery.offset + 1,
        );
        Ok(())
    }
}
