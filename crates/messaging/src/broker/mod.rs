//! The append-only log the fabric runs on.
//!
//! A [`Broker`] accepts messages and hands out consumer-group
//! [`Subscription`]s. Messages with the same key land in the same partition
//! and are delivered in publish order.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;

use crate::Result;
use crate::envelope::Message;

pub use memory::InMemoryBroker;

/// Where a new subscription starts when its group has no committed offset
/// it should honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Continue from the group's committed offset (or the beginning).
    #[default]
    Committed,
    /// Only messages published after the subscription is made.
    Latest,
}

/// A message handed to a consumer, with its log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    pub partition: u32,
    pub offset: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a message to its topic. Returns once the broker acknowledges.
    async fn send(&self, message: Message) -> Result<()>;

    /// Joins `group_id` on a physical topic.
    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message. Cancel-safe: dropping the future loses nothing.
    async fn next(&mut self) -> Result<Delivery>;

    /// Marks everything up to and including `delivery` as processed for the group.
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;
}
