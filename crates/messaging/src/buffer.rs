//! Per-operation outbox.
//!
//! An operation stages every message it intends to publish in a [`Buffer`],
//! commits its local state, and only then flushes. If the operation fails
//! the buffer is dropped and nothing leaks to consumers.

use crate::context::OperationContext;
use crate::envelope::{Envelope, Record};
use crate::error::MessagingError;
use crate::producer::Producer;
use crate::Result;

/// Messages staged by one operation, grouped by symbolic topic.
///
/// Topics flush in the order they were first staged; records within a
/// topic keep their staging order.
#[derive(Debug, Default)]
pub struct Buffer {
    by_topic: Vec<(String, Vec<Record>)>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the records produced by `provider` on `topic`.
    ///
    /// If `provider` fails the buffer is left unchanged.
    pub fn put<F>(&mut self, topic: &str, provider: F) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<Record>>,
    {
        let records = provider()?;
        if records.is_empty() {
            return Ok(());
        }

        match self.by_topic.iter_mut().find(|(t, _)| t == topic) {
            Some((_, staged)) => staged.extend(records),
            None => self.by_topic.push((topic.to_string(), records)),
        }
        Ok(())
    }

    /// Stages a single JSON envelope.
    pub fn put_envelope<E: serde::Serialize>(
        &mut self,
        topic: &str,
        key: Vec<u8>,
        envelope: &Envelope<E>,
    ) -> Result<()> {
        self.put(topic, || Ok(vec![Record::json(key, envelope)?]))
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// Total staged records.
    pub fn len(&self) -> usize {
        self.by_topic.iter().map(|(_, records)| records.len()).sum()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.iter().map(|(topic, _)| topic.as_str())
    }

    /// Publishes every staged record, topic by topic.
    ///
    /// Stops at the first error. Records already published stay published.
    pub async fn flush(self, producer: &dyn Producer, ctx: &OperationContext) -> Result<()> {
        for (topic, records) in self.by_topic {
            for record in records {
                producer.publish(ctx, &topic, record).await?;
            }
        }
        Ok(())
    }
}

/// Runs `op` against a fresh buffer and flushes it only if `op` succeeds.
pub async fn emit<T, E, F>(
    producer: &dyn Producer,
    ctx: &OperationContext,
    op: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(&mut Buffer) -> std::result::Result<T, E>,
    E: From<MessagingError>,
{
    let mut buffer = Buffer::new();
    let value = op(&mut buffer)?;
    buffer.flush(producer, ctx).await?;
    Ok(value)
}
