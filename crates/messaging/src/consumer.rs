//! Consumer-group loops dispatching to typed handlers.
//!
//! Per delivery: parse headers, decode the payload, run the handler inside
//! an operation carrying the parsed tenant and span, then commit. The loop
//! never advances past a message until its handler has returned.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Tenant;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::broker::{Broker, Delivery, StartOffset, Subscription};
use crate::context::{OperationContext, SpanContext};
use crate::envelope::{Headers, Message, SPAN_HEADER, TENANT_HEADER};
use crate::retry::RetryPolicy;
use crate::topic::TopicRegistry;
use crate::{MessagingError, Result};

/// Floor for the wait between redeliveries once the retry policy is spent.
const STALLED_REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// A decoded message together with where it came from.
#[derive(Debug, Clone)]
pub struct Inbound<P> {
    /// Symbolic topic the consumer is bound to.
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Vec<u8>,
    pub payload: P,
}

/// Handles one payload type from one topic.
///
/// Handlers must be idempotent: delivery is at-least-once. Returning a
/// transient error asks for redelivery and the offset is held until the
/// handler succeeds or the consumer shuts down; any other error is logged
/// and the message is committed.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Clone + Send + Sync + 'static;

    async fn handle(&self, ctx: &OperationContext, message: Inbound<Self::Payload>) -> Result<()>;
}

/// Values extracted from message headers before dispatch.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    pub tenant: Option<Tenant>,
    pub span: Option<SpanContext>,
}

/// Extracts one concern from message headers.
pub type HeaderParser = Arc<dyn Fn(&Headers, &mut ParsedHeaders) -> Result<()> + Send + Sync>;

/// Parses the mandatory `tenant` header.
pub fn tenant_header_parser() -> HeaderParser {
    Arc::new(|headers, parsed| {
        let raw = headers
            .get(TENANT_HEADER)
            .ok_or(MessagingError::MissingHeader(TENANT_HEADER))?;
        let tenant = Tenant::from_header(raw).map_err(|e| MessagingError::InvalidHeader {
            header: TENANT_HEADER,
            reason: e.to_string(),
        })?;
        parsed.tenant = Some(tenant);
        Ok(())
    })
}

/// Parses the `span` header. A missing span starts a new trace.
pub fn span_header_parser() -> HeaderParser {
    Arc::new(|headers, parsed| {
        if let Some(raw) = headers.get(SPAN_HEADER) {
            parsed.span = Some(raw.parse()?);
        }
        Ok(())
    })
}

/// Settings for one consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub group_id: String,
    /// Symbolic topic.
    pub topic: String,
    pub start_offset: StartOffset,
    /// Redelivery policy for transient handler errors.
    pub retry: RetryPolicy,
    /// Forward messages with unusable headers to `<topic>.dlq`.
    pub dead_letter: bool,
}

impl ConsumerConfig {
    pub fn new(
        name: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            start_offset: StartOffset::Committed,
            retry: RetryPolicy::default(),
            dead_letter: true,
        }
    }

    pub fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = false;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Handled,
    HandlerFailed,
    DecodeFailed,
    DeadLettered,
    Interrupted,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Handled => "handled",
            Outcome::HandlerFailed => "handler_failed",
            Outcome::DecodeFailed => "decode_failed",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Interrupted => "interrupted",
        }
    }
}

/// A consumer-group loop bound to one topic and one handler.
pub struct Consumer<H: MessageHandler> {
    config: ConsumerConfig,
    broker: Arc<dyn Broker>,
    topics: Arc<TopicRegistry>,
    handler: Arc<H>,
    parsers: Vec<HeaderParser>,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(
        config: ConsumerConfig,
        broker: Arc<dyn Broker>,
        topics: Arc<TopicRegistry>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            config,
            broker,
            topics,
            handler,
            parsers: vec![tenant_header_parser(), span_header_parser()],
        }
    }

    /// Replaces the header parsers.
    pub fn with_header_parsers(mut self, parsers: Vec<HeaderParser>) -> Self {
        self.parsers = parsers;
        self
    }

    /// Runs the loop on a new task until `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Consumes until `shutdown` flips to true or its sender is dropped.
    ///
    /// An in-flight handler always runs to completion and is committed
    /// before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let physical = self.topics.resolve(&self.config.topic);
        let mut subscription = self
            .broker
            .subscribe(&self.config.group_id, &physical, self.config.start_offset)
            .await?;

        tracing::info!(
            consumer = %self.config.name,
            group_id = %self.config.group_id,
            topic = %physical,
            "consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };

            match delivery {
                Ok(delivery) => {
                    self.process(subscription.as_mut(), delivery, &shutdown)
                        .await?;
                }
                Err(e) => {
                    tracing::error!(consumer = %self.config.name, error = %e, "fetch failed");
                    let delay = self.config.retry.ceiling(0).max(STALLED_REDELIVERY_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(consumer = %self.config.name, "consumer stopped");
        Ok(())
    }

    async fn process(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let span = tracing::info_span!(
            "consume",
            consumer = %self.config.name,
            partition = delivery.partition,
            offset = delivery.offset,
        );
        let outcome = self.dispatch(&delivery, shutdown).instrument(span).await;

        metrics::counter!(
            "messages_consumed_total",
            "topic" => self.config.topic.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        if outcome == Outcome::Interrupted {
            return Ok(());
        }
        subscription.commit(&delivery).await
    }

    async fn dispatch(&self, delivery: &Delivery, shutdown: &watch::Receiver<bool>) -> Outcome {
        let message = &delivery.message;

        let mut parsed = ParsedHeaders::default();
        let parse_result = self
            .parsers
            .iter()
            .try_for_each(|parser| parser(&message.headers, &mut parsed));
        let tenant = match (parse_result, parsed.tenant) {
            (Ok(()), Some(tenant)) => tenant,
            (Err(e), _) => return self.reject(message, &e.to_string()).await,
            (Ok(()), None) => return self.reject(message, "no tenant resolved").await,
        };
        let span = parsed.span.map(|s| s.child()).unwrap_or_else(SpanContext::new_root);
        let ctx = OperationContext::with_span(tenant, span);

        let payload: H::Payload = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable payload, skipping");
                return Outcome::DecodeFailed;
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let inbound = Inbound {
                topic: self.config.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
                key: message.key.clone(),
                payload: payload.clone(),
            };

            let result = AssertUnwindSafe(self.handler.handle(&ctx, inbound))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(MessagingError::HandlerPanicked(panic_message(panic))));

            match result {
                Ok(()) => return Outcome::Handled,
                Err(e) if e.is_transient() => {
                    let retry = &self.config.retry;
                    let delay = if retry.should_retry(attempts) {
                        tracing::warn!(attempts, error = %e, "transient handler failure, redelivering");
                        retry.delay_for_attempt(attempts - 1)
                    } else {
                        if attempts == retry.max_attempts {
                            tracing::error!(
                                attempts,
                                error = %e,
                                "handler retries exhausted, holding offset until it succeeds"
                            );
                        }
                        retry
                            .ceiling(retry.max_attempts - 1)
                            .max(STALLED_REDELIVERY_DELAY)
                    };

                    let mut shutdown = shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            tracing::warn!(error = %e, "shutting down before redelivery");
                            return Outcome::Interrupted;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "handler failed");
                    return Outcome::HandlerFailed;
                }
            }
        }
    }

    async fn reject(&self, message: &Message, reason: &str) -> Outcome {
        if !self.config.dead_letter {
            tracing::warn!(reason, "message rejected, skipping");
            return Outcome::HandlerFailed;
        }

        let dead_letter = Message {
            topic: self.topics.dead_letter(&self.config.topic),
            ..message.clone()
        };
        let topic = dead_letter.topic.clone();
        match self.broker.send(dead_letter).await {
            Ok(()) => tracing::warn!(reason, dead_letter_topic = %topic, "message dead-lettered"),
            Err(e) => tracing::error!(reason, error = %e, "failed to dead-letter message"),
        }
        Outcome::DeadLettered
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
