pub mod broker;
pub mod buffer;
pub mod consumer;
pub mod context;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod retry;
pub mod testing;
pub mod topic;

pub use broker::{Broker, Delivery, InMemoryBroker, StartOffset, Subscription};
pub use buffer::{Buffer, emit};
pub use consumer::{
    Consumer, ConsumerConfig, HeaderParser, Inbound, MessageHandler, ParsedHeaders,
    span_header_parser, tenant_header_parser,
};
pub use context::{OperationContext, SpanContext};
pub use envelope::{
    Envelope, Headers, Message, Record, Routing, StatusEnvelope, partition_key, transaction_key,
};
pub use error::{MessagingError, Result};
pub use producer::{BrokerProducer, Producer};
pub use retry::{Backoff, RetryPolicy};
pub use topic::TopicRegistry;
