//! Producer to consumer over the in-memory broker with renamed topics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Tenant, TenantId, TransactionId};
use messaging::topic::COMMAND_TOPIC_CHARACTER;
use messaging::{
    BrokerProducer, Consumer, ConsumerConfig, Envelope, InMemoryBroker, Inbound, MessageHandler,
    MessagingError, OperationContext, Result, RetryPolicy, Routing, TopicRegistry, emit,
    partition_key,
};
use serde_json::{Value, json};
use tokio::sync::watch;

const PHYSICAL: &str = "prod.character.command";

#[derive(Debug, Clone)]
struct Seen {
    key: Vec<u8>,
    topic: String,
    seq: u64,
    tenant: Tenant,
    trace_id: u128,
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    type Payload = Envelope<Value>;

    async fn handle(&self, ctx: &OperationContext, message: Inbound<Self::Payload>) -> Result<()> {
        self.seen.lock().unwrap().push(Seen {
            key: message.key,
            topic: message.topic,
            seq: message.payload.body["seq"].as_u64().unwrap_or_default(),
            tenant: ctx.tenant().clone(),
            trace_id: ctx.span().trace_id(),
        });
        Ok(())
    }
}

fn registry() -> Arc<TopicRegistry> {
    Arc::new(TopicRegistry::from_map(HashMap::from([(
        COMMAND_TOPIC_CHARACTER.to_string(),
        PHYSICAL.to_string(),
    )])))
}

#[tokio::test]
async fn keyed_messages_arrive_in_order_with_operation_context() {
    let broker = InMemoryBroker::new(4);
    let topics = registry();
    let producer = BrokerProducer::new(
        Arc::new(broker.clone()),
        Arc::clone(&topics),
        RetryPolicy::none(),
    );
    let ctx = OperationContext::new(Tenant::new(TenantId::new(), "GMS", 83, 1));

    let result: std::result::Result<(), MessagingError> = emit(&producer, &ctx, |buffer| {
        for seq in 0..20u64 {
            let character = 1 + (seq % 2) as u32;
            buffer.put_envelope(
                COMMAND_TOPIC_CHARACTER,
                partition_key(character.into()),
                &Envelope::new(TransactionId::new(), "AWARD_EXPERIENCE", json!({ "seq": seq }))
                    .with_routing(Routing::character(character).world(0).channel(1)),
            )?;
        }
        Ok(())
    })
    .await;
    result.unwrap();

    assert_eq!(broker.sent(PHYSICAL).len(), 20);
    assert!(broker.sent(COMMAND_TOPIC_CHARACTER).is_empty());

    let recorder = Arc::new(Recorder::default());
    let (shutdown, rx) = watch::channel(false);
    let handle = Consumer::new(
        ConsumerConfig::new("character_command", "fabric-test", COMMAND_TOPIC_CHARACTER),
        Arc::new(broker.clone()),
        Arc::clone(&topics),
        Arc::clone(&recorder),
    )
    .spawn(rx);

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.seen().len() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("not every message was consumed");

    let seen = recorder.seen();
    assert!(seen.iter().all(|s| s.topic == COMMAND_TOPIC_CHARACTER));
    assert!(seen.iter().all(|s| &s.tenant == ctx.tenant()));
    assert!(seen.iter().all(|s| s.trace_id == ctx.span().trace_id()));

    for character in [1u64, 2] {
        let key = partition_key(character);
        let order: Vec<u64> = seen.iter().filter(|s| s.key == key).map(|s| s.seq).collect();
        assert_eq!(order.len(), 10);
        assert!(order.windows(2).all(|w| w[0] < w[1]), "out of order: {order:?}");
    }

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn failed_operation_publishes_nothing() {
    let broker = InMemoryBroker::new(1);
    let producer = BrokerProducer::new(Arc::new(broker.clone()), registry(), RetryPolicy::none());
    let ctx = OperationContext::new(Tenant::new(TenantId::new(), "GMS", 83, 1));

    let result: std::result::Result<(), MessagingError> = emit(&producer, &ctx, |buffer| {
        buffer.put_envelope(
            COMMAND_TOPIC_CHARACTER,
            partition_key(1),
            &Envelope::new(TransactionId::new(), "AWARD_EXPERIENCE", json!({ "seq": 0 })),
        )?;
        Err(MessagingError::handler("inventory full", false))
    })
    .await;

    assert!(result.is_err());
    assert!(broker.sent(PHYSICAL).is_empty());
}
