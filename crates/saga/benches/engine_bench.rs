use std::sync::Arc;

use chrono::Utc;
use common::{Tenant, TenantId};
use criterion::{Criterion, criterion_group, criterion_main};
use messaging::OperationContext;
use messaging::testing::CapturingProducer;
use saga::action::{AwardAssetPayload, AwardExperiencePayload, ExperienceDistribution, ItemPayload};
use saga::{Action, Saga, SagaDefinition, SagaEngine, SagaRepository, StepOutcome, saga_type};
use saga_store::InMemorySagaStore;

fn ctx() -> OperationContext {
    OperationContext::new(Tenant::new(TenantId::new(), "GMS", 83, 1))
}

fn definition(steps: u32) -> SagaDefinition {
    let mut builder = Saga::builder().saga_type(saga_type::QUEST_REWARD);
    for i in 0..steps {
        builder = if i % 2 == 0 {
            builder.step(Action::AwardAsset(AwardAssetPayload {
                character_id: 42,
                item: ItemPayload {
                    template_id: 2000000 + i,
                    quantity: 1,
                    period: 0,
                    expiration: 0,
                },
            }))
        } else {
            builder.step(Action::AwardExperience(AwardExperiencePayload {
                character_id: 42,
                world_id: 0,
                channel_id: 1,
                distributions: vec![ExperienceDistribution {
                    experience_type: "WHITE".to_string(),
                    amount: 100,
                    attr1: 0,
                }],
            }))
        };
    }
    builder.build().unwrap()
}

fn bench_state_machine(c: &mut Criterion) {
    let tenant = Tenant::new(TenantId::new(), "GMS", 83, 1);

    c.bench_function("saga/walk_10_steps_in_memory", |b| {
        b.iter(|| {
            let now = Utc::now();
            let mut saga = Saga::new(definition(10), tenant.clone(), now).unwrap();
            saga.start(now);
            for step in 0..10 {
                saga.step_succeeded(step, None, now);
            }
            assert!(saga.status().is_terminal());
        });
    });
}

fn bench_engine_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = ctx();

    c.bench_function("saga/engine_create_and_complete_5_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let producer = CapturingProducer::new();
                let engine = SagaEngine::new(
                    SagaRepository::new(Arc::new(InMemorySagaStore::new())),
                    Arc::new(producer.clone()),
                );
                let definition = definition(5);
                let id = definition.transaction_id;
                engine.create(&ctx, definition).await.unwrap();
                for step in 0..5 {
                    engine
                        .step_completed(&ctx, id, step, StepOutcome::Succeeded { result: None })
                        .await
                        .unwrap();
                }
                assert_eq!(producer.messages().len(), 6);
            });
        });
    });
}

criterion_group!(benches, bench_state_machine, bench_engine_round_trip);
criterion_main!(benches);
