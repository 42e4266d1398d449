//! Integration tests for the orchestrator HTTP surface.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::routes::sagas::AppState;
use api::tenant::{MAJOR_VERSION_HEADER, MINOR_VERSION_HEADER, REGION_HEADER, TENANT_ID_HEADER};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Tenant, TenantId, TransactionId};
use messaging::envelope::TENANT_HEADER;
use messaging::topic::COMMAND_TOPIC_SAGA;
use messaging::{
    BrokerProducer, InMemoryBroker, OperationContext, Producer, RetryPolicy, TopicRegistry,
};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{SagaDefinition, SagaEngine, SagaRepository, spawn_consumers};
use saga_store::InMemorySagaStore;
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    router: axum::Router,
    broker: InMemoryBroker,
    engine: Arc<SagaEngine>,
    tenant: Tenant,
}

fn setup() -> TestApp {
    let broker = InMemoryBroker::new(4);
    let producer: Arc<dyn Producer> = Arc::new(BrokerProducer::new(
        Arc::new(broker.clone()),
        Arc::new(TopicRegistry::identity()),
        RetryPolicy::none(),
    ));
    let engine = Arc::new(SagaEngine::new(
        SagaRepository::new(Arc::new(InMemorySagaStore::new())),
        Arc::clone(&producer),
    ));
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        producer,
    });

    TestApp {
        router: api::create_app(state, get_metrics_handle()),
        broker,
        engine,
        tenant: Tenant::new(TenantId::new(), "GMS", 83, 1),
    }
}

impl TestApp {
    fn request(&self, method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_ID_HEADER, self.tenant.id().to_string())
            .header(REGION_HEADER, self.tenant.region())
            .header(MAJOR_VERSION_HEADER, self.tenant.major_version().to_string())
            .header(MINOR_VERSION_HEADER, self.tenant.minor_version().to_string())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn post_saga(&self, body: Value) -> (StatusCode, Value) {
        self.send(
            self.request("POST", "/sagas")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

fn award_asset_saga() -> Value {
    json!({
        "sagaType": "quest_reward",
        "initiatedBy": "npc-conversation",
        "steps": [{
            "stepId": "award-1",
            "action": "AwardAsset",
            "payload": {
                "characterId": 42,
                "item": {"templateId": 2000000, "quantity": 3}
            }
        }]
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "saga-orchestrator");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_create_saga_publishes_command() {
    let app = setup();
    let id = TransactionId::new();
    let mut body = award_asset_saga();
    body["transactionId"] = json!(id);

    let (status, json) = app.post_saga(body).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["transactionId"], id.to_string());

    let sent = app.broker.sent(COMMAND_TOPIC_SAGA);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header(TENANT_HEADER), Some(app.tenant.to_header().as_str()));

    let envelope: messaging::Envelope<SagaDefinition> = sent[0].decode().unwrap();
    assert_eq!(envelope.transaction_id, id);
    assert_eq!(envelope.body.steps.len(), 1);
    assert_eq!(envelope.body.steps[0].step_id, "award-1");
}

#[tokio::test]
async fn test_create_saga_assigns_transaction_id() {
    let app = setup();

    let (status, json) = app.post_saga(award_asset_saga()).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let id = TransactionId::parse_str(json["transactionId"].as_str().unwrap()).unwrap();
    let envelope: messaging::Envelope<SagaDefinition> =
        app.broker.sent(COMMAND_TOPIC_SAGA)[0].decode().unwrap();
    assert_eq!(envelope.transaction_id, id);
}

#[tokio::test]
async fn test_create_saga_without_steps_is_rejected() {
    let app = setup();

    let (status, json) = app
        .post_saga(json!({"sagaType": "quest_reward", "steps": []}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("step"));
    assert!(app.broker.sent(COMMAND_TOPIC_SAGA).is_empty());
}

#[tokio::test]
async fn test_request_without_tenant_is_rejected() {
    let app = setup();

    let (status, json) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/sagas")
                .header("content-type", "application/json")
                .body(Body::from(award_asset_saga().to_string()))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("tenant_id"));
    assert!(app.broker.sent(COMMAND_TOPIC_SAGA).is_empty());
}

#[tokio::test]
async fn test_get_unknown_saga_returns_404() {
    let app = setup();

    let uri = format!("/sagas/{}", TransactionId::new());
    let (status, _) = app
        .send(app.request("GET", &uri).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .send(app.request("GET", "/sagas/not-a-uuid").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_and_list_active_sagas() {
    let app = setup();
    let definition: SagaDefinition = serde_json::from_value({
        let mut body = award_asset_saga();
        body["transactionId"] = json!(TransactionId::new());
        body
    })
    .unwrap();
    let id = definition.transaction_id;
    app.engine
        .create(&OperationContext::new(app.tenant.clone()), definition)
        .await
        .unwrap();

    let (status, json) = app
        .send(
            app.request("GET", &format!("/sagas/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["transactionId"], id.to_string());
    assert_eq!(json["status"], "Pending");
    assert_eq!(json["steps"][0]["action"], "AwardAsset");
    assert_eq!(json["steps"][0]["status"], "Dispatched");
    assert_eq!(json["steps"][0]["attempt"], 1);

    let (status, json) = app
        .send(app.request("GET", "/sagas").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);

    // Another tenant sees nothing.
    let other = TestApp {
        tenant: Tenant::new(TenantId::new(), "GMS", 83, 1),
        ..app
    };
    let (status, json) = other
        .send(other.request("GET", "/sagas").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submitted_saga_is_created_by_consumer() {
    let app = setup();
    let (shutdown, rx) = watch::channel(false);
    spawn_consumers(
        Arc::clone(&app.engine),
        Arc::new(app.broker.clone()),
        Arc::new(TopicRegistry::identity()),
        "saga-orchestrator",
        RetryPolicy::none(),
        &rx,
    );

    let (status, json) = app.post_saga(award_asset_saga()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let uri = format!("/sagas/{}", json["transactionId"].as_str().unwrap());

    let saga = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, json) = app
                .send(app.request("GET", &uri).body(Body::empty()).unwrap())
                .await;
            if status == StatusCode::OK {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("saga was not created");

    assert_eq!(saga["sagaType"], "quest_reward");
    assert_eq!(saga["initiatedBy"], "npc-conversation");
    shutdown.send(true).unwrap();
}
