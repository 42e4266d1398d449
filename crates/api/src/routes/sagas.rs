//! Saga initiation and inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::TransactionId;
use messaging::{OperationContext, Producer, emit};
use saga::model::CompensationStatus;
use saga::{Saga, SagaDefinition, SagaEngine, Step, StepDefinition, stage_create};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::tenant::RequestTenant;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: Arc<SagaEngine>,
    pub producer: Arc<dyn Producer>,
}

// -- Request types --

/// A saga to start. `transactionId` is assigned when absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSagaRequest {
    pub transaction_id: Option<TransactionId>,
    pub saga_type: String,
    #[serde(default)]
    pub initiated_by: String,
    pub steps: Vec<StepDefinition>,
}

impl From<CreateSagaRequest> for SagaDefinition {
    fn from(req: CreateSagaRequest) -> Self {
        SagaDefinition {
            transaction_id: req.transaction_id.unwrap_or_default(),
            saga_type: req.saga_type,
            initiated_by: req.initiated_by,
            steps: req.steps,
        }
    }
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaAcceptedResponse {
    pub transaction_id: TransactionId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaResponse {
    pub transaction_id: TransactionId,
    pub saga_type: String,
    pub initiated_by: String,
    pub status: &'static str,
    pub steps: Vec<StepResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub step_id: String,
    pub action: &'static str,
    pub status: &'static str,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationResponse {
    pub action: &'static str,
    pub status: CompensationStatus,
    pub attempt: u32,
}

impl From<&Step> for StepResponse {
    fn from(step: &Step) -> Self {
        Self {
            step_id: step.step_id().to_string(),
            action: step.action().name(),
            status: step.status().as_str(),
            attempt: step.attempt(),
            result: step.result().cloned(),
            compensation: step.compensation().map(|c| CompensationResponse {
                action: c.action().name(),
                status: c.status(),
                attempt: c.attempt(),
            }),
        }
    }
}

impl From<&Saga> for SagaResponse {
    fn from(saga: &Saga) -> Self {
        Self {
            transaction_id: saga.transaction_id(),
            saga_type: saga.saga_type().to_string(),
            initiated_by: saga.initiated_by().to_string(),
            status: saga.status().as_str(),
            steps: saga.steps().iter().map(StepResponse::from).collect(),
            failed_step: saga.failed_step_name(),
            failure_reason: saga.failure_reason().map(str::to_string),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

// -- Handlers --

/// POST /sagas: publish a saga create command.
///
/// The saga is created asynchronously by the command consumer; the response
/// only confirms that the command was published.
#[tracing::instrument(skip(state, tenant, req), fields(tenant_id = %tenant.0.id()))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    tenant: RequestTenant,
    Json(req): Json<CreateSagaRequest>,
) -> Result<(StatusCode, Json<SagaAcceptedResponse>), ApiError> {
    let definition = SagaDefinition::from(req);
    definition.validate()?;

    let ctx = OperationContext::new(tenant.0);
    emit(state.producer.as_ref(), &ctx, |buffer| {
        stage_create(buffer, &definition)
    })
    .await?;

    metrics::counter!("saga_submitted_total", "saga_type" => definition.saga_type.clone())
        .increment(1);
    tracing::info!(
        transaction_id = %definition.transaction_id,
        saga_type = %definition.saga_type,
        "saga submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SagaAcceptedResponse {
            transaction_id: definition.transaction_id,
        }),
    ))
}

/// GET /sagas: active sagas of the request tenant.
#[tracing::instrument(skip(state, tenant))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    tenant: RequestTenant,
) -> Result<Json<Vec<SagaResponse>>, ApiError> {
    let sagas = state.engine.list_active(&tenant.0).await?;
    Ok(Json(sagas.iter().map(SagaResponse::from).collect()))
}

/// GET /sagas/{transactionId}
#[tracing::instrument(skip(state, tenant))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    tenant: RequestTenant,
    Path(transaction_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let id = TransactionId::parse_str(&transaction_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid transaction id: {e}")))?;

    let saga = state
        .engine
        .find(&tenant.0, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(SagaResponse::from(&saga)))
}
