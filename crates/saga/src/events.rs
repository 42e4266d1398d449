//! Saga create commands and saga status events.

use common::TransactionId;
use messaging::envelope::transaction_key;
use messaging::topic::{COMMAND_TOPIC_SAGA, EVENT_TOPIC_SAGA_STATUS};
use messaging::{Buffer, Envelope, StatusEnvelope};
use serde::{Deserialize, Serialize};

use crate::model::{Saga, SagaDefinition};
use crate::state::SagaStatus;

/// Command type on the saga command topic.
pub const SAGA_CREATE: &str = "CREATE";

pub const SAGA_STATUS_COMPLETED: &str = "COMPLETED";
pub const SAGA_STATUS_FAILED: &str = "FAILED";

/// Stages the create command for `definition`, keyed by its transaction id.
pub fn stage_create(buffer: &mut Buffer, definition: &SagaDefinition) -> messaging::Result<()> {
    let envelope = Envelope::new(definition.transaction_id, SAGA_CREATE, definition);
    buffer.put_envelope(
        COMMAND_TOPIC_SAGA,
        transaction_key(definition.transaction_id),
        &envelope,
    )
}

/// Body of `COMPLETED`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBody {}

/// Body of `FAILED`.
///
/// Older emitters send `{errorCode?, reason?}`; every field defaults so both
/// shapes decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBody {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub failed_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// A decoded saga status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaStatusEvent {
    Completed {
        transaction_id: TransactionId,
    },
    Failed {
        transaction_id: TransactionId,
        body: FailedBody,
    },
}

impl SagaStatusEvent {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            SagaStatusEvent::Completed { transaction_id }
            | SagaStatusEvent::Failed { transaction_id, .. } => *transaction_id,
        }
    }

    /// Decodes a status envelope. Returns None for unknown types or a
    /// missing transaction id.
    pub fn from_envelope(envelope: &StatusEnvelope) -> Option<Self> {
        let transaction_id = envelope.correlation()?;
        match envelope.kind.as_str() {
            SAGA_STATUS_COMPLETED => Some(SagaStatusEvent::Completed { transaction_id }),
            SAGA_STATUS_FAILED => {
                let body = if envelope.body.is_null() {
                    FailedBody::default()
                } else {
                    serde_json::from_value(envelope.body.clone()).ok()?
                };
                Some(SagaStatusEvent::Failed {
                    transaction_id,
                    body,
                })
            }
            _ => None,
        }
    }
}

/// Stages the terminal status event of `saga`. Does nothing for a saga
/// that is still running.
pub fn stage_terminal(buffer: &mut Buffer, saga: &Saga) -> messaging::Result<()> {
    let id = saga.transaction_id();
    match saga.status() {
        SagaStatus::Completed => buffer.put_envelope(
            EVENT_TOPIC_SAGA_STATUS,
            transaction_key(id),
            &Envelope::new(id, SAGA_STATUS_COMPLETED, CompletedBody {}),
        ),
        SagaStatus::Failed => buffer.put_envelope(
            EVENT_TOPIC_SAGA_STATUS,
            transaction_key(id),
            &Envelope::new(
                id,
                SAGA_STATUS_FAILED,
                FailedBody {
                    reason: saga.failure_reason().unwrap_or_default().to_string(),
                    failed_step: saga.failed_step_name().unwrap_or_default().to_string(),
                    error_code: None,
                },
            ),
        ),
        _ => Ok(()),
    }
}
