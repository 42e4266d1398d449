//! Matches inbound status events to the saga step waiting on them.

use std::sync::Arc;

use messaging::{OperationContext, StatusEnvelope};
use serde_json::Value;

use crate::action::{Action, STATUS_ERROR};
use crate::engine::{SagaEngine, StepOutcome};
use crate::error::Result;
use crate::model::{InFlight, Saga};

/// What happened to one status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// No transaction id: an ordinary domain event.
    Uncorrelated,
    /// No live saga was waiting on this event.
    Unmatched,
    /// Delivered to the saga's step.
    Step,
    /// Delivered to the saga's compensation.
    Compensation,
}

/// Delivers status events to [`SagaEngine`].
#[derive(Clone)]
pub struct CorrelationRouter {
    engine: Arc<SagaEngine>,
}

impl CorrelationRouter {
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }

    /// Routes a status event read from symbolic `topic`.
    #[tracing::instrument(skip(self, ctx, event), fields(kind = %event.kind))]
    pub async fn route(
        &self,
        ctx: &OperationContext,
        topic: &str,
        event: &StatusEnvelope,
    ) -> Result<Routed> {
        let Some(id) = event.correlation() else {
            return Ok(Routed::Uncorrelated);
        };
        let Some(saga) = self.engine.find(ctx.tenant(), id).await? else {
            return Ok(Routed::Unmatched);
        };
        if saga.status().is_terminal() {
            tracing::info!(transaction_id = %id, "status for finished saga dropped");
            return Ok(Routed::Unmatched);
        }

        let Some((in_flight, outcome)) = classify(&saga, topic, event) else {
            return Ok(Routed::Unmatched);
        };

        match in_flight {
            InFlight::Step(step) => {
                self.engine.step_completed(ctx, id, step, outcome).await?;
                Ok(Routed::Step)
            }
            InFlight::Compensation(step) => {
                self.engine
                    .compensation_completed(ctx, id, step, outcome)
                    .await?;
                Ok(Routed::Compensation)
            }
        }
    }
}

/// Decides whether `event` settles the command `saga` is waiting on.
fn classify(saga: &Saga, topic: &str, event: &StatusEnvelope) -> Option<(InFlight, StepOutcome)> {
    let in_flight = saga.in_flight()?;
    let action: &Action = match in_flight {
        InFlight::Step(i) => saga.step(i)?.action(),
        InFlight::Compensation(i) => saga.step(i)?.compensation()?.action(),
    };

    if topic != action.status_topic() || !action.matches_status(&event.body) {
        return None;
    }

    let outcome = if event.kind == action.success_type() {
        StepOutcome::Succeeded {
            result: Some(event.body.clone()).filter(|b| !b.is_null()),
        }
    } else if event.kind == STATUS_ERROR {
        StepOutcome::Failed {
            reason: failure_reason(&event.body),
        }
    } else {
        return None;
    };
    Some((in_flight, outcome))
}

fn failure_reason(body: &Value) -> String {
    ["reason", "error", "errorCode"]
        .iter()
        .find_map(|field| body.get(field).and_then(Value::as_str))
        .unwrap_or(STATUS_ERROR)
        .to_string()
}
