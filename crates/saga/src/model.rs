//! Saga definitions and the saga state machine.
//!
//! Transitions here are pure: they mutate the saga and return the
//! [`Effect`] the engine must publish. Persistence and messaging live in
//! the engine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::{Tenant, TransactionId};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::action::{Action, Inverse, PayloadOf, StepPolicy};
use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, StepStatus};

/// Well-known saga types. The type is diagnostic only.
pub mod saga_type {
    pub const INVENTORY_TRANSACTION: &str = "inventory_transaction";
    pub const QUEST_REWARD: &str = "quest_reward";
    pub const QUEST_START: &str = "quest_start";
    pub const QUEST_COMPLETE: &str = "quest_complete";
    pub const QUEST_RESTORE_ITEM: &str = "quest_restore_item";
    pub const TRADE_TRANSACTION: &str = "trade_transaction";
    pub const CHARACTER_CREATION: &str = "character_creation";
    pub const CHARACTER_RESPAWN: &str = "character_respawn";
    pub const STORAGE_OPERATION: &str = "storage_operation";
    pub const CASH_SHOP_OPERATION: &str = "cash_shop_operation";
    pub const GACHAPON_TRANSACTION: &str = "gachapon_transaction";
    pub const FIELD_EFFECT_USE: &str = "field_effect_use";
}

/// One step as an initiator describes it: `{stepId, action, payload}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct StepDefinition {
    pub step_id: String,
    pub action: Action,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    step_id: String,
    action: String,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<RawStep> for StepDefinition {
    type Error = serde_json::Error;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            step_id: raw.step_id,
            action: Action::from_parts(&raw.action, raw.payload)?,
        })
    }
}

impl Serialize for StepDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StepDefinition", 3)?;
        state.serialize_field("stepId", &self.step_id)?;
        state.serialize_field("action", self.action.name())?;
        state.serialize_field("payload", &PayloadOf(&self.action))?;
        state.end()
    }
}

/// A saga as published on the saga command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaDefinition {
    pub transaction_id: TransactionId,
    pub saga_type: String,
    pub initiated_by: String,
    pub steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    /// Checks the definition can become a saga.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_id.as_uuid().is_nil() {
            return Err(SagaError::Validation("transaction id must not be nil".into()));
        }
        if self.steps.is_empty() {
            return Err(SagaError::Validation("saga must have at least one step".into()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(SagaError::Validation("step id must not be empty".into()));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(SagaError::Validation(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
        }
        Ok(())
    }
}

/// Builds a [`SagaDefinition`].
#[derive(Debug, Default)]
pub struct SagaBuilder {
    transaction_id: Option<TransactionId>,
    saga_type: Option<String>,
    initiated_by: Option<String>,
    steps: Vec<StepDefinition>,
}

impl SagaBuilder {
    pub fn transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn initiated_by(mut self, initiated_by: impl Into<String>) -> Self {
        self.initiated_by = Some(initiated_by.into());
        self
    }

    /// Appends a step with a generated id.
    pub fn step(self, action: Action) -> Self {
        let step_id = format!("{}-{}", action.name(), self.steps.len());
        self.named_step(step_id, action)
    }

    pub fn named_step(mut self, step_id: impl Into<String>, action: Action) -> Self {
        self.steps.push(StepDefinition {
            step_id: step_id.into(),
            action,
        });
        self
    }

    /// Builds and validates the definition. A missing transaction id is
    /// generated.
    pub fn build(self) -> Result<SagaDefinition> {
        let definition = SagaDefinition {
            transaction_id: self.transaction_id.unwrap_or_default(),
            saga_type: self
                .saga_type
                .ok_or_else(|| SagaError::Validation("saga type is required".into()))?,
            initiated_by: self.initiated_by.unwrap_or_default(),
            steps: self.steps,
        };
        definition.validate()?;
        Ok(definition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStatus {
    Dispatched,
    Succeeded,
    Failed,
}

/// The inverse command issued for a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    action: Action,
    status: CompensationStatus,
    attempt: u32,
    first_dispatch_at: DateTime<Utc>,
    last_dispatch_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
}

impl Compensation {
    fn dispatched(action: Action, now: DateTime<Utc>) -> Self {
        Self {
            action,
            status: CompensationStatus::Dispatched,
            attempt: 1,
            first_dispatch_at: now,
            last_dispatch_at: now,
            failure_reason: None,
        }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn status(&self) -> CompensationStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_dispatch_at(&self) -> DateTime<Utc> {
        self.last_dispatch_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    index: usize,
    #[serde(flatten)]
    definition: StepDefinition,
    topic: String,
    status: StepStatus,
    attempt: u32,
    first_dispatch_at: Option<DateTime<Utc>>,
    last_dispatch_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compensation: Option<Compensation>,
}

impl Step {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn step_id(&self) -> &str {
        &self.definition.step_id
    }

    pub fn action(&self) -> &Action {
        &self.definition.action
    }

    /// Symbolic command topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn first_dispatch_at(&self) -> Option<DateTime<Utc>> {
        self.first_dispatch_at
    }

    pub fn last_dispatch_at(&self) -> Option<DateTime<Utc>> {
        self.last_dispatch_at
    }

    /// Body of the status event that completed the step.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn compensation(&self) -> Option<&Compensation> {
        self.compensation.as_ref()
    }
}

/// What the engine must publish after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Send the step's command.
    Dispatch { step: usize, retry: bool },
    /// Send the inverse command of a completed step.
    Compensate { step: usize, retry: bool },
    /// Publish `COMPLETED`.
    Completed,
    /// Publish `FAILED`.
    Failed,
}

/// The command a saga is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    Step(usize),
    Compensation(usize),
}

/// A distributed transaction in progress or finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Saga {
    transaction_id: TransactionId,
    saga_type: String,
    initiated_by: String,
    tenant: Tenant,
    steps: Vec<Step>,
    cursor: usize,
    status: SagaStatus,
    failed_step: Option<usize>,
    failure_reason: Option<String>,
    /// Set once the `COMPLETED` or `FAILED` event has been published.
    #[serde(default)]
    outcome_published: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Saga {
    pub fn builder() -> SagaBuilder {
        SagaBuilder::default()
    }

    /// Materializes a validated definition. Nothing is dispatched yet.
    pub fn new(definition: SagaDefinition, tenant: Tenant, now: DateTime<Utc>) -> Result<Self> {
        definition.validate()?;

        let steps = definition
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, definition)| Step {
                index,
                topic: definition.action.command_topic().to_string(),
                definition,
                status: StepStatus::Pending,
                attempt: 0,
                first_dispatch_at: None,
                last_dispatch_at: None,
                result: None,
                compensation: None,
            })
            .collect();

        Ok(Self {
            transaction_id: definition.transaction_id,
            saga_type: definition.saga_type,
            initiated_by: definition.initiated_by,
            tenant,
            steps,
            cursor: 0,
            status: SagaStatus::Pending,
            failed_step: None,
            failure_reason: None,
            outcome_published: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn initiated_by(&self) -> &str {
        &self.initiated_by
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn failed_step(&self) -> Option<usize> {
        self.failed_step
    }

    /// Action name of the failed step, as reported in `FAILED` events.
    pub fn failed_step_name(&self) -> Option<&'static str> {
        self.failed_step
            .and_then(|i| self.steps.get(i))
            .map(|s| s.action().name())
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// True when the saga is terminal but its status event is not out yet.
    pub fn outcome_pending(&self) -> bool {
        self.status.is_terminal() && !self.outcome_published
    }

    pub fn mark_outcome_published(&mut self) {
        self.outcome_published = true;
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        let step = self.steps.get(self.cursor)?;
        match self.status {
            SagaStatus::Pending if step.status == StepStatus::Dispatched => {
                Some(InFlight::Step(self.cursor))
            }
            SagaStatus::Compensating
                if step
                    .compensation
                    .as_ref()
                    .is_some_and(|c| c.status == CompensationStatus::Dispatched) =>
            {
                Some(InFlight::Compensation(self.cursor))
            }
            _ => None,
        }
    }

    /// Dispatches step 0.
    pub fn start(&mut self, now: DateTime<Utc>) -> Option<Effect> {
        if self.status != SagaStatus::Pending || self.steps[0].status != StepStatus::Pending {
            return None;
        }
        Some(self.dispatch_current(now, false))
    }

    fn dispatch_current(&mut self, now: DateTime<Utc>, retry: bool) -> Effect {
        let step = &mut self.steps[self.cursor];
        step.status = StepStatus::Dispatched;
        step.attempt += 1;
        step.first_dispatch_at.get_or_insert(now);
        step.last_dispatch_at = Some(now);
        self.updated_at = now;
        Effect::Dispatch {
            step: self.cursor,
            retry,
        }
    }

    /// Applies a success status for `step`. Returns None if `step` is not
    /// the one in flight (duplicate or late event).
    pub fn step_succeeded(
        &mut self,
        step: usize,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Option<Effect> {
        if self.in_flight() != Some(InFlight::Step(step)) {
            return None;
        }

        let current = &mut self.steps[step];
        current.status = StepStatus::Completed;
        current.result = result;
        self.updated_at = now;

        if step + 1 == self.steps.len() {
            self.status = SagaStatus::Completed;
            return Some(Effect::Completed);
        }
        self.cursor += 1;
        Some(self.dispatch_current(now, false))
    }

    /// Applies a failure for `step` and starts compensating.
    pub fn step_failed(
        &mut self,
        step: usize,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<Effect> {
        if self.in_flight() != Some(InFlight::Step(step)) {
            return None;
        }

        self.steps[step].status = StepStatus::Failed;
        self.failed_step = Some(step);
        self.failure_reason = Some(reason.into());
        self.status = SagaStatus::Compensating;
        self.updated_at = now;
        Some(self.compensate_below(step, now))
    }

    /// Applies the outcome of the inverse command for `step`.
    ///
    /// A failed inverse does not stop the walk.
    pub fn compensation_finished(
        &mut self,
        step: usize,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> Option<Effect> {
        if self.in_flight() != Some(InFlight::Compensation(step)) {
            return None;
        }

        let current = &mut self.steps[step];
        if let Some(compensation) = current.compensation.as_mut() {
            match outcome {
                Ok(()) => {
                    compensation.status = CompensationStatus::Succeeded;
                    current.status = StepStatus::Compensated;
                }
                Err(reason) => {
                    tracing::error!(
                        transaction_id = %self.transaction_id,
                        step,
                        action = compensation.action.name(),
                        %reason,
                        "compensation failed, manual reconciliation required"
                    );
                    compensation.status = CompensationStatus::Failed;
                    compensation.failure_reason = Some(reason);
                }
            }
        }
        self.updated_at = now;
        Some(self.compensate_below(step, now))
    }

    /// Walks back from `from - 1` to the first step with an inverse command
    /// to send, or terminates the saga.
    fn compensate_below(&mut self, from: usize, now: DateTime<Utc>) -> Effect {
        for j in (0..from).rev() {
            let step = &mut self.steps[j];
            if step.status != StepStatus::Completed {
                continue;
            }
            match step.definition.action.inverse(step.result.as_ref()) {
                Inverse::Command(action) => {
                    step.compensation = Some(Compensation::dispatched(action, now));
                    self.cursor = j;
                    return Effect::Compensate {
                        step: j,
                        retry: false,
                    };
                }
                Inverse::NoOp => step.status = StepStatus::Compensated,
                Inverse::None => tracing::warn!(
                    transaction_id = %self.transaction_id,
                    step = j,
                    action = step.definition.action.name(),
                    "step is not compensable, skipping"
                ),
            }
        }

        self.status = SagaStatus::Failed;
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Compensated;
            }
        }
        self.cursor = self.failed_step.unwrap_or(0);
        Effect::Failed
    }

    /// Whether the in-flight command has waited at least its timeout.
    pub fn is_due(&self, now: DateTime<Utc>, policy: impl Fn(&Action) -> StepPolicy) -> bool {
        let (action, last) = match self.in_flight() {
            Some(InFlight::Step(i)) => {
                let step = &self.steps[i];
                match step.last_dispatch_at {
                    Some(last) => (step.action(), last),
                    None => return false,
                }
            }
            Some(InFlight::Compensation(i)) => match &self.steps[i].compensation {
                Some(c) => (&c.action, c.last_dispatch_at),
                None => return false,
            },
            None => return false,
        };

        (now - last)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= policy(action).timeout)
    }

    /// Re-dispatches the in-flight command if it is due, or fails it once
    /// its attempts are used up.
    pub fn on_timeout(
        &mut self,
        now: DateTime<Utc>,
        policy: impl Fn(&Action) -> StepPolicy,
    ) -> Option<Effect> {
        if !self.is_due(now, &policy) {
            return None;
        }

        match self.in_flight()? {
            InFlight::Step(i) => {
                let step = &self.steps[i];
                if step.attempt < policy(step.action()).max_attempts {
                    Some(self.dispatch_current(now, true))
                } else {
                    self.step_failed(i, "timeout", now)
                }
            }
            InFlight::Compensation(i) => {
                let compensation = self.steps[i].compensation.as_mut()?;
                if compensation.attempt < policy(&compensation.action).max_attempts {
                    compensation.attempt += 1;
                    compensation.last_dispatch_at = now;
                    self.updated_at = now;
                    Some(Effect::Compensate {
                        step: i,
                        retry: true,
                    })
                } else {
                    self.compensation_finished(i, Err("timeout".to_string()), now)
                }
            }
        }
    }

    /// Checks the structural invariants of the saga.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let statuses: Vec<StepStatus> = self.steps.iter().map(|s| s.status).collect();
        if statuses.is_empty() {
            return Err("saga has no steps".into());
        }
        if self.cursor >= statuses.len() {
            return Err(format!("cursor {} out of range", self.cursor));
        }
        let dispatched = statuses
            .iter()
            .filter(|s| **s == StepStatus::Dispatched)
            .count();

        match self.status {
            SagaStatus::Pending => {
                if dispatched != 1 || statuses[self.cursor] != StepStatus::Dispatched {
                    return Err("pending saga must have exactly the cursor step dispatched".into());
                }
                if statuses[..self.cursor]
                    .iter()
                    .any(|s| *s != StepStatus::Completed)
                {
                    return Err("steps before the cursor must be completed".into());
                }
                if statuses[self.cursor + 1..]
                    .iter()
                    .any(|s| *s != StepStatus::Pending)
                {
                    return Err("steps after the cursor must be pending".into());
                }
            }
            SagaStatus::Compensating => {
                let failed = self
                    .failed_step
                    .ok_or("compensating saga has no failed step")?;
                if statuses[failed] != StepStatus::Failed || self.cursor >= failed {
                    return Err("compensation must walk below the failed step".into());
                }
                if self.in_flight() != Some(InFlight::Compensation(self.cursor)) {
                    return Err("compensating saga must have one compensation in flight".into());
                }
            }
            SagaStatus::Completed => {
                if statuses.iter().any(|s| *s != StepStatus::Completed) {
                    return Err("completed saga has unfinished steps".into());
                }
            }
            SagaStatus::Failed => {
                let failed = self.failed_step.ok_or("failed saga has no failed step")?;
                if statuses.iter().any(|s| !s.is_settled()) {
                    return Err("failed saga has unsettled steps".into());
                }
                if statuses[failed] != StepStatus::Failed
                    || statuses[..failed]
                        .iter()
                        .any(|s| !matches!(s, StepStatus::Completed | StepStatus::Compensated))
                {
                    return Err("steps before the failed step must be completed or compensated".into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use common::TenantId;
    use serde_json::json;

    use super::*;
    use crate::action::{
        AwardAssetPayload, AwardExperiencePayload, AwardMesosPayload, ExperienceDistribution,
        ItemPayload, QuestPayload,
    };

    fn tenant() -> Tenant {
        Tenant::new(TenantId::new(), "GMS", 83, 1)
    }

    fn award_item() -> Action {
        Action::AwardAsset(AwardAssetPayload {
            character_id: 42,
            item: ItemPayload {
                template_id: 2000000,
                quantity: 3,
                period: 0,
                expiration: 0,
            },
        })
    }

    fn award_exp() -> Action {
        Action::AwardExperience(AwardExperiencePayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            distributions: vec![ExperienceDistribution {
                experience_type: "WHITE".into(),
                amount: 500,
                attr1: 0,
            }],
        })
    }

    fn award_mesos(amount: i32) -> Action {
        Action::AwardMesos(AwardMesosPayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            actor_id: 0,
            actor_type: "SYSTEM".into(),
            amount,
        })
    }

    fn complete_quest() -> Action {
        Action::QuestComplete(QuestPayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            quest_id: 100,
            npc_id: 0,
            force: false,
        })
    }

    fn saga(actions: Vec<Action>) -> Saga {
        let builder = actions
            .into_iter()
            .fold(Saga::builder().saga_type(saga_type::QUEST_COMPLETE), |b, a| {
                b.step(a)
            });
        Saga::new(builder.build().unwrap(), tenant(), Utc::now()).unwrap()
    }

    fn fixed(timeout_secs: u64, max_attempts: u32) -> impl Fn(&Action) -> StepPolicy {
        move |_| StepPolicy {
            timeout: Duration::from_secs(timeout_secs),
            max_attempts,
        }
    }

    #[test]
    fn zero_step_saga_is_rejected() {
        let err = Saga::builder().saga_type("x").build().unwrap_err();
        assert!(matches!(err, SagaError::Validation(_)));
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let err = Saga::builder()
            .saga_type("x")
            .named_step("a", award_item())
            .named_step("a", award_exp())
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::Validation(_)));
    }

    #[test]
    fn definition_wire_shape() {
        let definition = Saga::builder()
            .saga_type(saga_type::QUEST_REWARD)
            .initiated_by("quest-service")
            .named_step("give_potions", award_item())
            .build()
            .unwrap();

        let value = serde_json::to_value(&definition).unwrap();
        assert_eq!(value["sagaType"], "quest_reward");
        assert_eq!(value["steps"][0]["stepId"], "give_potions");
        assert_eq!(value["steps"][0]["action"], "AwardAsset");
        assert_eq!(value["steps"][0]["payload"]["item"]["quantity"], 3);

        let back: SagaDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, definition);
    }

    #[test]
    fn unknown_action_fails_to_decode() {
        let value = json!({
            "transactionId": TransactionId::new(),
            "sagaType": "x",
            "initiatedBy": "y",
            "steps": [{"stepId": "s", "action": "Teleport", "payload": {}}]
        });
        assert!(serde_json::from_value::<SagaDefinition>(value).is_err());
    }

    #[test]
    fn happy_path_advances_then_completes() {
        let mut saga = saga(vec![award_item(), award_exp()]);
        let now = Utc::now();

        assert_eq!(
            saga.start(now),
            Some(Effect::Dispatch {
                step: 0,
                retry: false
            })
        );
        saga.check_invariants().unwrap();

        let effect = saga.step_succeeded(0, Some(json!({"assetId": 1})), now);
        assert_eq!(
            effect,
            Some(Effect::Dispatch {
                step: 1,
                retry: false
            })
        );
        saga.check_invariants().unwrap();

        assert_eq!(saga.step_succeeded(1, None, now), Some(Effect::Completed));
        assert_eq!(saga.status(), SagaStatus::Completed);
        saga.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_success_is_ignored() {
        let mut saga = saga(vec![award_item(), award_exp()]);
        let now = Utc::now();
        saga.start(now);
        saga.step_succeeded(0, None, now);
        let snapshot = saga.clone();

        assert_eq!(saga.step_succeeded(0, None, now), None);
        assert_eq!(saga, snapshot);
    }

    #[test]
    fn single_step_failure_fails_without_compensation() {
        let mut saga = saga(vec![award_item()]);
        let now = Utc::now();
        saga.start(now);

        assert_eq!(saga.step_failed(0, "inventory full", now), Some(Effect::Failed));
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert_eq!(saga.failed_step_name(), Some("AwardAsset"));
        assert!(saga.steps()[0].compensation().is_none());
        saga.check_invariants().unwrap();
    }

    #[test]
    fn failure_walks_back_skipping_non_compensable_steps() {
        let mut saga = saga(vec![award_item(), award_exp(), complete_quest()]);
        let now = Utc::now();
        saga.start(now);
        saga.step_succeeded(0, Some(json!({"assetId": 77})), now);
        saga.step_succeeded(1, None, now);

        let effect = saga.step_failed(2, "quest not started", now);
        assert_eq!(
            effect,
            Some(Effect::Compensate {
                step: 0,
                retry: false
            })
        );
        assert_eq!(saga.status(), SagaStatus::Compensating);
        saga.check_invariants().unwrap();

        let Some(Action::DestroyAsset(inverse)) =
            saga.steps()[0].compensation().map(|c| c.action().clone())
        else {
            panic!("expected DestroyAsset compensation");
        };
        assert_eq!(inverse.asset_id, Some(77));

        assert_eq!(saga.compensation_finished(0, Ok(()), now), Some(Effect::Failed));
        assert_eq!(saga.steps()[0].status(), StepStatus::Compensated);
        assert_eq!(saga.steps()[1].status(), StepStatus::Completed);
        assert_eq!(saga.failed_step_name(), Some("QuestComplete"));
        saga.check_invariants().unwrap();
    }

    #[test]
    fn failed_compensation_does_not_cascade() {
        let mut saga = saga(vec![award_mesos(100), award_item(), complete_quest()]);
        let now = Utc::now();
        saga.start(now);
        saga.step_succeeded(0, None, now);
        saga.step_succeeded(1, None, now);
        saga.step_failed(2, "boom", now);

        let effect = saga.compensation_finished(1, Err("asset gone".into()), now);
        assert_eq!(
            effect,
            Some(Effect::Compensate {
                step: 0,
                retry: false
            })
        );
        assert_eq!(saga.steps()[1].status(), StepStatus::Completed);

        assert_eq!(saga.compensation_finished(0, Ok(()), now), Some(Effect::Failed));
        assert_eq!(saga.failure_reason(), Some("boom"));
        saga.check_invariants().unwrap();
    }

    #[test]
    fn later_steps_settle_when_saga_fails() {
        let mut saga = saga(vec![award_item(), award_exp(), complete_quest()]);
        let now = Utc::now();
        saga.start(now);

        assert_eq!(saga.step_failed(0, "no room", now), Some(Effect::Failed));
        assert_eq!(saga.steps()[1].status(), StepStatus::Compensated);
        assert_eq!(saga.steps()[2].status(), StepStatus::Compensated);
        saga.check_invariants().unwrap();
    }

    #[test]
    fn timeout_exactly_at_deadline_redispatches() {
        let mut saga = saga(vec![award_item()]);
        let start = Utc::now();
        saga.start(start);

        let before = start + TimeDelta::seconds(9);
        assert_eq!(saga.on_timeout(before, fixed(10, 3)), None);

        let deadline = start + TimeDelta::seconds(10);
        assert_eq!(
            saga.on_timeout(deadline, fixed(10, 3)),
            Some(Effect::Dispatch {
                step: 0,
                retry: true
            })
        );
        assert_eq!(saga.steps()[0].attempt(), 2);
        assert_eq!(saga.steps()[0].last_dispatch_at(), Some(deadline));
    }

    #[test]
    fn timeout_with_attempts_exhausted_fails_step() {
        let mut saga = saga(vec![award_item()]);
        let start = Utc::now();
        saga.start(start);

        let later = start + TimeDelta::seconds(30);
        assert_eq!(saga.on_timeout(later, fixed(10, 1)), Some(Effect::Failed));
        assert_eq!(saga.failure_reason(), Some("timeout"));
    }

    #[test]
    fn compensation_timeout_retries_then_gives_up() {
        let mut saga = saga(vec![award_item(), complete_quest()]);
        let start = Utc::now();
        saga.start(start);
        saga.step_succeeded(0, None, start);
        saga.step_failed(1, "boom", start);

        let t1 = start + TimeDelta::seconds(10);
        assert_eq!(
            saga.on_timeout(t1, fixed(10, 2)),
            Some(Effect::Compensate {
                step: 0,
                retry: true
            })
        );
        let t2 = t1 + TimeDelta::seconds(10);
        assert_eq!(saga.on_timeout(t2, fixed(10, 2)), Some(Effect::Failed));
        assert_eq!(
            saga.steps()[0].compensation().map(|c| c.status()),
            Some(CompensationStatus::Failed)
        );
        saga.check_invariants().unwrap();
    }

    #[test]
    fn persisted_form_round_trips() {
        let mut saga = saga(vec![award_item(), award_exp()]);
        saga.start(Utc::now());
        let value = serde_json::to_value(&saga).unwrap();
        assert_eq!(value["steps"][0]["action"], "AwardAsset");
        assert_eq!(value["steps"][0]["status"], "Dispatched");

        let back: Saga = serde_json::from_value(value).unwrap();
        assert_eq!(back, saga);
    }
}
