//! The saga engine.
//!
//! Every transition runs the same way: take the saga's lock, load it,
//! apply a pure transition, stage the resulting message in a [`Buffer`],
//! save with the version that was read, then flush. Nothing is published
//! unless the save succeeded. A terminal saga stays listed until its
//! outcome event has been flushed; the scheduler resends it otherwise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::{Tenant, TransactionId};
use messaging::{Buffer, Envelope, OperationContext, Producer};
use saga_store::StoreError;
use tokio::sync::OwnedMutexGuard;

use crate::action::{Action, PayloadOf, StepPolicy};
use crate::error::{Result, SagaError};
use crate::events;
use crate::model::{Effect, Saga, SagaDefinition};
use crate::repository::{SagaRepository, Tracked};

/// How often a transition is re-applied after losing a version race.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Overrides for every action's default step policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub step_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

/// Result of [`SagaEngine::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A saga with this transaction id already exists.
    Duplicate,
}

/// Outcome of a step as reported by its status event.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { result: Option<serde_json::Value> },
    Failed { reason: String },
}

type LockMap = Mutex<HashMap<TransactionId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive access to one saga. The map entry goes away with the last
/// holder.
struct SagaLock<'a> {
    locks: &'a LockMap,
    id: TransactionId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SagaLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // The map and this handle: nobody else holds or waits for the lock.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.id);
        }
    }
}

/// Drives sagas from creation to a terminal status.
pub struct SagaEngine {
    repository: SagaRepository,
    producer: Arc<dyn Producer>,
    config: EngineConfig,
    locks: LockMap,
}

impl SagaEngine {
    pub fn new(repository: SagaRepository, producer: Arc<dyn Producer>) -> Self {
        Self::with_config(repository, producer, EngineConfig::default())
    }

    pub fn with_config(
        repository: SagaRepository,
        producer: Arc<dyn Producer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            producer,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Timeout and attempt budget for `action`.
    pub fn policy(&self, action: &Action) -> StepPolicy {
        let mut policy = action.default_policy();
        if let Some(timeout) = self.config.step_timeout {
            policy.timeout = timeout;
        }
        if let Some(max_attempts) = self.config.max_attempts {
            policy.max_attempts = max_attempts.max(1);
        }
        policy
    }

    /// Validates, persists and starts a saga.
    ///
    /// A saga whose transaction id is already known is left untouched.
    #[tracing::instrument(
        skip(self, ctx, definition),
        fields(transaction_id = %definition.transaction_id, saga_type = %definition.saga_type)
    )]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        definition: SagaDefinition,
    ) -> Result<CreateOutcome> {
        let id = definition.transaction_id;
        let now = Utc::now();
        let mut saga = Saga::new(definition, ctx.tenant().clone(), now)?;

        let _lock = self.lock(id).await;

        if self.repository.load(ctx.tenant(), id).await?.is_some() {
            tracing::info!("duplicate saga create ignored");
            return Ok(CreateOutcome::Duplicate);
        }

        let Some(effect) = saga.start(now) else {
            return Err(SagaError::Validation("saga could not be started".into()));
        };
        let buffer = self.stage(&saga, effect)?;

        let mut tracked = Tracked::new(saga);
        match self.repository.save(&mut tracked).await {
            Ok(()) => {}
            Err(SagaError::Store(StoreError::VersionConflict { .. })) => {
                tracing::info!("saga already stored, create ignored");
                return Ok(CreateOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        }

        metrics::counter!("saga_created_total", "saga_type" => tracked.saga.saga_type().to_string())
            .increment(1);
        tracing::info!(steps = tracked.saga.steps().len(), "saga created");
        self.publish(ctx, &tracked.saga, effect, buffer).await;
        Ok(CreateOutcome::Created)
    }

    /// Applies the status event of the step in flight.
    ///
    /// Returns the updated saga, or None when the event was dropped
    /// (unknown saga, terminal saga, step no longer in flight).
    #[tracing::instrument(skip(self, ctx, outcome))]
    pub async fn step_completed(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        step: usize,
        outcome: StepOutcome,
    ) -> Result<Option<Saga>> {
        self.transition(ctx, transaction_id, Utc::now(), |saga, now| match &outcome {
            StepOutcome::Succeeded { result } => saga.step_succeeded(step, result.clone(), now),
            StepOutcome::Failed { reason } => {
                tracing::warn!(step, %reason, "saga step failed");
                saga.step_failed(step, reason.clone(), now)
            }
        })
        .await
    }

    /// Applies the status event of the compensation in flight.
    #[tracing::instrument(skip(self, ctx, outcome))]
    pub async fn compensation_completed(
        &self,
        ctx: &OperationContext,
        transaction_id: TransactionId,
        step: usize,
        outcome: StepOutcome,
    ) -> Result<Option<Saga>> {
        self.transition(ctx, transaction_id, Utc::now(), |saga, now| {
            let outcome = match &outcome {
                StepOutcome::Succeeded { .. } => Ok(()),
                StepOutcome::Failed { reason } => Err(reason.clone()),
            };
            saga.compensation_finished(step, outcome, now)
        })
        .await
    }

    /// Loads one saga.
    pub async fn get(&self, tenant: &Tenant, transaction_id: TransactionId) -> Result<Saga> {
        self.repository
            .load(tenant, transaction_id)
            .await?
            .map(|t| t.saga)
            .ok_or(SagaError::NotFound(transaction_id))
    }

    /// Loads one saga if it exists.
    pub async fn find(
        &self,
        tenant: &Tenant,
        transaction_id: TransactionId,
    ) -> Result<Option<Saga>> {
        Ok(self
            .repository
            .load(tenant, transaction_id)
            .await?
            .map(|t| t.saga))
    }

    /// Non-terminal sagas of one tenant, oldest first.
    pub async fn list_active(&self, tenant: &Tenant) -> Result<Vec<Saga>> {
        Ok(self
            .repository
            .list_active_for_tenant(tenant)
            .await?
            .into_iter()
            .map(|t| t.saga)
            .collect())
    }

    /// Re-dispatches or fails every in-flight command past its deadline.
    pub async fn tick(&self) -> Result<usize> {
        self.tick_at(Utc::now()).await
    }

    /// [`tick`](Self::tick) as of `now`.
    ///
    /// Returns the number of sagas that changed. A saga that cannot be
    /// advanced is logged and left for the next tick. Finished sagas whose
    /// outcome event never went out are published again.
    #[tracing::instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut changed = 0;
        for tracked in self.repository.list_active().await? {
            let saga = tracked.saga;
            if saga.outcome_pending() {
                let id = saga.transaction_id();
                match self.resend_outcome(saga.tenant(), id).await {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(transaction_id = %id, error = %e, "saga outcome resend failed")
                    }
                }
                continue;
            }
            if !saga.is_due(now, |a| self.policy(a)) {
                continue;
            }

            let ctx = OperationContext::new(saga.tenant().clone());
            let id = saga.transaction_id();
            match self
                .transition(&ctx, id, now, |saga, now| {
                    saga.on_timeout(now, |a| self.policy(a))
                })
                .await
            {
                Ok(Some(_)) => changed += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(transaction_id = %id, error = %e, "saga tick failed"),
            }
        }
        Ok(changed)
    }

    /// Reports the sagas that survived a restart.
    ///
    /// Nothing is re-sent here; the next tick re-dispatches whatever is due.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let active = self.repository.list_active().await?;
        for tracked in &active {
            let saga = &tracked.saga;
            tracing::info!(
                transaction_id = %saga.transaction_id(),
                tenant_id = %saga.tenant().id(),
                saga_type = saga.saga_type(),
                status = %saga.status(),
                step = saga.cursor(),
                "resuming saga"
            );
        }
        Ok(active.len())
    }

    /// Deletes terminal sagas last updated more than `retention` ago.
    pub async fn purge(&self, retention: Duration) -> Result<u64> {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let purged = self.repository.purge_terminal(cutoff).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged terminal sagas");
        }
        Ok(purged)
    }

    async fn lock(&self, id: TransactionId) -> SagaLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        SagaLock {
            locks: &self.locks,
            id,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publishes the outcome of a finished saga that is still unannounced.
    async fn resend_outcome(&self, tenant: &Tenant, id: TransactionId) -> Result<bool> {
        let _lock = self.lock(id).await;
        let Some(mut tracked) = self.repository.load(tenant, id).await? else {
            return Ok(false);
        };
        if !tracked.saga.outcome_pending() {
            return Ok(false);
        }

        let ctx = OperationContext::new(tenant.clone());
        let mut buffer = Buffer::new();
        events::stage_terminal(&mut buffer, &tracked.saga)?;
        buffer.flush(self.producer.as_ref(), &ctx).await?;
        tracing::info!(
            transaction_id = %id,
            status = %tracked.saga.status(),
            "saga outcome published on retry"
        );

        tracked.saga.mark_outcome_published();
        self.repository.save(&mut tracked).await?;
        Ok(true)
    }

    /// Records that the outcome event went out.
    ///
    /// If this save fails the event is sent again on a later tick.
    async fn settle_outcome(&self, tracked: &mut Tracked) {
        tracked.saga.mark_outcome_published();
        if let Err(e) = self.repository.save(tracked).await {
            tracing::warn!(
                transaction_id = %tracked.saga.transaction_id(),
                error = %e,
                "saga outcome published but not recorded"
            );
        }
    }

    async fn transition<F>(
        &self,
        ctx: &OperationContext,
        id: TransactionId,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Option<Saga>>
    where
        F: Fn(&mut Saga, DateTime<Utc>) -> Option<Effect>,
    {
        let _lock = self.lock(id).await;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(mut tracked) = self.repository.load(ctx.tenant(), id).await? else {
                tracing::warn!(transaction_id = %id, "status for unknown saga dropped");
                return Ok(None);
            };
            if tracked.saga.status().is_terminal() {
                tracing::info!(
                    transaction_id = %id,
                    status = %tracked.saga.status(),
                    "late status for finished saga dropped"
                );
                return Ok(None);
            }

            let Some(effect) = apply(&mut tracked.saga, now) else {
                tracing::debug!(transaction_id = %id, "status did not match the step in flight");
                return Ok(None);
            };
            let buffer = self.stage(&tracked.saga, effect)?;

            match self.repository.save(&mut tracked).await {
                Ok(()) => {
                    let flushed = self.publish(ctx, &tracked.saga, effect, buffer).await;
                    if flushed && tracked.saga.outcome_pending() {
                        self.settle_outcome(&mut tracked).await;
                    }
                    return Ok(Some(tracked.saga));
                }
                Err(SagaError::Store(StoreError::VersionConflict { .. })) => {
                    tracing::debug!(transaction_id = %id, "saga changed underneath, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(SagaError::Contended(id))
    }

    /// Stages the message `effect` calls for.
    fn stage(&self, saga: &Saga, effect: Effect) -> Result<Buffer> {
        let mut buffer = Buffer::new();
        match effect {
            Effect::Dispatch { step, .. } => {
                let step = saga
                    .step(step)
                    .ok_or_else(|| SagaError::Validation(format!("no step {step}")))?;
                stage_command(&mut buffer, saga.transaction_id(), step.action())?;
            }
            Effect::Compensate { step, .. } => {
                let compensation = saga
                    .step(step)
                    .and_then(|s| s.compensation())
                    .ok_or_else(|| SagaError::Validation(format!("no compensation for step {step}")))?;
                stage_command(&mut buffer, saga.transaction_id(), compensation.action())?;
            }
            Effect::Completed | Effect::Failed => events::stage_terminal(&mut buffer, saga)?,
        }
        Ok(buffer)
    }

    /// Flushes a committed transition and records its metrics. Returns
    /// whether the flush succeeded.
    ///
    /// A failed flush is not an error for the caller: the saga is already
    /// saved. An unsent command is re-sent by the scheduler once it times
    /// out, and an unsent outcome on the next tick.
    async fn publish(
        &self,
        ctx: &OperationContext,
        saga: &Saga,
        effect: Effect,
        buffer: Buffer,
    ) -> bool {
        let id = saga.transaction_id();
        let flushed = match buffer.flush(self.producer.as_ref(), ctx).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(transaction_id = %id, error = %e, "failed to publish saga message");
                false
            }
        };

        match effect {
            Effect::Dispatch { step, retry } => {
                let action = saga.step(step).map(|s| s.action().name()).unwrap_or_default();
                metrics::counter!("saga_step_dispatched_total", "action" => action).increment(1);
                if retry {
                    metrics::counter!("saga_step_retried_total", "action" => action).increment(1);
                    tracing::info!(transaction_id = %id, step, action, "step re-dispatched");
                } else {
                    tracing::debug!(transaction_id = %id, step, action, "step dispatched");
                }
            }
            Effect::Compensate { step, retry } => {
                let action = saga
                    .step(step)
                    .and_then(|s| s.compensation())
                    .map(|c| c.action().name())
                    .unwrap_or_default();
                if !retry {
                    metrics::counter!("saga_compensations_total", "action" => action).increment(1);
                }
                tracing::info!(transaction_id = %id, step, action, retry, "compensation dispatched");
            }
            Effect::Completed => {
                metrics::counter!("saga_completed_total").increment(1);
                record_duration(saga);
                tracing::info!(transaction_id = %id, "saga completed");
            }
            Effect::Failed => {
                metrics::counter!("saga_failed_total").increment(1);
                record_duration(saga);
                tracing::warn!(
                    transaction_id = %id,
                    failed_step = saga.failed_step_name().unwrap_or_default(),
                    reason = saga.failure_reason().unwrap_or_default(),
                    "saga failed"
                );
            }
        }
        flushed
    }
}

fn stage_command(buffer: &mut Buffer, id: TransactionId, action: &Action) -> Result<()> {
    let envelope =
        Envelope::new(id, action.command_type(), PayloadOf(action)).with_routing(action.routing());
    buffer.put_envelope(action.command_topic(), action.partition_key(), &envelope)?;
    Ok(())
}

fn record_duration(saga: &Saga) {
    if let Ok(elapsed) = (saga.updated_at() - saga.created_at()).to_std() {
        metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
    }
}
