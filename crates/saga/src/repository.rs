//! Loading and saving sagas through a [`SagaStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Tenant, TransactionId};
use saga_store::{RecordStatus, SagaRecord, SagaStore, Version};

use crate::error::Result;
use crate::model::Saga;

/// A saga together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Tracked {
    pub saga: Saga,
    pub version: Version,
}

impl Tracked {
    /// A saga that has never been saved.
    pub fn new(saga: Saga) -> Self {
        Self {
            saga,
            version: Version::initial(),
        }
    }
}

/// Maps [`Saga`] onto store rows.
#[derive(Clone)]
pub struct SagaRepository {
    store: Arc<dyn SagaStore>,
}

impl SagaRepository {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub async fn load(&self, tenant: &Tenant, id: TransactionId) -> Result<Option<Tracked>> {
        self.store
            .get(tenant, id)
            .await?
            .map(Self::from_record)
            .transpose()
    }

    /// Writes the saga expecting `tracked.version` to be current and
    /// advances it on success.
    pub async fn save(&self, tracked: &mut Tracked) -> Result<()> {
        let record = Self::to_record(tracked)?;
        tracked.version = self.store.save(&record).await?;
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<Tracked>> {
        self.store
            .list_active()
            .await?
            .into_iter()
            .map(Self::from_record)
            .collect()
    }

    pub async fn list_active_for_tenant(&self, tenant: &Tenant) -> Result<Vec<Tracked>> {
        self.store
            .list_active_for_tenant(tenant)
            .await?
            .into_iter()
            .map(Self::from_record)
            .collect()
    }

    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        Ok(self.store.purge_terminal(older_than).await?)
    }

    fn to_record(tracked: &Tracked) -> Result<SagaRecord> {
        let saga = &tracked.saga;
        // Stays listed until the outcome event is out, so the scheduler can resend it.
        let status = if saga.outcome_pending() {
            RecordStatus::Active
        } else {
            saga.status().record_status()
        };
        Ok(SagaRecord {
            transaction_id: saga.transaction_id(),
            tenant: saga.tenant().clone(),
            saga_type: saga.saga_type().to_string(),
            status,
            version: tracked.version,
            data: serde_json::to_value(saga)?,
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        })
    }

    fn from_record(record: SagaRecord) -> Result<Tracked> {
        Ok(Tracked {
            saga: serde_json::from_value(record.data)?,
            version: record.version,
        })
    }
}
