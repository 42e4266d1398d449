use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{Result, SagaRecord, SagaStore, StoreError, Tenant, TransactionId, Version};

/// In-memory saga store for tests and single-process deployments.
///
/// Provides the same versioning contract as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<TransactionId, SagaRecord>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

fn oldest_first(mut records: Vec<SagaRecord>) -> Vec<SagaRecord> {
    records.sort_by_key(|r| r.created_at);
    records
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, record: &SagaRecord) -> Result<Version> {
        let mut sagas = self.sagas.write().await;

        let actual = sagas
            .get(&record.transaction_id)
            .map(|stored| stored.version)
            .unwrap_or(Version::initial());
        if actual != record.version {
            return Err(StoreError::VersionConflict {
                transaction_id: record.transaction_id,
                expected: record.version,
                actual,
            });
        }

        let version = record.version.next();
        let mut stored = record.clone();
        stored.version = version;
        if let Some(existing) = sagas.get(&record.transaction_id) {
            stored.created_at = existing.created_at;
        }
        sagas.insert(record.transaction_id, stored);
        Ok(version)
    }

    async fn get(
        &self,
        tenant: &Tenant,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .get(&transaction_id)
            .filter(|r| &r.tenant == tenant)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        Ok(oldest_first(
            sagas
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect(),
        ))
    }

    async fn list_active_for_tenant(&self, tenant: &Tenant) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        Ok(oldest_first(
            sagas
                .values()
                .filter(|r| !r.status.is_terminal() && &r.tenant == tenant)
                .cloned()
                .collect(),
        ))
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut sagas = self.sagas.write().await;
        let before = sagas.len();
        sagas.retain(|_, r| !(r.status.is_terminal() && r.updated_at < older_than));
        Ok((before - sagas.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::TenantId;

    use super::*;
    use crate::RecordStatus;

    fn tenant() -> Tenant {
        Tenant::new(TenantId::new(), "GMS", 83, 1)
    }

    fn record(tenant: &Tenant, status: RecordStatus) -> SagaRecord {
        let now = Utc::now();
        SagaRecord {
            transaction_id: TransactionId::new(),
            tenant: tenant.clone(),
            saga_type: "quest_reward".to_string(),
            status,
            version: Version::initial(),
            data: serde_json::json!({"steps": []}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_then_update() {
        let store = InMemorySagaStore::new();
        let tenant = tenant();
        let mut saga = record(&tenant, RecordStatus::Active);

        let v1 = store.save(&saga).await.unwrap();
        assert_eq!(v1, Version::first());

        saga.version = v1;
        saga.status = RecordStatus::Completed;
        let v2 = store.save(&saga).await.unwrap();
        assert_eq!(v2, Version::new(2));

        let loaded = store.get(&tenant, saga.transaction_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, v2);
        assert_eq!(loaded.status, RecordStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = InMemorySagaStore::new();
        let saga = record(&tenant(), RecordStatus::Active);

        store.save(&saga).await.unwrap();
        let result = store.save(&saga).await;

        assert!(matches!(
            result,
            Err(StoreError::VersionConflict { expected, actual, .. })
                if expected == Version::initial() && actual == Version::first()
        ));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = InMemorySagaStore::new();
        let mut saga = record(&tenant(), RecordStatus::Active);
        saga.version = store.save(&saga).await.unwrap();
        store.save(&saga).await.unwrap();

        // Still holding version 1 while the row is at 2.
        let result = store.save(&saga).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn update_of_missing_row_conflicts() {
        let store = InMemorySagaStore::new();
        let mut saga = record(&tenant(), RecordStatus::Active);
        saga.version = Version::new(3);

        assert!(matches!(
            store.save(&saga).await,
            Err(StoreError::VersionConflict { actual, .. }) if actual == Version::initial()
        ));
    }

    #[tokio::test]
    async fn get_is_tenant_scoped() {
        let store = InMemorySagaStore::new();
        let owner = tenant();
        let saga = record(&owner, RecordStatus::Active);
        store.save(&saga).await.unwrap();

        assert!(store.get(&owner, saga.transaction_id).await.unwrap().is_some());
        assert!(store.get(&tenant(), saga.transaction_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_active_skips_terminal_sagas() {
        let store = InMemorySagaStore::new();
        let a = tenant();
        let b = tenant();
        store.save(&record(&a, RecordStatus::Active)).await.unwrap();
        store.save(&record(&a, RecordStatus::Compensating)).await.unwrap();
        store.save(&record(&a, RecordStatus::Completed)).await.unwrap();
        store.save(&record(&b, RecordStatus::Active)).await.unwrap();
        store.save(&record(&b, RecordStatus::Failed)).await.unwrap();

        assert_eq!(store.list_active().await.unwrap().len(), 3);
        assert_eq!(store.list_active_for_tenant(&a).await.unwrap().len(), 2);
        assert_eq!(store.list_active_for_tenant(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_sagas() {
        let store = InMemorySagaStore::new();
        let tenant = tenant();
        let old = Utc::now() - Duration::hours(2);

        let mut finished = record(&tenant, RecordStatus::Completed);
        finished.updated_at = old;
        let mut stuck = record(&tenant, RecordStatus::Active);
        stuck.updated_at = old;
        let fresh = record(&tenant, RecordStatus::Failed);
        for r in [&finished, &stuck, &fresh] {
            store.save(r).await.unwrap();
        }

        let purged = store
            .purge_terminal(Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.saga_count().await, 2);
        assert!(
            store
                .get(&tenant, finished.transaction_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
