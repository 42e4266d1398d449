use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Result, SagaRecord, Tenant, TransactionId, Version};

/// Durable registry of sagas.
///
/// Rows are written whole. Every write names the version the caller last
/// read, so two writers racing on one saga cannot both win.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts or replaces a saga row.
    ///
    /// `record.version` is the expected stored version: [`Version::initial`]
    /// inserts a new row, anything else updates an existing one. Fails with
    /// `VersionConflict` when the stored version differs.
    ///
    /// Returns the version now stored.
    async fn save(&self, record: &SagaRecord) -> Result<Version>;

    /// Loads a saga owned by `tenant`.
    ///
    /// Returns None if the saga does not exist or belongs to another tenant.
    async fn get(&self, tenant: &Tenant, transaction_id: TransactionId)
    -> Result<Option<SagaRecord>>;

    /// All non-terminal sagas across every tenant, oldest first.
    async fn list_active(&self) -> Result<Vec<SagaRecord>>;

    /// Non-terminal sagas of one tenant, oldest first.
    async fn list_active_for_tenant(&self, tenant: &Tenant) -> Result<Vec<SagaRecord>>;

    /// Deletes terminal sagas last updated before `older_than`.
    ///
    /// Returns the number of rows removed.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
