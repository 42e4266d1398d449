use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TenantId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    RecordStatus, Result, SagaRecord, SagaStore, StoreError, Tenant, TransactionId, Version,
};

const SELECT_COLUMNS: &str = "SELECT transaction_id, tenant_id, region, major_version, minor_version, \
     saga_type, status, version, data, created_at, updated_at FROM sagas";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn current_version(&self, transaction_id: TransactionId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM sagas WHERE transaction_id = $1")
                .bind(transaction_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        let status: String = row.try_get("status")?;
        let tenant = Tenant::new(
            TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
            row.try_get::<String, _>("region")?,
            version_part(row.try_get("major_version")?)?,
            version_part(row.try_get("minor_version")?)?,
        );

        Ok(SagaRecord {
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            tenant,
            saga_type: row.try_get("saga_type")?,
            status: status.parse()?,
            version: Version::new(row.try_get("version")?),
            data: row.try_get("data")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

fn version_part(value: i32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| StoreError::InvalidRow(format!("tenant version {value} out of range")))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, record), fields(transaction_id = %record.transaction_id, status = %record.status))]
    async fn save(&self, record: &SagaRecord) -> Result<Version> {
        let next = record.version.next();

        let affected = if record.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO sagas (transaction_id, tenant_id, region, major_version, minor_version,
                                   saga_type, status, version, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (transaction_id) DO NOTHING
                "#,
            )
            .bind(record.transaction_id.as_uuid())
            .bind(record.tenant.id().as_uuid())
            .bind(record.tenant.region())
            .bind(i32::from(record.tenant.major_version()))
            .bind(i32::from(record.tenant.minor_version()))
            .bind(&record.saga_type)
            .bind(record.status.as_str())
            .bind(next.as_i64())
            .bind(&record.data)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE sagas
                SET saga_type = $2, status = $3, version = $4, data = $5, updated_at = $6
                WHERE transaction_id = $1 AND version = $7
                "#,
            )
            .bind(record.transaction_id.as_uuid())
            .bind(&record.saga_type)
            .bind(record.status.as_str())
            .bind(next.as_i64())
            .bind(&record.data)
            .bind(record.updated_at)
            .bind(record.version.as_i64())
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            return Err(StoreError::VersionConflict {
                transaction_id: record.transaction_id,
                expected: record.version,
                actual: self.current_version(record.transaction_id).await?,
            });
        }
        Ok(next)
    }

    async fn get(
        &self,
        tenant: &Tenant,
        transaction_id: TransactionId,
    ) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE transaction_id = $1 AND tenant_id = $2 AND region = $3 \
             AND major_version = $4 AND minor_version = $5"
        ))
        .bind(transaction_id.as_uuid())
        .bind(tenant.id().as_uuid())
        .bind(tenant.region())
        .bind(i32::from(tenant.major_version()))
        .bind(i32::from(tenant.minor_version()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn list_active(&self) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('active', 'compensating') ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn list_active_for_tenant(&self, tenant: &Tenant) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('active', 'compensating') \
             AND tenant_id = $1 AND region = $2 AND major_version = $3 AND minor_version = $4 \
             ORDER BY created_at ASC"
        ))
        .bind(tenant.id().as_uuid())
        .bind(tenant.region())
        .bind(i32::from(tenant.major_version()))
        .bind(i32::from(tenant.minor_version()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sagas WHERE status IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
