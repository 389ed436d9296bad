//! PostgreSQL deployment store (diesel-async over a deadpool pool).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use uuid::Uuid;

use super::DeploymentStore;
use crate::models::DeploymentRecord;
use crate::schema::tenant_deployments;

/// Idempotent; run at startup.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_deployments (
    tenant_id   VARCHAR(63) PRIMARY KEY,
    run_id      UUID NOT NULL,
    status      VARCHAR(32) NOT NULL,
    tier        VARCHAR(32) NOT NULL,
    record      JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tenant_deployments_status ON tenant_deployments (status);
"#;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = tenant_deployments)]
struct DeploymentRow {
    tenant_id: String,
    run_id: Uuid,
    status: String,
    tier: String,
    record: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DeploymentRow {
    fn from_record(record: &DeploymentRecord) -> anyhow::Result<Self> {
        Ok(Self {
            tenant_id: record.tenant_id.clone(),
            run_id: record.run_id,
            status: record.status.as_str().to_string(),
            tier: record.tier.to_string(),
            record: serde_json::to_value(record)?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn into_record(self) -> anyhow::Result<DeploymentRecord> {
        serde_json::from_value(self.record)
            .map_err(|e| anyhow::anyhow!("corrupt deployment record for {}: {e}", self.tenant_id))
    }
}

pub struct PostgresStore {
    pool: Pool<AsyncPgConnection>,
}

impl PostgresStore {
    pub fn connect(database_url: &str) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .build()
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        Ok(Self { pool })
    }

    pub async fn run_migration(&self) -> anyhow::Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        conn.batch_execute(MIGRATION_SQL)
            .await
            .map_err(|e| anyhow::anyhow!("tenant_deployments migration failed: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn save(&self, record: &DeploymentRecord) -> anyhow::Result<()> {
        let row = DeploymentRow::from_record(record)?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;

        diesel::insert_into(tenant_deployments::table)
            .values(&row)
            .on_conflict(tenant_deployments::tenant_id)
            .do_update()
            .set((
                tenant_deployments::run_id.eq(excluded(tenant_deployments::run_id)),
                tenant_deployments::status.eq(excluded(tenant_deployments::status)),
                tenant_deployments::tier.eq(excluded(tenant_deployments::tier)),
                tenant_deployments::record.eq(excluded(tenant_deployments::record)),
                tenant_deployments::updated_at.eq(excluded(tenant_deployments::updated_at)),
            ))
            .execute(&mut conn)
            .await?;

        tracing::debug!(
            tenant_id = %record.tenant_id,
            status = %record.status,
            "deployment record saved"
        );
        Ok(())
    }

    async fn get(&self, tenant_id: &str) -> anyhow::Result<Option<DeploymentRecord>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        let row = tenant_deployments::table
            .find(tenant_id)
            .select(DeploymentRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(DeploymentRow::into_record).transpose()
    }

    async fn list(&self) -> anyhow::Result<Vec<DeploymentRecord>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        let rows = tenant_deployments::table
            .order(tenant_deployments::tenant_id.asc())
            .select(DeploymentRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(DeploymentRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountTier, PaidPlan, TenantConfig};

    #[test]
    fn row_carries_status_and_tier_columns() {
        let config = TenantConfig::new("acme-2", AccountTier::Paid(PaidPlan::Professional));
        let record = DeploymentRecord::new(&config);
        let row = DeploymentRow::from_record(&record).unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.tier, config.tier.to_string());
        let back = row.into_record().unwrap();
        assert_eq!(back, record);
    }
}
