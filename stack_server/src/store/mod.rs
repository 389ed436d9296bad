//! Deployment record persistence.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::DeploymentRecord;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// One record per tenant; `save` replaces the previous run's record.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn save(&self, record: &DeploymentRecord) -> anyhow::Result<()>;
    async fn get(&self, tenant_id: &str) -> anyhow::Result<Option<DeploymentRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<DeploymentRecord>>;
}
