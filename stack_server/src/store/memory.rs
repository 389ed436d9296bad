//! In-memory deployment store for tests and simulated runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::DeploymentStore;
use crate::models::DeploymentRecord;

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn save(&self, record: &DeploymentRecord) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: &str) -> anyhow::Result<Option<DeploymentRecord>> {
        Ok(self.records.read().await.get(tenant_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<DeploymentRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountTier, DeploymentStatus, TenantConfig};

    #[tokio::test]
    async fn save_replaces_previous_run() {
        let store = MemoryStore::new();
        let config = TenantConfig::new("acme-1", AccountTier::Trial);
        let mut first = DeploymentRecord::new(&config);
        first.finish(DeploymentStatus::Failed);
        store.save(&first).await.unwrap();

        let second = DeploymentRecord::new(&config);
        store.save(&second).await.unwrap();

        let stored = store.get("acme-1").await.unwrap().unwrap();
        assert_eq!(stored.run_id, second.run_id);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.get("acme-2").await.unwrap().is_none());
    }
}
