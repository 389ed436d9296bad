//! REST API for tenant deployments.

use serde::{Deserialize, Serialize};

use crate::models::{AccountTier, DeploymentRecord, DeploymentStatus, SslStatus};

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub tier: AccountTier,
}

/// Paths to purge; empty means everything.
#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One line of the tenant listing.
#[derive(Debug, Serialize)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub tier: AccountTier,
    pub status: DeploymentStatus,
    pub ssl_status: SslStatus,
    pub tenant_url: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&DeploymentRecord> for TenantSummary {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            tier: record.tier,
            status: record.status,
            ssl_status: record.ssl_status,
            tenant_url: record.tenant_url.clone(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub status: &'static str,
    pub active_runs: usize,
}
