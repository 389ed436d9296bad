//! Deployment result: what the signup flow and the CLI receive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::certificate::SslStatus;
use super::deployment::{DeploymentRecord, DeploymentStatus, ResourceHandles, Stage, StageStatus};
use super::rollback::RollbackReport;
use crate::error::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: String,
    pub stage: Option<Stage>,
    pub message: String,
}

impl From<&ProvisionError> for ErrorSummary {
    fn from(err: &ProvisionError) -> Self {
        Self {
            kind: err.kind().to_string(),
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub tenant_id: String,
    pub status: DeploymentStatus,
    pub tenant_url: Option<String>,
    pub ssl_status: SslStatus,
    pub stage_statuses: BTreeMap<Stage, StageStatus>,
    pub resources: ResourceHandles,
    pub error: Option<ErrorSummary>,
    pub rollback: Option<RollbackReport>,
}

impl DeploymentResult {
    pub fn from_record(record: &DeploymentRecord, error: Option<&ProvisionError>) -> Self {
        let error = error.map(ErrorSummary::from).or_else(|| {
            record.error.as_ref().map(|message| ErrorSummary {
                kind: "stage_failed".to_string(),
                stage: record
                    .stages
                    .iter()
                    .find(|(_, s)| s.error.is_some())
                    .map(|(stage, _)| *stage),
                message: message.clone(),
            })
        });

        Self {
            success: record.status == DeploymentStatus::Completed,
            tenant_id: record.tenant_id.clone(),
            status: record.status,
            tenant_url: record.tenant_url.clone(),
            ssl_status: record.ssl_status,
            stage_statuses: record.stage_statuses(),
            resources: record.resources.clone(),
            error,
            rollback: record.rollback.clone(),
        }
    }
}
