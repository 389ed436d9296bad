//! Error types, from provider calls up to the provisioning service.

use std::time::Duration;

use thiserror::Error;

use crate::models::Stage;

/// Error returned by a cloud capability call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{resource} already exists: {name}")]
    AlreadyExists { resource: String, name: String },

    #[error("{resource} not found: {name}")]
    NotFound { resource: String, name: String },

    #[error("provider rejected request: {0}")]
    Api(String),

    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn already_exists(resource: &str, name: &str) -> Self {
        Self::AlreadyExists {
            resource: resource.to_string(),
            name: name.to_string(),
        }
    }

    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Error raised by a single provisioner operation.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("{op} failed: {source}")]
    ExternalApi {
        op: &'static str,
        source: ProviderError,
    },

    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    ValidationTimeout { what: String, waited: Duration },

    #[error("certificate {0} failed validation")]
    CertificateFailed(String),

    #[error("database instance {0} entered failed state")]
    DatabaseFailed(String),

    #[error("container service {service} failed: {detail}")]
    ServiceFailed { service: String, detail: String },

    #[error("cancelled while {0}")]
    Cancelled(String),
}

impl StageError {
    /// Wrap a provider error with the operation that produced it.
    pub fn api(op: &'static str) -> impl FnOnce(ProviderError) -> StageError {
        move |source| StageError::ExternalApi { op, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageError::ConfigValidation(_) => "config_validation",
            StageError::ExternalApi { .. } => "external_api",
            StageError::ValidationTimeout { .. } => "validation_timeout",
            StageError::CertificateFailed(_) => "certificate_failed",
            StageError::DatabaseFailed(_) => "database_failed",
            StageError::ServiceFailed { .. } => "service_failed",
            StageError::Cancelled(_) => "cancelled",
        }
    }
}

/// Error surfaced by the orchestrator and the provisioning service.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid tenant configuration: {}", .problems.join("; "))]
    ConfigValidation { problems: Vec<String> },

    #[error("stage {stage} failed: {source}")]
    Stage { stage: Stage, source: StageError },

    #[error("{original}; rollback incomplete: {}", .failures.join("; "))]
    RollbackPartialFailure {
        #[source]
        original: Box<ProvisionError>,
        failures: Vec<String>,
    },

    #[error("no deployment record for tenant {0}")]
    NotFound(String),

    #[error("provisioning already in progress for tenant {0}")]
    ProvisioningInProgress(String),

    #[error("tenant {tenant_id} cannot move from {from} to {to}")]
    InvalidUpgrade {
        tenant_id: String,
        from: String,
        to: String,
    },

    #[error("tenant {tenant_id} is {status}; operation requires a completed deployment")]
    NotCompleted { tenant_id: String, status: String },

    #[error("deployment store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::ConfigValidation { .. } => "config_validation",
            ProvisionError::Stage { source, .. } => match source {
                StageError::ConfigValidation(_) => "config_validation",
                StageError::ValidationTimeout { .. } => "validation_timeout",
                StageError::Cancelled(_) => "cancelled",
                _ => "external_api",
            },
            ProvisionError::RollbackPartialFailure { .. } => "rollback_partial_failure",
            ProvisionError::NotFound(_) => "not_found",
            ProvisionError::ProvisioningInProgress(_) => "in_progress",
            ProvisionError::InvalidUpgrade { .. } => "invalid_upgrade",
            ProvisionError::NotCompleted { .. } => "not_completed",
            ProvisionError::Store(_) => "store",
        }
    }

    /// The pipeline stage the root cause came from, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ProvisionError::Stage { stage, .. } => Some(*stage),
            ProvisionError::RollbackPartialFailure { original, .. } => original.stage(),
            _ => None,
        }
    }

    /// The root-cause stage error, looking through rollback aggregation.
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            ProvisionError::Stage { source, .. } => Some(source),
            ProvisionError::RollbackPartialFailure { original, .. } => original.stage_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_rollback_keeps_root_cause() {
        let original = ProvisionError::Stage {
            stage: Stage::Cdn,
            source: StageError::ExternalApi {
                op: "CreateDistribution",
                source: ProviderError::Api("throttled".into()),
            },
        };
        let err = ProvisionError::RollbackPartialFailure {
            original: Box::new(original),
            failures: vec!["delete load balancer: denied".into()],
        };
        assert_eq!(err.stage(), Some(Stage::Cdn));
        assert_eq!(err.kind(), "rollback_partial_failure");
        let text = err.to_string();
        assert!(text.contains("CreateDistribution failed"));
        assert!(text.contains("delete load balancer: denied"));
    }
}
