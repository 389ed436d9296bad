//! Provisioning data model: tenant input, deployment record, credentials, reports.

pub mod certificate;
pub mod credentials;
pub mod deployment;
pub mod result;
pub mod rollback;
pub mod tenant;

pub use certificate::{SslStatus, ValidationRecord, ValidationStatus};
pub use credentials::CredentialBundle;
pub use deployment::{
    CdnHandle, CertificateHandle, ContainersHandle, DatabaseHandle, DeploymentRecord,
    DeploymentStatus, DnsHandle, LoadBalancerHandle, ResourceHandles, SecretsHandle,
    ServiceEndpoint, Stage, StageOutput, StageState, StageStatus, TargetsHandle,
};
pub use result::{DeploymentResult, ErrorSummary};
pub use rollback::{CompensationEntry, CompensationOutcome, RollbackReport};
pub use tenant::{AccountTier, FeatureFlags, IntegrationKeys, PaidPlan, TenantConfig};
