//! Cloud-provider capability interfaces consumed by the provisioners.
//!
//! Each capability is an object-safe async trait so provisioners hold
//! `Arc<dyn ...>` handles. `AlreadyExists` and `NotFound` are typed
//! outcomes of [`ProviderError`]; callers never match on message text.

pub mod gateway;
pub mod simulated;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::ValidationRecord;

pub type ProviderResult<T> = Result<T, ProviderError>;

pub type Tags = BTreeMap<String, String>;

// ── Certificates ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    PendingValidation,
    Issued,
    Failed,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub domain: String,
    pub subject_alternative_names: Vec<String>,
    pub idempotency_token: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateDescription {
    pub arn: String,
    pub domain: String,
    pub subject_alternative_names: Vec<String>,
    pub status: CertificateStatus,
    pub not_after: Option<DateTime<Utc>>,
    pub validation_records: Vec<ValidationRecord>,
}

#[async_trait]
pub trait CertificateService: Send + Sync {
    async fn request_certificate(&self, request: &CertificateRequest) -> ProviderResult<String>;
    async fn describe_certificate(&self, arn: &str) -> ProviderResult<CertificateDescription>;
    async fn list_certificates(&self) -> ProviderResult<Vec<CertificateDescription>>;
}

// ── Databases ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Creating,
    BackingUp,
    Modifying,
    Available,
    Deleting,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub instance_id: String,
    pub instance_class: String,
    pub engine: String,
    pub engine_version: String,
    pub allocated_storage_gb: u32,
    pub master_username: String,
    pub master_password: String,
    pub db_name: String,
    pub port: u16,
    pub subnet_group: String,
    pub security_group_ids: Vec<String>,
    pub multi_az: bool,
    pub backup_retention_days: u32,
    pub storage_encrypted: bool,
    pub deletion_protection: bool,
    pub publicly_accessible: bool,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub endpoint: Option<String>,
    pub port: u16,
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub multi_az: bool,
    pub backup_retention_days: u32,
    pub deletion_protection: bool,
    pub storage_encrypted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyInstanceRequest {
    pub instance_id: String,
    pub instance_class: Option<String>,
    pub allocated_storage_gb: Option<u32>,
    pub multi_az: Option<bool>,
    pub backup_retention_days: Option<u32>,
    pub deletion_protection: Option<bool>,
    pub master_password: Option<String>,
    pub apply_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInstanceRequest {
    pub instance_id: String,
    pub final_snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetGroup {
    pub name: String,
    pub subnet_ids: Vec<String>,
}

#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<InstanceDescription>;
    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<InstanceDescription>;
    async fn create_snapshot(&self, instance_id: &str, snapshot_id: &str) -> ProviderResult<String>;
    async fn modify_instance(
        &self,
        request: &ModifyInstanceRequest,
    ) -> ProviderResult<InstanceDescription>;
    async fn delete_instance(&self, request: &DeleteInstanceRequest) -> ProviderResult<()>;
    async fn describe_subnet_group(&self, name: &str) -> ProviderResult<SubnetGroup>;
    async fn create_subnet_group(
        &self,
        name: &str,
        subnet_ids: &[String],
        description: &str,
    ) -> ProviderResult<SubnetGroup>;
}

// ── Network ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    pub cidr: String,
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn describe_default_network(&self) -> ProviderResult<Network>;
    async fn describe_subnets(&self, network_id: &str) -> ProviderResult<Vec<Subnet>>;
    async fn find_security_group(
        &self,
        network_id: &str,
        name: &str,
    ) -> ProviderResult<Option<SecurityGroup>>;
    async fn create_security_group(
        &self,
        network_id: &str,
        name: &str,
        description: &str,
    ) -> ProviderResult<SecurityGroup>;
    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> ProviderResult<()>;
}

// ── Secrets ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretValue {
    pub name: String,
    pub arn: String,
    pub value: String,
    pub tags: Tags,
}

#[async_trait]
pub trait SecretService: Send + Sync {
    /// Returns the secret's reference.
    async fn create_secret(&self, name: &str, value: &str, tags: &Tags) -> ProviderResult<String>;
    async fn get_secret(&self, name: &str) -> ProviderResult<SecretValue>;
    async fn update_secret(&self, name: &str, value: &str) -> ProviderResult<String>;
    /// Schedules deletion; returns when the secret will be erased.
    async fn delete_secret(
        &self,
        name: &str,
        recovery_window_days: u32,
    ) -> ProviderResult<DateTime<Utc>>;
    async fn list_secrets_by_tag(&self, key: &str, value: &str) -> ProviderResult<Vec<String>>;
}

// ── Load balancing ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub internet_facing: bool,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub arn: String,
    pub name: String,
    pub dns_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    pub network_id: String,
    pub health_check: HealthCheck,
    pub stickiness: bool,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerAction {
    Forward { target_group_arn: String },
    Redirect { protocol: String, port: u16, status_code: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub load_balancer_arn: String,
    pub protocol: String,
    pub port: u16,
    pub certificate_arn: Option<String>,
    pub action: ListenerAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub arn: String,
    pub protocol: String,
    pub port: u16,
    pub action: ListenerAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target: Target,
    pub state: String,
}

#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    async fn find_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>>;
    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> ProviderResult<LoadBalancer>;
    async fn find_target_group(&self, name: &str) -> ProviderResult<Option<TargetGroup>>;
    async fn create_target_group(&self, spec: &TargetGroupSpec) -> ProviderResult<TargetGroup>;
    async fn describe_listeners(&self, load_balancer_arn: &str) -> ProviderResult<Vec<Listener>>;
    async fn create_listener(&self, spec: &ListenerSpec) -> ProviderResult<Listener>;
    async fn register_targets(&self, target_group_arn: &str, targets: &[Target])
        -> ProviderResult<()>;
    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> ProviderResult<()>;
    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> ProviderResult<Vec<TargetHealth>>;
    async fn delete_listener(&self, listener_arn: &str) -> ProviderResult<()>;
    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()>;
    async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()>;
}

// ── CDN ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewerProtocolPolicy {
    HttpsOnly,
    RedirectToHttps,
    AllowAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSpec {
    pub caller_reference: String,
    pub origin_domain: String,
    pub origin_https: bool,
    pub aliases: Vec<String>,
    pub certificate_arn: Option<String>,
    pub viewer_protocol_policy: ViewerProtocolPolicy,
    pub compress: bool,
    pub comment: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub id: String,
    pub domain_name: String,
    pub caller_reference: String,
    pub status: String,
    pub enabled: bool,
    pub viewer_protocol_policy: ViewerProtocolPolicy,
    pub compress: bool,
    pub aliases: Vec<String>,
}

#[async_trait]
pub trait CdnService: Send + Sync {
    async fn find_distribution(&self, caller_reference: &str)
        -> ProviderResult<Option<Distribution>>;
    async fn create_distribution(&self, spec: &DistributionSpec) -> ProviderResult<Distribution>;
    async fn update_distribution(&self, id: &str, enabled: bool) -> ProviderResult<Distribution>;
    async fn delete_distribution(&self, id: &str) -> ProviderResult<()>;
    async fn create_invalidation(
        &self,
        id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> ProviderResult<String>;
}

// ── DNS ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedZone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

#[async_trait]
pub trait DnsService: Send + Sync {
    async fn list_zones(&self) -> ProviderResult<Vec<HostedZone>>;
    /// Returns the change reference.
    async fn upsert_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String>;
    async fn delete_record(&self, zone_id: &str, record: &DnsRecord) -> ProviderResult<String>;
}

// ── Containers ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    /// Environment variable -> secret reference, resolved by the runtime.
    pub secret_refs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    pub stack_name: String,
    pub services: Vec<ServiceSpec>,
    pub labels: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub target_id: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub message: Option<String>,
}

#[async_trait]
pub trait ContainerRuntimeService: Send + Sync {
    async fn deploy_stack(&self, spec: &StackSpec) -> ProviderResult<String>;
    async fn describe_services(&self, stack_name: &str) -> ProviderResult<Vec<ServiceStatus>>;
    async fn remove_stack(&self, stack_name: &str) -> ProviderResult<()>;
}

/// Every capability the pipeline needs, constructed once per process.
#[derive(Clone)]
pub struct CloudProvider {
    pub certificates: Arc<dyn CertificateService>,
    pub databases: Arc<dyn DatabaseService>,
    pub network: Arc<dyn NetworkService>,
    pub secrets: Arc<dyn SecretService>,
    pub load_balancers: Arc<dyn LoadBalancerService>,
    pub cdn: Arc<dyn CdnService>,
    pub dns: Arc<dyn DnsService>,
    pub containers: Arc<dyn ContainerRuntimeService>,
}

impl CloudProvider {
    /// Use one backend for every capability.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: CertificateService
            + DatabaseService
            + NetworkService
            + SecretService
            + LoadBalancerService
            + CdnService
            + DnsService
            + ContainerRuntimeService
            + 'static,
    {
        Self {
            certificates: backend.clone(),
            databases: backend.clone(),
            network: backend.clone(),
            secrets: backend.clone(),
            load_balancers: backend.clone(),
            cdn: backend.clone(),
            dns: backend.clone(),
            containers: backend,
        }
    }
}
