//! Deployment record: one tenant's provisioning run and the resources it owns.
//!
//! A resource handle is present if and only if its stage is `succeeded`.
//! Rollback is computed from the record alone, so every mutation goes
//! through the stage transition methods below.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::certificate::SslStatus;
use super::rollback::RollbackReport;
use super::tenant::{AccountTier, TenantConfig};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Certificate,
    Database,
    Secrets,
    LoadBalancer,
    Cdn,
    Dns,
    Containers,
    TargetRegistration,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Certificate,
        Stage::Database,
        Stage::Secrets,
        Stage::LoadBalancer,
        Stage::Cdn,
        Stage::Dns,
        Stage::Containers,
        Stage::TargetRegistration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Certificate => "certificate",
            Stage::Database => "database",
            Stage::Secrets => "secrets",
            Stage::LoadBalancer => "load_balancer",
            Stage::Cdn => "cdn",
            Stage::Dns => "dns",
            Stage::Containers => "containers",
            Stage::TargetRegistration => "target_registration",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// A failed stage whose leftovers have been removed.
    #[serde(default)]
    pub cleaned_up: bool,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::NotStarted,
            started_at: None,
            finished_at: None,
            error: None,
            cleaned_up: false,
        }
    }
}

// ── Resource handles ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHandle {
    pub domain: String,
    /// `None` in bypass mode.
    pub certificate_ref: Option<String>,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseHandle {
    pub instance_id: String,
    pub endpoint: String,
    pub port: u16,
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub multi_az: bool,
    pub backup_retention_days: u32,
    pub deletion_protection: bool,
}

/// Opaque references into the secret store. Never raw credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsHandle {
    pub database_secret_ref: String,
    pub database_secret_name: String,
    pub integrations_secret_ref: Option<String>,
    pub integrations_secret_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerHandle {
    pub load_balancer_ref: String,
    pub dns_name: String,
    pub target_group_ref: String,
    pub listener_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnHandle {
    pub distribution_id: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsHandle {
    pub record_name: String,
    pub record_type: String,
    pub value: String,
    pub change_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub target_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainersHandle {
    pub stack_name: String,
    pub endpoints: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsHandle {
    pub target_group_ref: String,
    pub targets: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandles {
    pub certificate: Option<CertificateHandle>,
    pub database: Option<DatabaseHandle>,
    pub secrets: Option<SecretsHandle>,
    pub load_balancer: Option<LoadBalancerHandle>,
    pub cdn: Option<CdnHandle>,
    pub dns: Option<DnsHandle>,
    pub containers: Option<ContainersHandle>,
    pub targets: Option<TargetsHandle>,
}

impl ResourceHandles {
    pub fn has(&self, stage: Stage) -> bool {
        match stage {
            Stage::Certificate => self.certificate.is_some(),
            Stage::Database => self.database.is_some(),
            Stage::Secrets => self.secrets.is_some(),
            Stage::LoadBalancer => self.load_balancer.is_some(),
            Stage::Cdn => self.cdn.is_some(),
            Stage::Dns => self.dns.is_some(),
            Stage::Containers => self.containers.is_some(),
            Stage::TargetRegistration => self.targets.is_some(),
        }
    }

    fn clear(&mut self, stage: Stage) {
        match stage {
            Stage::Certificate => self.certificate = None,
            Stage::Database => self.database = None,
            Stage::Secrets => self.secrets = None,
            Stage::LoadBalancer => self.load_balancer = None,
            Stage::Cdn => self.cdn = None,
            Stage::Dns => self.dns = None,
            Stage::Containers => self.containers = None,
            Stage::TargetRegistration => self.targets = None,
        }
    }
}

/// Output of a successful stage, applied to the record in one step.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Certificate(CertificateHandle),
    Database(DatabaseHandle),
    Secrets(SecretsHandle),
    LoadBalancer(LoadBalancerHandle),
    Cdn(CdnHandle),
    Dns(DnsHandle),
    Containers(ContainersHandle),
    TargetRegistration(TargetsHandle),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Certificate(_) => Stage::Certificate,
            StageOutput::Database(_) => Stage::Database,
            StageOutput::Secrets(_) => Stage::Secrets,
            StageOutput::LoadBalancer(_) => Stage::LoadBalancer,
            StageOutput::Cdn(_) => Stage::Cdn,
            StageOutput::Dns(_) => Stage::Dns,
            StageOutput::Containers(_) => Stage::Containers,
            StageOutput::TargetRegistration(_) => Stage::TargetRegistration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub tenant_id: String,
    pub run_id: Uuid,
    pub tier: AccountTier,
    pub status: DeploymentStatus,
    pub ssl_status: SslStatus,
    pub stages: BTreeMap<Stage, StageState>,
    pub resources: ResourceHandles,
    pub tenant_url: Option<String>,
    pub error: Option<String>,
    pub rollback: Option<RollbackReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(config: &TenantConfig) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: config.tenant_id.clone(),
            run_id: Uuid::new_v4(),
            tier: config.tier,
            status: DeploymentStatus::Pending,
            ssl_status: SslStatus::Pending,
            stages: Stage::ALL
                .iter()
                .map(|s| (*s, StageState::default()))
                .collect(),
            resources: ResourceHandles::default(),
            tenant_url: None,
            error: None,
            rollback: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages
            .get(&stage)
            .map(|s| s.status)
            .unwrap_or(StageStatus::NotStarted)
    }

    pub fn stage_statuses(&self) -> BTreeMap<Stage, StageStatus> {
        self.stages.iter().map(|(k, v)| (*k, v.status)).collect()
    }

    /// Stages currently `succeeded`, in pipeline order.
    pub fn succeeded_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.stage_status(*s) == StageStatus::Succeeded)
            .collect()
    }

    /// Stages rollback still has to visit, in pipeline order: every
    /// `succeeded` stage plus failed stages that may have left resources.
    pub fn stages_to_compensate(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| match self.stages.get(s) {
                Some(state) => match state.status {
                    StageStatus::Succeeded => true,
                    StageStatus::Failed => !state.cleaned_up,
                    _ => false,
                },
                None => false,
            })
            .collect()
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        let now = Utc::now();
        let state = self.stages.entry(stage).or_default();
        state.status = StageStatus::InProgress;
        state.started_at = Some(now);
        state.finished_at = None;
        state.error = None;
        state.cleaned_up = false;
        self.status = DeploymentStatus::InProgress;
        self.updated_at = now;
    }

    pub fn complete_stage(&mut self, output: StageOutput) {
        let now = Utc::now();
        let stage = output.stage();
        match output {
            StageOutput::Certificate(h) => self.resources.certificate = Some(h),
            StageOutput::Database(h) => self.resources.database = Some(h),
            StageOutput::Secrets(h) => self.resources.secrets = Some(h),
            StageOutput::LoadBalancer(h) => self.resources.load_balancer = Some(h),
            StageOutput::Cdn(h) => self.resources.cdn = Some(h),
            StageOutput::Dns(h) => self.resources.dns = Some(h),
            StageOutput::Containers(h) => self.resources.containers = Some(h),
            StageOutput::TargetRegistration(h) => self.resources.targets = Some(h),
        }
        let state = self.stages.entry(stage).or_default();
        state.status = StageStatus::Succeeded;
        state.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail_stage(&mut self, stage: Stage, error: &str) {
        let now = Utc::now();
        self.resources.clear(stage);
        let state = self.stages.entry(stage).or_default();
        state.status = StageStatus::Failed;
        state.finished_at = Some(now);
        state.error = Some(error.to_string());
        self.status = DeploymentStatus::Failed;
        self.updated_at = now;
    }

    /// A compensating action undid (or scheduled undoing) this stage.
    pub fn mark_compensated(&mut self, stage: Stage) {
        self.resources.clear(stage);
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::RolledBack;
        }
        self.updated_at = Utc::now();
    }

    /// Leftovers of a failed stage were removed; the stage stays `failed`.
    pub fn mark_cleaned_up(&mut self, stage: Stage) {
        if let Some(state) = self.stages.get_mut(&stage) {
            if state.status == StageStatus::Failed {
                state.cleaned_up = true;
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Handles are present exactly for the `succeeded` stages.
    pub fn is_consistent(&self) -> bool {
        Stage::ALL.iter().all(|s| {
            self.resources.has(*s) == (self.stage_status(*s) == StageStatus::Succeeded)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(&TenantConfig::new("acme-1", AccountTier::Trial))
    }

    #[test]
    fn new_record_has_every_stage_not_started() {
        let r = record();
        assert_eq!(r.stages.len(), Stage::ALL.len());
        assert!(r
            .stages
            .values()
            .all(|s| s.status == StageStatus::NotStarted));
        assert_eq!(r.status, DeploymentStatus::Pending);
        assert!(r.is_consistent());
    }

    #[test]
    fn transitions_keep_handles_in_step_with_status() {
        let mut r = record();
        r.begin_stage(Stage::Cdn);
        assert_eq!(r.status, DeploymentStatus::InProgress);
        r.complete_stage(StageOutput::Cdn(CdnHandle {
            distribution_id: "E123".into(),
            domain: "d1.cdn.test".into(),
        }));
        assert!(r.is_consistent());
        assert_eq!(r.succeeded_stages(), vec![Stage::Cdn]);

        r.mark_compensated(Stage::Cdn);
        assert_eq!(r.stage_status(Stage::Cdn), StageStatus::RolledBack);
        assert!(r.resources.cdn.is_none());
        assert!(r.is_consistent());
    }

    #[test]
    fn failed_stage_is_compensated_until_cleaned_up() {
        let mut r = record();
        r.begin_stage(Stage::Certificate);
        r.complete_stage(StageOutput::Certificate(CertificateHandle {
            domain: "tenantstack.test".into(),
            certificate_ref: Some("arn:cert".into()),
            reused: false,
        }));
        r.begin_stage(Stage::Database);
        r.fail_stage(Stage::Database, "timed out");
        assert_eq!(r.stages_to_compensate(), vec![Stage::Certificate, Stage::Database]);

        r.mark_cleaned_up(Stage::Database);
        r.mark_compensated(Stage::Certificate);
        assert!(r.stages_to_compensate().is_empty());
        assert_eq!(r.stage_status(Stage::Database), StageStatus::Failed);
        assert!(r.is_consistent());
    }

    #[test]
    fn records_without_cleanup_flag_still_deserialize() {
        let mut json = serde_json::to_value(record()).unwrap();
        json["stages"]["database"]
            .as_object_mut()
            .unwrap()
            .remove("cleaned_up");
        let r: DeploymentRecord = serde_json::from_value(json).unwrap();
        assert!(!r.stages[&Stage::Database].cleaned_up);
    }

    #[test]
    fn stage_map_serializes_with_stage_names() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(
            json["stages"]["load_balancer"]["status"],
            serde_json::json!("not_started")
        );
        assert_eq!(json["tier"], serde_json::json!("trial"));
        assert_eq!(json["ssl_status"], serde_json::json!("PENDING"));
    }
}
