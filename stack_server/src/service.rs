//! Provisioning service: the upward interface used by the HTTP routes and the CLI.
//!
//! Wraps the orchestrator with a per-tenant run registry and a concurrency
//! limit shared by every tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::ProvisionError;
use crate::metrics;
use crate::models::{
    AccountTier, DeploymentRecord, DeploymentResult, DeploymentStatus, RollbackReport, Stage,
    TenantConfig,
};
use crate::orchestrator::{Orchestrator, ProvisionOutcome};
use crate::providers::TargetHealth;
use crate::provisioners::database::random_password;
use crate::provisioners::UpgradeSummary;

/// Response to a background provisioning request.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub tenant_id: String,
    pub status: DeploymentStatus,
}

/// Path pattern that matches every cached object.
pub const DEFAULT_INVALIDATION_PATH: &str = "/*";

#[derive(Debug, Clone, Serialize)]
pub struct Invalidation {
    pub tenant_id: String,
    pub distribution_id: String,
    pub invalidation_id: String,
    pub paths: Vec<String>,
}

struct LiveRun {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

type Registry = Arc<Mutex<HashMap<String, LiveRun>>>;

/// Registration of one in-flight run; dropping it frees the tenant.
struct RunGuard {
    tenant_id: String,
    registry: Registry,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut runs = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        runs.remove(&self.tenant_id);
        metrics::active_provisions(runs.len());
        let _ = self.done.send(true);
    }
}

enum Admission {
    Start(TenantConfig, RunGuard),
    /// The tenant already has a completed deployment.
    Existing(DeploymentRecord),
}

#[derive(Clone)]
pub struct ProvisioningService {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    registry: Registry,
}

impl ProvisioningService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let permits = orchestrator.config().max_concurrent_provisions.max(1);
        Self {
            orchestrator: Arc::new(orchestrator),
            permits: Arc::new(Semaphore::new(permits)),
            registry: Arc::default(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Provision and wait for a terminal state.
    ///
    /// `Err` is returned only when the run was never started: invalid
    /// configuration, a run already in flight, or a store failure. Pipeline
    /// failures come back inside the result.
    pub async fn provision(&self, config: TenantConfig) -> Result<DeploymentResult, ProvisionError> {
        match self.admit(config).await? {
            Admission::Existing(record) => Ok(DeploymentResult::from_record(&record, None)),
            Admission::Start(config, guard) => Ok(self.run(config, guard).await.result()),
        }
    }

    /// Start provisioning in the background and return immediately.
    pub async fn spawn_provision(&self, config: TenantConfig) -> Result<Accepted, ProvisionError> {
        match self.admit(config).await? {
            Admission::Existing(record) => Ok(Accepted {
                tenant_id: record.tenant_id,
                status: record.status,
            }),
            Admission::Start(config, guard) => {
                let accepted = Accepted {
                    tenant_id: config.tenant_id.clone(),
                    status: DeploymentStatus::InProgress,
                };
                let service = self.clone();
                tokio::spawn(async move {
                    service.run(config, guard).await;
                });
                Ok(accepted)
            }
        }
    }

    pub async fn get_status(&self, tenant_id: &str) -> Result<DeploymentRecord, ProvisionError> {
        self.orchestrator
            .store()
            .get(tenant_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(tenant_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<DeploymentRecord>, ProvisionError> {
        Ok(self.orchestrator.store().list().await?)
    }

    /// Tear the tenant down. A run still in flight is cancelled first and
    /// rolls itself back; whatever it left behind is compensated here.
    pub async fn deprovision(&self, tenant_id: &str) -> Result<RollbackReport, ProvisionError> {
        if let Some((cancel, mut done)) = self.live_run(tenant_id) {
            tracing::info!(tenant_id, "cancelling in-flight provisioning run");
            cancel.cancel();
            // A closed channel also means the run is gone.
            let _ = done.wait_for(|finished| *finished).await;
        }

        let mut record = self.get_status(tenant_id).await?;
        let _guard = self.register(tenant_id)?;

        let report = self
            .orchestrator
            .rollback_manager()
            .rollback(&mut record)
            .await;
        let status = if report.has_failures() {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::RolledBack
        };

        let report = if report.entries.is_empty() {
            // Nothing left to undo; the run's own rollback is the answer.
            record.rollback.clone().unwrap_or(report)
        } else {
            record.rollback = Some(report.clone());
            report
        };
        record.finish(status);
        self.orchestrator.persist(&record).await;

        tracing::info!(
            tenant_id,
            status = %record.status,
            entries = report.entries.len(),
            "tenant deprovisioned"
        );
        Ok(report)
    }

    /// Move a completed tenant to another paid plan.
    pub async fn upgrade_tier(
        &self,
        tenant_id: &str,
        new_tier: AccountTier,
    ) -> Result<UpgradeSummary, ProvisionError> {
        if self.live_run(tenant_id).is_some() {
            return Err(ProvisionError::ProvisioningInProgress(tenant_id.to_string()));
        }
        let mut record = self.completed_record(tenant_id).await?;
        if new_tier.is_trial() || new_tier == record.tier {
            return Err(ProvisionError::InvalidUpgrade {
                tenant_id: tenant_id.to_string(),
                from: record.tier.to_string(),
                to: new_tier.to_string(),
            });
        }
        let handle = record
            .resources
            .database
            .clone()
            .ok_or_else(|| not_completed(&record))?;

        let summary = self
            .orchestrator
            .provisioners()
            .databases
            .upgrade_database(tenant_id, &handle, record.tier, new_tier)
            .await
            .map_err(|source| ProvisionError::Stage {
                stage: Stage::Database,
                source,
            })?;

        record.tier = new_tier;
        if let Some(db) = record.resources.database.as_mut() {
            db.instance_class = summary.sizing.instance_class.clone();
            db.allocated_storage_gb = summary.sizing.allocated_storage_gb;
            db.multi_az = summary.sizing.multi_az;
            db.backup_retention_days = summary.sizing.backup_retention_days;
            db.deletion_protection = summary.sizing.deletion_protection;
        }
        record.updated_at = chrono::Utc::now();
        self.orchestrator.store().save(&record).await?;

        tracing::info!(
            tenant_id,
            from = %summary.from,
            to = %summary.to,
            snapshot = %summary.snapshot_id,
            "tier upgraded"
        );
        Ok(summary)
    }

    /// New master password, written to the secret store and the instance.
    pub async fn rotate_database_password(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let record = self.completed_record(tenant_id).await?;
        let handle = record
            .resources
            .database
            .as_ref()
            .ok_or_else(|| not_completed(&record))?;
        let provisioners = self.orchestrator.provisioners();
        let password = random_password();

        provisioners
            .secrets
            .rotate_password(tenant_id, password.clone())
            .await
            .map_err(|source| ProvisionError::Stage {
                stage: Stage::Secrets,
                source,
            })?;
        provisioners
            .databases
            .rotate_master_password(&handle.instance_id, &password)
            .await
            .map_err(|source| ProvisionError::Stage {
                stage: Stage::Database,
                source,
            })?;
        tracing::info!(tenant_id, instance_id = %handle.instance_id, "database password rotated");
        Ok(())
    }

    /// Purge cached paths from a completed tenant's distribution; every
    /// path when none are given.
    pub async fn invalidate_cache(
        &self,
        tenant_id: &str,
        paths: Vec<String>,
    ) -> Result<Invalidation, ProvisionError> {
        let record = self.completed_record(tenant_id).await?;
        let handle = record.resources.cdn.as_ref().ok_or_else(|| not_completed(&record))?;
        let paths = if paths.is_empty() {
            vec![DEFAULT_INVALIDATION_PATH.to_string()]
        } else {
            paths
        };
        let invalidation_id = self
            .orchestrator
            .provisioners()
            .cdn
            .invalidate(&handle.distribution_id, &paths)
            .await
            .map_err(|source| ProvisionError::Stage {
                stage: Stage::Cdn,
                source,
            })?;
        tracing::info!(tenant_id, distribution_id = %handle.distribution_id, %invalidation_id, "cache invalidation requested");
        Ok(Invalidation {
            tenant_id: tenant_id.to_string(),
            distribution_id: handle.distribution_id.clone(),
            invalidation_id,
            paths,
        })
    }

    /// Health of the containers registered behind the tenant's load balancer.
    pub async fn target_health(&self, tenant_id: &str) -> Result<Vec<TargetHealth>, ProvisionError> {
        let record = self.completed_record(tenant_id).await?;
        let handle = record
            .resources
            .load_balancer
            .as_ref()
            .ok_or_else(|| not_completed(&record))?;
        self.orchestrator
            .provisioners()
            .load_balancers
            .target_health(&handle.target_group_ref)
            .await
            .map_err(|source| ProvisionError::Stage {
                stage: Stage::TargetRegistration,
                source,
            })
    }

    pub fn active_runs(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn admit(&self, config: TenantConfig) -> Result<Admission, ProvisionError> {
        config
            .validate()
            .map_err(|problems| ProvisionError::ConfigValidation { problems })?;
        let tenant_id = config.tenant_id.clone();
        if self.live_run(&tenant_id).is_some() {
            return Err(ProvisionError::ProvisioningInProgress(tenant_id));
        }

        if let Some(existing) = self.orchestrator.store().get(&tenant_id).await? {
            if existing.status == DeploymentStatus::Completed {
                tracing::info!(tenant_id = %tenant_id, "tenant already provisioned");
                return Ok(Admission::Existing(existing));
            }
            if !existing.status.is_terminal() {
                return Err(ProvisionError::ProvisioningInProgress(tenant_id));
            }
        }

        let guard = self.register(&tenant_id)?;
        Ok(Admission::Start(config, guard))
    }

    async fn run(&self, config: TenantConfig, guard: RunGuard) -> ProvisionOutcome {
        let cancel = guard.cancel.clone();
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        let outcome = self.orchestrator.provision(&config, &cancel).await;
        drop(guard);
        outcome
    }

    fn register(&self, tenant_id: &str) -> Result<RunGuard, ProvisionError> {
        let mut runs = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(tenant_id) {
            return Err(ProvisionError::ProvisioningInProgress(tenant_id.to_string()));
        }
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        runs.insert(
            tenant_id.to_string(),
            LiveRun {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        metrics::active_provisions(runs.len());
        Ok(RunGuard {
            tenant_id: tenant_id.to_string(),
            registry: self.registry.clone(),
            cancel,
            done: done_tx,
        })
    }

    fn live_run(&self, tenant_id: &str) -> Option<(CancellationToken, watch::Receiver<bool>)> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .map(|run| (run.cancel.clone(), run.done.clone()))
    }

    async fn completed_record(&self, tenant_id: &str) -> Result<DeploymentRecord, ProvisionError> {
        let record = self.get_status(tenant_id).await?;
        if record.status != DeploymentStatus::Completed {
            return Err(not_completed(&record));
        }
        Ok(record)
    }
}

fn not_completed(record: &DeploymentRecord) -> ProvisionError {
    ProvisionError::NotCompleted {
        tenant_id: record.tenant_id.clone(),
        status: record.status.to_string(),
    }
}
