//! Provisioning orchestrator: runs the eight stages for one tenant in order
//! and hands a partial record to the rollback manager on failure.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, StageError};
use crate::events::{EventSink, ProvisioningEvent};
use crate::metrics;
use crate::models::{
    CertificateHandle, CredentialBundle, DeploymentRecord, DeploymentResult, DeploymentStatus,
    DnsHandle, SecretsHandle, SslStatus, Stage, StageOutput, TargetsHandle, TenantConfig,
};
use crate::naming::ResourceNames;
use crate::provisioners::Provisioners;
use crate::rollback::RollbackManager;
use crate::store::DeploymentStore;

/// Final record of a run plus the error that ended it, if any.
#[derive(Debug)]
pub struct ProvisionOutcome {
    pub record: DeploymentRecord,
    pub error: Option<ProvisionError>,
}

impl ProvisionOutcome {
    pub fn result(&self) -> DeploymentResult {
        DeploymentResult::from_record(&self.record, self.error.as_ref())
    }
}

/// State carried between stages of one run that is not part of the record.
struct RunContext<'a> {
    config: &'a TenantConfig,
    names: ResourceNames,
    host: String,
    credentials: Option<CredentialBundle>,
}

pub struct Orchestrator {
    config: Arc<ProvisionerConfig>,
    provisioners: Arc<Provisioners>,
    rollback: RollbackManager,
    store: Arc<dyn DeploymentStore>,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ProvisionerConfig>,
        provisioners: Arc<Provisioners>,
        store: Arc<dyn DeploymentStore>,
        events: EventSink,
    ) -> Self {
        Self {
            rollback: RollbackManager::new(provisioners.clone(), events.clone()),
            config,
            provisioners,
            store,
            events,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn provisioners(&self) -> &Provisioners {
        &self.provisioners
    }

    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Run the pipeline to a terminal state. Never panics on stage errors;
    /// the outcome always carries the final record.
    pub async fn provision(&self, config: &TenantConfig, cancel: &CancellationToken) -> ProvisionOutcome {
        let mut record = DeploymentRecord::new(config);

        if let Err(problems) = config.validate() {
            let error = ProvisionError::ConfigValidation { problems };
            tracing::warn!(tenant_id = %config.tenant_id, error = %error, "rejected tenant configuration");
            metrics::error_recorded(error.kind());
            record.error = Some(error.to_string());
            record.finish(DeploymentStatus::Failed);
            return ProvisionOutcome {
                record,
                error: Some(error),
            };
        }

        let started = Instant::now();
        tracing::info!(
            tenant_id = %config.tenant_id,
            run_id = %record.run_id,
            tier = %config.tier,
            "provisioning started"
        );
        self.events.emit(
            &record.tenant_id,
            record.run_id,
            ProvisioningEvent::RunStarted { tier: config.tier },
        );
        record.status = DeploymentStatus::InProgress;
        self.persist(&record).await;

        let mut ctx = RunContext {
            config,
            names: ResourceNames::new(&config.tenant_id),
            host: config.host(&self.config.base_domain),
            credentials: None,
        };

        let mut failure = None;
        for stage in Stage::ALL {
            record.begin_stage(stage);
            self.events.emit(
                &record.tenant_id,
                record.run_id,
                ProvisioningEvent::StageStarted { stage },
            );
            self.persist(&record).await;

            let stage_started = Instant::now();
            let result = if cancel.is_cancelled() {
                Err(StageError::Cancelled(format!("starting stage {stage}")))
            } else {
                self.run_stage(stage, &record, &mut ctx, cancel).await
            };
            let duration_ms = stage_started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    if let StageOutput::Certificate(handle) = &output {
                        record.ssl_status = if handle.certificate_ref.is_some() {
                            SslStatus::Issued
                        } else {
                            SslStatus::Bypassed
                        };
                    }
                    record.complete_stage(output);
                    metrics::stage_finished(stage, "succeeded", duration_ms);
                    self.events.emit(
                        &record.tenant_id,
                        record.run_id,
                        ProvisioningEvent::StageSucceeded { stage, duration_ms },
                    );
                    self.persist(&record).await;
                }
                Err(source) => {
                    record.fail_stage(stage, &source.to_string());
                    metrics::stage_finished(stage, "failed", duration_ms);
                    metrics::error_recorded(source.kind());
                    self.events.emit(
                        &record.tenant_id,
                        record.run_id,
                        ProvisioningEvent::StageFailed {
                            stage,
                            error: source.to_string(),
                        },
                    );
                    self.persist(&record).await;
                    failure = Some(ProvisionError::Stage { stage, source });
                    break;
                }
            }
        }

        let error = match failure {
            None => {
                let scheme = if record.ssl_status == SslStatus::Bypassed {
                    "http"
                } else {
                    "https"
                };
                record.tenant_url = Some(format!("{scheme}://{}", ctx.host));
                record.finish(DeploymentStatus::Completed);
                None
            }
            Some(original) => Some(self.fail(&mut record, original).await),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::run_finished(record.status, duration_ms);
        self.events.emit(
            &record.tenant_id,
            record.run_id,
            ProvisioningEvent::RunFinished {
                status: record.status,
                duration_ms,
            },
        );
        self.persist(&record).await;

        match &error {
            None => tracing::info!(
                tenant_id = %record.tenant_id,
                url = record.tenant_url.as_deref().unwrap_or_default(),
                ssl_status = ?record.ssl_status,
                duration_ms,
                "provisioning completed"
            ),
            Some(e) => tracing::error!(
                tenant_id = %record.tenant_id,
                status = %record.status,
                error = %e,
                "provisioning did not complete"
            ),
        }
        debug_assert!(record.is_consistent());
        ProvisionOutcome { record, error }
    }

    /// Roll back and settle the final status: `rolled_back` when something
    /// was undone cleanly, `failed` when nothing needed undoing or a
    /// compensation failed.
    async fn fail(&self, record: &mut DeploymentRecord, original: ProvisionError) -> ProvisionError {
        record.error = Some(original.to_string());
        let report = self.rollback.rollback(record).await;

        let status = if report.entries.is_empty() || report.has_failures() {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::RolledBack
        };
        let error = if report.has_failures() {
            let failures = report.failure_messages();
            metrics::error_recorded("rollback_partial_failure");
            ProvisionError::RollbackPartialFailure {
                original: Box::new(original),
                failures,
            }
        } else {
            original
        };

        record.rollback = Some(report);
        record.finish(status);
        error
    }

    async fn run_stage(
        &self,
        stage: Stage,
        record: &DeploymentRecord,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let p = &self.provisioners;
        let res = &record.resources;
        let tenant_id = ctx.config.tenant_id.as_str();

        match stage {
            Stage::Certificate => {
                let domain = self.config.base_domain.clone();
                if self.config.ssl_bypass {
                    tracing::warn!(tenant_id, %domain, "TLS bypassed; tenant will be served over plain HTTP");
                    return Ok(StageOutput::Certificate(CertificateHandle {
                        domain,
                        certificate_ref: None,
                        reused: false,
                    }));
                }
                let outcome = p.certificates.ensure_certificate(&domain, cancel).await?;
                Ok(StageOutput::Certificate(CertificateHandle {
                    domain,
                    certificate_ref: Some(outcome.certificate_ref),
                    reused: outcome.reused,
                }))
            }
            Stage::Database => {
                let outcome = p
                    .databases
                    .ensure_database(ctx.config, &p.secrets, cancel)
                    .await?;
                ctx.credentials = Some(outcome.credentials);
                Ok(StageOutput::Database(outcome.handle))
            }
            Stage::Secrets => {
                let credentials = ctx.credentials.as_ref().ok_or_else(|| missing(stage, Stage::Database))?;
                let database_secret_ref = p.secrets.store_credentials(tenant_id, credentials).await?;
                let integrations_secret_ref = p
                    .secrets
                    .store_integration_keys(tenant_id, &ctx.config.integrations)
                    .await?;
                Ok(StageOutput::Secrets(SecretsHandle {
                    database_secret_ref,
                    database_secret_name: ctx.names.database_secret(),
                    integrations_secret_name: integrations_secret_ref
                        .as_ref()
                        .map(|_| ctx.names.integrations_secret()),
                    integrations_secret_ref,
                }))
            }
            Stage::LoadBalancer => {
                let certificate = res.certificate.as_ref().ok_or_else(|| missing(stage, Stage::Certificate))?;
                let handle = p
                    .load_balancers
                    .create_load_balancer(ctx.config, certificate.certificate_ref.as_deref())
                    .await?;
                Ok(StageOutput::LoadBalancer(handle))
            }
            Stage::Cdn => {
                let certificate = res.certificate.as_ref().ok_or_else(|| missing(stage, Stage::Certificate))?;
                let lb = res.load_balancer.as_ref().ok_or_else(|| missing(stage, Stage::LoadBalancer))?;
                let handle = p
                    .cdn
                    .create_distribution(
                        &ctx.names,
                        &lb.dns_name,
                        &ctx.host,
                        certificate.certificate_ref.as_deref(),
                    )
                    .await?;
                Ok(StageOutput::Cdn(handle))
            }
            Stage::Dns => {
                let cdn = res.cdn.as_ref().ok_or_else(|| missing(stage, Stage::Cdn))?;
                let change_ref = p.dns.upsert_record(&ctx.host, "CNAME", &cdn.domain).await?;
                Ok(StageOutput::Dns(DnsHandle {
                    record_name: ctx.host.clone(),
                    record_type: "CNAME".to_string(),
                    value: cdn.domain.clone(),
                    change_ref,
                }))
            }
            Stage::Containers => {
                let credentials = ctx.credentials.as_ref().ok_or_else(|| missing(stage, Stage::Database))?;
                let integrations = res.secrets.as_ref().and_then(|s| s.integrations_secret_name.as_deref());
                let handle = p
                    .containers
                    .deploy_services(ctx.config, credentials, integrations, cancel)
                    .await?;
                Ok(StageOutput::Containers(handle))
            }
            Stage::TargetRegistration => {
                let lb = res.load_balancer.as_ref().ok_or_else(|| missing(stage, Stage::LoadBalancer))?;
                let containers = res.containers.as_ref().ok_or_else(|| missing(stage, Stage::Containers))?;
                p.load_balancers
                    .register_targets(&lb.target_group_ref, &containers.endpoints)
                    .await?;
                tracing::info!(
                    tenant_id,
                    target_group = %lb.target_group_ref,
                    targets = containers.endpoints.len(),
                    "targets registered"
                );
                Ok(StageOutput::TargetRegistration(TargetsHandle {
                    target_group_ref: lb.target_group_ref.clone(),
                    targets: containers.endpoints.clone(),
                }))
            }
        }
    }

    /// Store failures are logged; the run itself carries on.
    pub(crate) async fn persist(&self, record: &DeploymentRecord) {
        if let Err(e) = self.store.save(record).await {
            metrics::error_recorded("store");
            tracing::error!(tenant_id = %record.tenant_id, error = %e, "failed to persist deployment record");
        }
    }
}

fn missing(stage: Stage, needs: Stage) -> StageError {
    StageError::ConfigValidation(format!("stage {stage} needs the output of stage {needs}"))
}
