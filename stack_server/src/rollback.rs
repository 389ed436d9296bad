//! Rollback manager: compensates succeeded stages in reverse order.
//!
//! Every compensation is attempted even when an earlier one failed. A stage
//! whose compensation failed keeps its handle and stays `succeeded`, so a
//! later deprovision can retry it. A failed stage has no handle, so whatever
//! it created before failing is looked up by its deterministic name.

use std::sync::Arc;

use crate::events::{EventSink, ProvisioningEvent};
use crate::metrics;
use crate::models::{
    CompensationOutcome, DeploymentRecord, RollbackReport, SslStatus, Stage,
};
use crate::naming::ResourceNames;
use crate::provisioners::Provisioners;

pub struct RollbackManager {
    provisioners: Arc<Provisioners>,
    events: EventSink,
}

impl RollbackManager {
    pub fn new(provisioners: Arc<Provisioners>, events: EventSink) -> Self {
        Self {
            provisioners,
            events,
        }
    }

    /// Undo every `succeeded` stage of the record, last stage first, and
    /// remove anything a failed stage left behind.
    pub async fn rollback(&self, record: &mut DeploymentRecord) -> RollbackReport {
        let mut report = RollbackReport::new(&record.tenant_id);
        let succeeded = record.succeeded_stages();
        let stages: Vec<Stage> = record
            .stages_to_compensate()
            .into_iter()
            .filter(|s| succeeded.contains(s) || leaves_resources(*s))
            .rev()
            .collect();
        if stages.is_empty() {
            report.finished_at = Some(chrono::Utc::now());
            return report;
        }

        self.events.emit(
            &record.tenant_id,
            record.run_id,
            ProvisioningEvent::RollbackStarted {
                stages: stages.clone(),
            },
        );

        for stage in stages {
            let first = report.entries.len();
            let was_succeeded = succeeded.contains(&stage);
            if was_succeeded {
                self.compensate(stage, record, &mut report).await;
            } else {
                self.clean_up_failed(stage, &record.tenant_id, &mut report).await;
            }
            let entries = &report.entries[first..];

            let failed = entries
                .iter()
                .any(|e| e.outcome == CompensationOutcome::Failed);
            for entry in entries {
                metrics::compensation_recorded(stage, outcome_label(entry.outcome));
            }
            let outcome = if failed {
                CompensationOutcome::Failed
            } else if entries
                .iter()
                .all(|e| e.outcome == CompensationOutcome::Skipped)
            {
                CompensationOutcome::Skipped
            } else if entries
                .iter()
                .any(|e| e.outcome == CompensationOutcome::Scheduled)
            {
                CompensationOutcome::Scheduled
            } else {
                CompensationOutcome::Succeeded
            };

            match (failed, was_succeeded) {
                (false, true) => record.mark_compensated(stage),
                (false, false) => record.mark_cleaned_up(stage),
                (true, _) => {}
            }
            if !was_succeeded && entries.is_empty() {
                continue;
            }
            self.events.emit(
                &record.tenant_id,
                record.run_id,
                ProvisioningEvent::StageCompensated { stage, outcome },
            );
        }

        report.finished_at = Some(chrono::Utc::now());
        if report.has_failures() {
            tracing::error!(
                tenant_id = %record.tenant_id,
                failures = report.failures().len(),
                "rollback left resources behind"
            );
        }
        report
    }

    async fn compensate(&self, stage: Stage, record: &DeploymentRecord, report: &mut RollbackReport) {
        let p = &self.provisioners;
        let res = &record.resources;
        let tenant_id = record.tenant_id.as_str();

        match stage {
            Stage::TargetRegistration => {
                let Some(h) = &res.targets else { return missing(report, stage) };
                let result = p
                    .load_balancers
                    .deregister_targets(&h.target_group_ref, &h.targets)
                    .await;
                settle(report, stage, &h.target_group_ref, "deregister targets", result.map(|_| None));
            }
            Stage::Containers => {
                let Some(h) = &res.containers else { return missing(report, stage) };
                let result = p.containers.remove_stack(&h.stack_name).await;
                settle(report, stage, &h.stack_name, "remove stack", result.map(gone_note));
            }
            Stage::Dns => {
                let Some(h) = &res.dns else { return missing(report, stage) };
                let result = p.dns.delete_record(&h.record_name, &h.record_type, &h.value).await;
                settle(report, stage, &h.record_name, "delete record", result.map(|_| None));
            }
            Stage::Cdn => {
                let Some(h) = &res.cdn else { return missing(report, stage) };
                let result = p.cdn.delete_distribution(&h.distribution_id).await;
                settle(report, stage, &h.distribution_id, "disable and delete distribution", result.map(gone_note));
            }
            Stage::LoadBalancer => {
                let Some(h) = &res.load_balancer else { return missing(report, stage) };
                let result = p.load_balancers.delete(h).await;
                settle(report, stage, &h.load_balancer_ref, "delete listeners, load balancer, target group", result.map(gone_note));
            }
            Stage::Secrets => {
                let Some(h) = &res.secrets else { return missing(report, stage) };
                let mut names = vec![h.database_secret_name.clone()];
                names.extend(h.integrations_secret_name.clone());
                for name in names {
                    match p.secrets.delete_secret(&name).await {
                        Ok(Some(when)) => report.record(
                            stage,
                            name,
                            "schedule secret deletion",
                            CompensationOutcome::Scheduled,
                            Some(format!("erased after {}", when.to_rfc3339())),
                        ),
                        Ok(None) => report.record(
                            stage,
                            name,
                            "schedule secret deletion",
                            CompensationOutcome::Succeeded,
                            Some("already deleted".to_string()),
                        ),
                        Err(e) => report.record(
                            stage,
                            name,
                            "schedule secret deletion",
                            CompensationOutcome::Failed,
                            Some(e.to_string()),
                        ),
                    }
                }
            }
            Stage::Database => {
                let Some(h) = &res.database else { return missing(report, stage) };
                match p.databases.delete_database(tenant_id, h).await {
                    Ok(Some(snapshot)) => report.record(
                        stage,
                        &h.instance_id,
                        "delete instance",
                        CompensationOutcome::Scheduled,
                        Some(format!("final snapshot {snapshot}")),
                    ),
                    Ok(None) => report.record(
                        stage,
                        &h.instance_id,
                        "delete instance",
                        CompensationOutcome::Succeeded,
                        Some("already deleted".to_string()),
                    ),
                    Err(e) => report.record(
                        stage,
                        &h.instance_id,
                        "delete instance",
                        CompensationOutcome::Failed,
                        Some(e.to_string()),
                    ),
                }
            }
            Stage::Certificate => {
                let detail = if record.ssl_status == SslStatus::Bypassed {
                    "TLS bypassed"
                } else {
                    "shared wildcard certificate"
                };
                let resource = res
                    .certificate
                    .as_ref()
                    .and_then(|h| h.certificate_ref.clone())
                    .unwrap_or_else(|| "none".to_string());
                report.record(
                    stage,
                    resource,
                    "keep certificate",
                    CompensationOutcome::Skipped,
                    Some(detail.to_string()),
                );
            }
        }
    }

    /// Remove what a failed stage created before it failed. Only resources
    /// that still exist produce report entries.
    async fn clean_up_failed(&self, stage: Stage, tenant_id: &str, report: &mut RollbackReport) {
        let p = &self.provisioners;
        let names = ResourceNames::new(tenant_id);

        match stage {
            Stage::Database => {
                let instance_id = names.db_instance();
                match p.databases.delete_leftover(tenant_id).await {
                    Ok(Some(removed)) => {
                        let (outcome, detail) = match removed.final_snapshot {
                            Some(snapshot) => {
                                (CompensationOutcome::Scheduled, format!("final snapshot {snapshot}"))
                            }
                            None => (CompensationOutcome::Succeeded, "already deleted".to_string()),
                        };
                        report.record(stage, &removed.instance_id, "delete instance", outcome, Some(detail));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%stage, %instance_id, error = %e, "leftover instance not removed");
                        report.record(
                            stage,
                            &instance_id,
                            "delete instance",
                            CompensationOutcome::Failed,
                            Some(e.to_string()),
                        );
                        // The credentials must outlive the instance.
                        return;
                    }
                }
                let secret = names.database_secret();
                match p.secrets.delete_secret(&secret).await {
                    Ok(Some(when)) => report.record(
                        stage,
                        secret,
                        "schedule secret deletion",
                        CompensationOutcome::Scheduled,
                        Some(format!("erased after {}", when.to_rfc3339())),
                    ),
                    Ok(None) => {}
                    Err(e) => report.record(
                        stage,
                        secret,
                        "schedule secret deletion",
                        CompensationOutcome::Failed,
                        Some(e.to_string()),
                    ),
                }
            }
            Stage::Secrets => match p.secrets.delete_tenant_secrets(tenant_id).await {
                Ok(scheduled) => {
                    for (name, when) in scheduled {
                        report.record(
                            stage,
                            name,
                            "schedule secret deletion",
                            CompensationOutcome::Scheduled,
                            Some(format!("erased after {}", when.to_rfc3339())),
                        );
                    }
                }
                Err(e) => report.record(
                    stage,
                    format!("tenant {tenant_id}"),
                    "sweep tenant secrets",
                    CompensationOutcome::Failed,
                    Some(e.to_string()),
                ),
            },
            Stage::LoadBalancer => match p.load_balancers.delete_leftovers(tenant_id).await {
                Ok(false) => {}
                result => settle(
                    report,
                    stage,
                    &names.load_balancer(),
                    "delete listeners, load balancer, target group",
                    result.map(|_| None),
                ),
            },
            Stage::Cdn => match p.cdn.delete_leftover(&names).await {
                Ok(None) => {}
                Ok(Some(id)) => settle(report, stage, &id, "disable and delete distribution", Ok(None)),
                Err(e) => settle(
                    report,
                    stage,
                    &names.distribution_ref(),
                    "disable and delete distribution",
                    Err(e),
                ),
            },
            Stage::Containers => match p.containers.remove_stack(&names.stack()).await {
                Ok(false) => {}
                result => settle(report, stage, &names.stack(), "remove stack", result.map(|_| None)),
            },
            Stage::Certificate | Stage::Dns | Stage::TargetRegistration => {}
        }
    }
}

/// Stages that can leave resources behind when they fail part-way.
fn leaves_resources(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::Database | Stage::Secrets | Stage::LoadBalancer | Stage::Cdn | Stage::Containers
    )
}

fn settle(
    report: &mut RollbackReport,
    stage: Stage,
    resource: &str,
    action: &str,
    result: Result<Option<String>, crate::error::StageError>,
) {
    match result {
        Ok(detail) => report.record(stage, resource, action, CompensationOutcome::Succeeded, detail),
        Err(e) => {
            tracing::warn!(%stage, resource, action, error = %e, "compensation failed");
            report.record(stage, resource, action, CompensationOutcome::Failed, Some(e.to_string()))
        }
    }
}

fn gone_note(removed: bool) -> Option<String> {
    (!removed).then(|| "already deleted".to_string())
}

/// A succeeded stage without a handle breaks the record invariant.
fn missing(report: &mut RollbackReport, stage: Stage) {
    report.record(
        stage,
        "unknown",
        "compensate",
        CompensationOutcome::Failed,
        Some("no resource handle recorded".to_string()),
    );
}

fn outcome_label(outcome: CompensationOutcome) -> &'static str {
    match outcome {
        CompensationOutcome::Succeeded => "succeeded",
        CompensationOutcome::Failed => "failed",
        CompensationOutcome::Scheduled => "scheduled",
        CompensationOutcome::Skipped => "skipped",
    }
}

