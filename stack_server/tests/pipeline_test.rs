mod common;

use std::time::Duration;

use tenantstack::config::ProvisionerConfig;
use tenantstack::events::{DeploymentProgress, ProvisioningEvent};
use tenantstack::models::{
    AccountTier, CompensationOutcome, DeploymentStatus, PaidPlan, SslStatus, Stage, StageStatus,
    TenantConfig,
};
use tenantstack::poll::PollSettings;
use tenantstack::providers::simulated::{Outcome, SimulationSettings};
use tenantstack::providers::{ListenerAction, ViewerProtocolPolicy};
use tenantstack::store::DeploymentStore;
use tenantstack::{ProvisionError, StageError};
use tokio_util::sync::CancellationToken;

use common::{default_harness, drain, harness};

fn professional(tenant_id: &str) -> TenantConfig {
    TenantConfig::new(tenant_id, AccountTier::Paid(PaidPlan::Professional))
}

#[tokio::test(start_paused = true)]
async fn trial_tenant_gets_a_complete_stack() {
    let mut h = default_harness();
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-1", AccountTier::Trial), &CancellationToken::new())
        .await;

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    let record = &outcome.record;
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(record.ssl_status, SslStatus::Issued);
    assert_eq!(record.tenant_url.as_deref(), Some("https://acme-1.tenantstack.test"));
    for stage in Stage::ALL {
        assert_eq!(record.stage_status(stage), StageStatus::Succeeded, "{stage}");
        assert!(record.resources.has(stage), "{stage}");
    }
    assert!(record.is_consistent());

    let request = h.cloud.instance_request("acme-1-db").unwrap();
    assert_eq!(request.instance_class, "db.t3.micro");
    assert_eq!(request.backup_retention_days, 0);
    assert!(!request.multi_az);
    assert!(request.storage_encrypted);
    assert!(!request.publicly_accessible);

    let cname = h.cloud.record("acme-1.tenantstack.test", "CNAME").unwrap();
    assert_eq!(cname.value, record.resources.cdn.as_ref().unwrap().domain);

    let stored = h.store.get("acme-1").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Completed);
    assert_eq!(stored.run_id, record.run_id);

    let events: Vec<_> = drain(&mut h.events).into_iter().map(|e| e.event).collect();
    assert!(matches!(events.first(), Some(ProvisioningEvent::RunStarted { .. })));
    let progress = DeploymentProgress::from_events(&events);
    assert_eq!(progress.status, DeploymentStatus::Completed);
    assert_eq!(progress.succeeded, Stage::ALL.to_vec());
}

#[tokio::test(start_paused = true)]
async fn professional_tier_gets_multi_az_database() {
    let h = default_harness();
    let outcome = h
        .orchestrator
        .provision(&professional("acme-2"), &CancellationToken::new())
        .await;
    assert_eq!(outcome.record.status, DeploymentStatus::Completed);

    let request = h.cloud.instance_request("acme-2-db").unwrap();
    assert!(request.multi_az);
    assert_eq!(request.backup_retention_days, 7);
    assert!(request.deletion_protection);
    let db = outcome.record.resources.database.unwrap();
    assert!(db.multi_az);
}

#[tokio::test(start_paused = true)]
async fn bypass_serves_plain_http_without_certificate() {
    let config = ProvisionerConfig {
        ssl_bypass: true,
        ..ProvisionerConfig::default()
    };
    let h = harness(SimulationSettings::default(), config);
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-3", AccountTier::Trial), &CancellationToken::new())
        .await;

    let record = &outcome.record;
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(record.ssl_status, SslStatus::Bypassed);
    assert_eq!(record.tenant_url.as_deref(), Some("http://acme-3.tenantstack.test"));
    assert!(record.resources.certificate.as_ref().unwrap().certificate_ref.is_none());
    assert_eq!(h.cloud.certificate_count(), 0);

    let lb = record.resources.load_balancer.as_ref().unwrap();
    let listeners = h.cloud.listeners_of(&lb.load_balancer_ref);
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].port, 80);
    assert!(matches!(listeners[0].action, ListenerAction::Forward { .. }));

    let distribution = h.cloud.distribution("tenantstack-acme-3").unwrap();
    assert_eq!(distribution.viewer_protocol_policy, ViewerProtocolPolicy::AllowAll);
}

#[tokio::test(start_paused = true)]
async fn certificate_failure_fails_without_rollback_work() {
    let settings = SimulationSettings {
        certificate: Outcome::FailAfter(1),
        ..SimulationSettings::default()
    };
    let h = harness(settings, ProvisionerConfig::default());
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-4", AccountTier::Trial), &CancellationToken::new())
        .await;

    assert_eq!(outcome.record.status, DeploymentStatus::Failed);
    assert_eq!(outcome.record.stage_status(Stage::Certificate), StageStatus::Failed);
    assert_eq!(outcome.error.as_ref().and_then(|e| e.stage()), Some(Stage::Certificate));
    assert!(h.cloud.calls_to("CreateInstance").is_empty());
    assert!(outcome.record.rollback.unwrap().entries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cdn_failure_rolls_back_in_reverse_order() {
    let h = default_harness();
    h.cloud.fail_on("CreateDistribution");
    let outcome = h
        .orchestrator
        .provision(&professional("acme-5"), &CancellationToken::new())
        .await;

    let record = &outcome.record;
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert_eq!(record.stage_status(Stage::Cdn), StageStatus::Failed);
    assert_eq!(record.stage_status(Stage::Dns), StageStatus::NotStarted);
    assert!(matches!(
        outcome.error,
        Some(ProvisionError::Stage {
            stage: Stage::Cdn,
            source: StageError::ExternalApi { op: "CreateDistribution", .. },
        })
    ));

    let report = record.rollback.as_ref().unwrap();
    assert_eq!(
        report.stage_order(),
        vec![Stage::LoadBalancer, Stage::Secrets, Stage::Database, Stage::Certificate]
    );
    assert!(!report.has_failures());
    for stage in [Stage::LoadBalancer, Stage::Secrets, Stage::Database, Stage::Certificate] {
        assert_eq!(record.stage_status(stage), StageStatus::RolledBack, "{stage}");
        assert!(!record.resources.has(stage), "{stage}");
    }
    assert!(record.is_consistent());

    assert!(h.cloud.load_balancer_names().is_empty());
    assert!(h.cloud.instance("acme-5-db").is_none());
    assert_eq!(h.cloud.snapshots().len(), 1);
    assert!(h.cloud.live_secret_names().is_empty());
    assert_eq!(h.cloud.certificate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn database_that_never_settles_times_out() {
    let settings = SimulationSettings {
        database: Outcome::Never,
        ..SimulationSettings::default()
    };
    let h = harness(settings, ProvisionerConfig::default());
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-6", AccountTier::Trial), &CancellationToken::new())
        .await;

    assert!(matches!(
        outcome.error.as_ref().and_then(|e| e.stage_error()),
        Some(StageError::ValidationTimeout { .. })
    ));
    assert_eq!(outcome.record.stage_status(Stage::Database), StageStatus::Failed);
    assert_eq!(outcome.record.status, DeploymentStatus::RolledBack);
    let report = outcome.record.rollback.unwrap();
    assert_eq!(report.stage_order(), vec![Stage::Database, Stage::Certificate]);
    assert_eq!(report.entries[0].action, "delete instance");
    assert_eq!(report.entries[0].outcome, CompensationOutcome::Scheduled);
    assert_eq!(report.entries[1].resource, "tenants/acme-6/database");
    assert!(h.cloud.instance("acme-6-db").is_none());
    assert_eq!(h.cloud.snapshots().len(), 1);
    assert!(h.cloud.live_secret_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn instance_kept_by_failed_cleanup_is_adopted_by_next_run() {
    let settings = SimulationSettings {
        database: Outcome::ReadyAfter(6),
        ..SimulationSettings::default()
    };
    let config = ProvisionerConfig {
        database_poll: PollSettings::new(30, 60, 120),
        ..ProvisionerConfig::default()
    };
    let h = harness(settings, config);
    h.cloud.fail_on("DeleteInstance");
    let tenant = TenantConfig::new("acme-6b", AccountTier::Trial);

    let first = h.orchestrator.provision(&tenant, &CancellationToken::new()).await;
    match &first.error {
        Some(ProvisionError::RollbackPartialFailure { original, failures }) => {
            assert!(matches!(
                original.stage_error(),
                Some(StageError::ValidationTimeout { .. })
            ));
            assert_eq!(failures.len(), 1);
        }
        other => panic!("expected partial rollback failure, got {other:?}"),
    }
    assert_eq!(first.record.status, DeploymentStatus::Failed);
    let report = first.record.rollback.as_ref().unwrap();
    assert_eq!(report.failures()[0].stage, Stage::Database);
    assert_eq!(first.record.stages_to_compensate(), vec![Stage::Database]);
    // Credentials stay with the instance they belong to.
    assert!(h.cloud.instance("acme-6b-db").is_some());
    assert!(h
        .cloud
        .live_secret_names()
        .contains(&"tenants/acme-6b/database".to_string()));

    h.cloud.clear_failures();
    let second = h.orchestrator.provision(&tenant, &CancellationToken::new()).await;
    assert!(second.error.is_none(), "{:?}", second.error);
    assert_eq!(second.record.status, DeploymentStatus::Completed);
    assert_eq!(h.cloud.calls_to("CreateInstance").len(), 1);
    let created = h.cloud.instance_request("acme-6b-db").unwrap();
    assert_eq!(
        second.record.resources.database.as_ref().unwrap().instance_id,
        created.instance_id
    );
}

#[tokio::test(start_paused = true)]
async fn single_public_subnet_is_a_configuration_error() {
    let settings = SimulationSettings {
        public_subnets: 1,
        ..SimulationSettings::default()
    };
    let h = harness(settings, ProvisionerConfig::default());
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-7", AccountTier::Trial), &CancellationToken::new())
        .await;

    assert_eq!(outcome.error.as_ref().map(|e| e.kind()), Some("config_validation"));
    assert_eq!(outcome.record.stage_status(Stage::LoadBalancer), StageStatus::Failed);
    assert!(h.cloud.calls_to("CreateLoadBalancer").is_empty());
    assert_eq!(
        outcome.record.rollback.unwrap().stage_order(),
        vec![Stage::Secrets, Stage::Database, Stage::Certificate]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_secrets_stage_sweeps_tenant_secrets() {
    let h = default_harness();
    // The database stage creates the secret; the secrets stage has to update it.
    h.cloud.fail_on("UpdateSecret");
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-7b", AccountTier::Trial), &CancellationToken::new())
        .await;

    assert_eq!(outcome.record.stage_status(Stage::Secrets), StageStatus::Failed);
    assert_eq!(outcome.record.status, DeploymentStatus::RolledBack);
    let report = outcome.record.rollback.as_ref().unwrap();
    assert_eq!(
        report.stage_order(),
        vec![Stage::Secrets, Stage::Database, Stage::Certificate]
    );
    assert_eq!(report.entries[0].resource, "tenants/acme-7b/database");
    assert!(h.cloud.live_secret_names().is_empty());
    assert!(h.cloud.instance("acme-7b-db").is_none());
    assert!(outcome.record.stages_to_compensate().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_database_wait_rolls_back() {
    let settings = SimulationSettings {
        database: Outcome::Never,
        ..SimulationSettings::default()
    };
    let h = harness(settings, ProvisionerConfig::default());
    let cancel = CancellationToken::new();

    let orchestrator = h.orchestrator.clone();
    let token = cancel.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .provision(&TenantConfig::new("acme-8", AccountTier::Trial), &token)
            .await
    });

    while h.cloud.calls_to("DescribeInstance").len() < 3 {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    cancel.cancel();
    let outcome = run.await.unwrap();

    assert_eq!(outcome.error.as_ref().map(|e| e.kind()), Some("cancelled"));
    assert_eq!(outcome.record.stage_status(Stage::Database), StageStatus::Failed);
    assert_eq!(outcome.record.status, DeploymentStatus::RolledBack);
    assert_eq!(outcome.record.stage_status(Stage::Secrets), StageStatus::NotStarted);
    assert!(h.cloud.instance("acme-8-db").is_none());
    assert!(outcome.record.stages_to_compensate().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_compensation_is_reported_and_kept() {
    let h = default_harness();
    h.cloud.fail_on("CreateDistribution");
    h.cloud.fail_on("DeleteLoadBalancer");
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("acme-9", AccountTier::Trial), &CancellationToken::new())
        .await;

    let record = &outcome.record;
    assert_eq!(record.status, DeploymentStatus::Failed);
    match &outcome.error {
        Some(ProvisionError::RollbackPartialFailure { original, failures }) => {
            assert_eq!(original.stage(), Some(Stage::Cdn));
            assert_eq!(failures.len(), 1);
        }
        other => panic!("expected partial rollback failure, got {other:?}"),
    }

    // The load balancer is still there and still owned by the record.
    assert_eq!(record.stage_status(Stage::LoadBalancer), StageStatus::Succeeded);
    assert!(record.resources.load_balancer.is_some());
    assert_eq!(h.cloud.load_balancer_names().len(), 1);
    // Earlier stages were still compensated.
    assert_eq!(record.stage_status(Stage::Database), StageStatus::RolledBack);
    assert!(record.is_consistent());

    let result = outcome.result();
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "rollback_partial_failure");
}

#[tokio::test(start_paused = true)]
async fn rerun_after_rollback_completes() {
    let h = default_harness();
    h.cloud.fail_on("DeployStack");
    let config = TenantConfig::new("acme-10", AccountTier::Trial);
    let first = h.orchestrator.provision(&config, &CancellationToken::new()).await;
    assert_eq!(first.record.status, DeploymentStatus::RolledBack);

    h.cloud.clear_failures();
    let second = h.orchestrator.provision(&config, &CancellationToken::new()).await;
    assert_eq!(second.record.status, DeploymentStatus::Completed);
    assert_ne!(first.record.run_id, second.record.run_id);
    assert_eq!(h.cloud.load_balancer_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_provisioning_reuses_resources() {
    let h = default_harness();
    let config = TenantConfig::new("acme-11", AccountTier::Trial);
    let first = h.orchestrator.provision(&config, &CancellationToken::new()).await;
    let second = h.orchestrator.provision(&config, &CancellationToken::new()).await;

    assert_eq!(first.record.status, DeploymentStatus::Completed);
    assert_eq!(second.record.status, DeploymentStatus::Completed);
    assert_eq!(h.cloud.calls_to("CreateInstance").len(), 1);
    assert_eq!(h.cloud.calls_to("RequestCertificate").len(), 1);
    assert_eq!(h.cloud.load_balancer_names().len(), 1);
    let (r1, r2) = (&first.record.resources, &second.record.resources);
    assert_eq!(
        r1.database.as_ref().unwrap().instance_id,
        r2.database.as_ref().unwrap().instance_id
    );
    assert_eq!(
        r1.certificate.as_ref().unwrap().certificate_ref,
        r2.certificate.as_ref().unwrap().certificate_ref
    );
    assert_eq!(
        r1.secrets.as_ref().unwrap().database_secret_ref,
        r2.secrets.as_ref().unwrap().database_secret_ref
    );
}

#[tokio::test(start_paused = true)]
async fn tenants_never_share_resource_names() {
    let h = default_harness();
    for tenant_id in ["acme", "acme-1"] {
        let outcome = h
            .orchestrator
            .provision(&TenantConfig::new(tenant_id, AccountTier::Trial), &CancellationToken::new())
            .await;
        assert_eq!(outcome.record.status, DeploymentStatus::Completed, "{tenant_id}");
    }

    let instances: Vec<_> = h.cloud.calls_to("CreateInstance").into_iter().map(|c| c.name).collect();
    assert_eq!(instances, vec!["acme-db".to_string(), "acme-1-db".to_string()]);
    assert_eq!(h.cloud.load_balancer_names().len(), 2);
    let stacks: Vec<_> = h.cloud.calls_to("DeployStack").into_iter().map(|c| c.name).collect();
    assert_eq!(stacks.len(), 2);
    assert_ne!(stacks[0], stacks[1]);
    assert!(h.cloud.record("acme.tenantstack.test", "CNAME").is_some());
    assert!(h.cloud.record("acme-1.tenantstack.test", "CNAME").is_some());
}

#[tokio::test(start_paused = true)]
async fn invalid_tenant_id_fails_before_any_call() {
    let h = default_harness();
    let outcome = h
        .orchestrator
        .provision(&TenantConfig::new("Bad_Tenant", AccountTier::Trial), &CancellationToken::new())
        .await;
    assert_eq!(outcome.record.status, DeploymentStatus::Failed);
    assert!(matches!(outcome.error, Some(ProvisionError::ConfigValidation { .. })));
    assert!(h.cloud.calls().is_empty());
}
