mod common;

use std::time::Duration;

use tenantstack::models::{AccountTier, DeploymentStatus, PaidPlan, Stage, TenantConfig};
use tenantstack::providers::simulated::{Outcome, SimulationSettings};
use tenantstack::store::DeploymentStore;
use tenantstack::ProvisionError;

use common::service_harness;

const PROFESSIONAL: AccountTier = AccountTier::Paid(PaidPlan::Professional);

#[tokio::test(start_paused = true)]
async fn second_request_while_running_is_refused() {
    let settings = SimulationSettings {
        database: Outcome::Never,
        ..SimulationSettings::default()
    };
    let h = service_harness(settings);
    let config = TenantConfig::new("acme-1", AccountTier::Trial);

    let accepted = h.service.spawn_provision(config.clone()).await.unwrap();
    assert_eq!(accepted.status, DeploymentStatus::InProgress);
    assert_eq!(h.service.active_runs(), 1);

    let err = h.service.spawn_provision(config.clone()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ProvisioningInProgress(ref id) if id == "acme-1"));
    let err = h.service.provision(config).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ProvisioningInProgress(_)));

    // Deprovision cancels the run, waits for it and settles the record.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let report = h.service.deprovision("acme-1").await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(h.service.active_runs(), 0);

    let record = h.service.get_status("acme-1").await.unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(record.is_consistent());
}

#[tokio::test(start_paused = true)]
async fn deprovision_during_database_wait_removes_the_instance() {
    let settings = SimulationSettings {
        database: Outcome::Never,
        ..SimulationSettings::default()
    };
    let h = service_harness(settings);
    h.service
        .spawn_provision(TenantConfig::new("acme-1b", AccountTier::Trial))
        .await
        .unwrap();
    while h.cloud.calls_to("DescribeInstance").len() < 3 {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    assert!(h.cloud.instance("acme-1b-db").is_some());

    let report = h.service.deprovision("acme-1b").await.unwrap();
    assert!(!report.has_failures());
    assert!(report
        .entries
        .iter()
        .any(|e| e.stage == Stage::Database && e.action == "delete instance"));
    assert!(h.cloud.instance("acme-1b-db").is_none());
    assert!(h.cloud.live_secret_names().is_empty());

    // Nothing is left for a second deprovision to do.
    let again = h.service.deprovision("acme-1b").await.unwrap();
    assert_eq!(again, report);
    assert_eq!(h.cloud.calls_to("DeleteInstance").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn completed_tenant_is_returned_unchanged() {
    let h = service_harness(SimulationSettings::default());
    let config = TenantConfig::new("acme-2", AccountTier::Trial);

    let first = h.service.provision(config.clone()).await.unwrap();
    assert!(first.success);
    let again = h.service.provision(config).await.unwrap();
    assert!(again.success);
    assert_eq!(again.tenant_url, first.tenant_url);
    assert_eq!(h.cloud.calls_to("CreateInstance").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn deprovision_tears_down_a_completed_stack() {
    let h = service_harness(SimulationSettings::default());
    h.service
        .provision(TenantConfig::new("acme-3", PROFESSIONAL))
        .await
        .unwrap();

    let report = h.service.deprovision("acme-3").await.unwrap();
    assert_eq!(report.stage_order().len(), 8);
    assert!(!report.has_failures());
    assert!(h.cloud.load_balancer_names().is_empty());
    assert!(h.cloud.instance("acme-3-db").is_none());
    assert!(h.cloud.record("acme-3.tenantstack.test", "CNAME").is_none());
    assert!(h.cloud.stack("tenant-acme-3").is_none());

    let stored = h.store.get("acme-3").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::RolledBack);
    assert_eq!(stored.rollback, Some(report));
}

#[tokio::test(start_paused = true)]
async fn unknown_tenant_is_not_found() {
    let h = service_harness(SimulationSettings::default());
    assert!(matches!(
        h.service.get_status("nobody").await,
        Err(ProvisionError::NotFound(_))
    ));
    assert!(matches!(
        h.service.deprovision("nobody").await,
        Err(ProvisionError::NotFound(_))
    ));
    assert!(matches!(
        h.service.upgrade_tier("nobody", PROFESSIONAL).await,
        Err(ProvisionError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn upgrade_snapshots_then_schedules_resize() {
    let h = service_harness(SimulationSettings::default());
    h.service
        .provision(TenantConfig::new("acme-4", AccountTier::Paid(PaidPlan::Basic)))
        .await
        .unwrap();

    let summary = h.service.upgrade_tier("acme-4", PROFESSIONAL).await.unwrap();
    assert_eq!(summary.to, PROFESSIONAL);
    assert!(!summary.apply_immediately);
    assert!(summary.sizing.multi_az);
    assert_eq!(summary.sizing.instance_class, "db.t3.small");
    assert!(h.cloud.snapshots().contains(&summary.snapshot_id));

    let modifications = h.cloud.modifications("acme-4-db");
    assert_eq!(modifications.len(), 1);
    assert!(!modifications[0].apply_immediately);

    let record = h.service.get_status("acme-4").await.unwrap();
    assert_eq!(record.tier, PROFESSIONAL);
    assert!(record.resources.database.unwrap().multi_az);
}

#[tokio::test(start_paused = true)]
async fn upgrade_to_trial_or_same_tier_is_refused() {
    let h = service_harness(SimulationSettings::default());
    h.service
        .provision(TenantConfig::new("acme-5", PROFESSIONAL))
        .await
        .unwrap();

    for tier in [AccountTier::Trial, PROFESSIONAL] {
        let err = h.service.upgrade_tier("acme-5", tier).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidUpgrade { .. }), "{tier}");
    }
    assert!(h.cloud.calls_to("CreateSnapshot").is_empty());
}

#[tokio::test(start_paused = true)]
async fn rotation_updates_secret_and_instance() {
    let h = service_harness(SimulationSettings::default());
    h.service
        .provision(TenantConfig::new("acme-6", AccountTier::Trial))
        .await
        .unwrap();
    let before = h.cloud.instance_request("acme-6-db").unwrap().master_password;

    h.service.rotate_database_password("acme-6").await.unwrap();

    let after = h.cloud.instance_request("acme-6-db").unwrap().master_password;
    assert_ne!(before, after);
    let stored = h
        .service
        .orchestrator()
        .provisioners()
        .secrets
        .get_credentials("acme-6")
        .await
        .unwrap();
    assert_eq!(stored.password, after);
}
