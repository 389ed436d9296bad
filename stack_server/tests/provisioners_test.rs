use std::collections::BTreeMap;
use std::sync::Arc;

use tenantstack::config::ProvisionerConfig;
use tenantstack::models::{CredentialBundle, IntegrationKeys};
use tenantstack::poll::PollSettings;
use tenantstack::providers::simulated::{Outcome, SimulatedCloud, SimulationSettings};
use tenantstack::providers::CloudProvider;
use tenantstack::provisioners::Provisioners;
use tenantstack::StageError;
use tokio_util::sync::CancellationToken;

const DOMAIN: &str = "tenantstack.test";

fn provisioners(settings: SimulationSettings, config: &ProvisionerConfig) -> (Arc<SimulatedCloud>, Provisioners) {
    let cloud = Arc::new(SimulatedCloud::new(settings));
    let provider = CloudProvider::from_backend(cloud.clone());
    (cloud, Provisioners::new(&provider, config))
}

fn bundle(password: &str) -> CredentialBundle {
    CredentialBundle {
        engine: "postgres".to_string(),
        host: String::new(),
        port: 5432,
        username: "acme_admin".to_string(),
        password: password.to_string(),
        database: "main".to_string(),
        service_databases: BTreeMap::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn certificate_is_requested_once_and_then_reused() {
    let (cloud, p) = provisioners(SimulationSettings::default(), &ProvisionerConfig::default());
    let cancel = CancellationToken::new();

    let first = p.certificates.ensure_certificate(DOMAIN, &cancel).await.unwrap();
    let second = p.certificates.ensure_certificate(DOMAIN, &cancel).await.unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.certificate_ref, second.certificate_ref);
    assert_eq!(cloud.calls_to("RequestCertificate").len(), 1);
    assert_eq!(cloud.certificate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn pending_certificate_is_resumed_instead_of_requested_again() {
    let settings = SimulationSettings {
        certificate: Outcome::ReadyAfter(6),
        ..SimulationSettings::default()
    };
    let config = ProvisionerConfig {
        certificate_poll: PollSettings::new(30, 60, 120),
        ..ProvisionerConfig::default()
    };
    let (cloud, p) = provisioners(settings, &config);
    let cancel = CancellationToken::new();

    let err = p.certificates.ensure_certificate(DOMAIN, &cancel).await.unwrap_err();
    assert!(matches!(err, StageError::ValidationTimeout { .. }));
    assert_eq!(cloud.certificate_count(), 1);

    let resumed = p.certificates.ensure_certificate(DOMAIN, &cancel).await.unwrap();
    assert!(resumed.reused);
    assert_eq!(cloud.calls_to("RequestCertificate").len(), 1);
    assert_eq!(cloud.certificate_count(), 1);
}

#[tokio::test]
async fn storing_credentials_twice_updates_the_same_secret() {
    let (cloud, p) = provisioners(SimulationSettings::default(), &ProvisionerConfig::default());

    let first = p.secrets.store_credentials("acme", &bundle("first")).await.unwrap();
    let second = p.secrets.store_credentials("acme", &bundle("second")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(cloud.calls_to("CreateSecret").len(), 2);
    assert_eq!(cloud.calls_to("UpdateSecret").len(), 1);
    assert_eq!(p.secrets.get_credentials("acme").await.unwrap().password, "second");
}

#[tokio::test]
async fn storing_over_a_deleted_secret_restores_it() {
    let (cloud, p) = provisioners(SimulationSettings::default(), &ProvisionerConfig::default());
    p.secrets.store_credentials("acme", &bundle("first")).await.unwrap();
    let scheduled = p.secrets.delete_secret("tenants/acme/database").await.unwrap();
    assert!(scheduled.is_some());
    assert!(p.secrets.get_credentials("acme").await.is_err());

    p.secrets.store_credentials("acme", &bundle("again")).await.unwrap();
    assert_eq!(p.secrets.get_credentials("acme").await.unwrap().password, "again");
    assert_eq!(cloud.live_secret_names(), vec!["tenants/acme/database".to_string()]);
}

#[tokio::test]
async fn tenant_sweep_only_touches_that_tenant() {
    let (cloud, p) = provisioners(SimulationSettings::default(), &ProvisionerConfig::default());
    let keys = IntegrationKeys(BTreeMap::from([("mailer".to_string(), "k-1".to_string())]));
    p.secrets.store_credentials("acme", &bundle("a")).await.unwrap();
    p.secrets.store_integration_keys("acme", &keys).await.unwrap();
    p.secrets.store_credentials("acme-2", &bundle("b")).await.unwrap();

    let mut listed = p.secrets.list_tenant_secrets("acme").await.unwrap();
    listed.sort();
    assert_eq!(listed, vec!["tenants/acme/database", "tenants/acme/integrations"]);

    let scheduled = p.secrets.delete_tenant_secrets("acme").await.unwrap();
    assert_eq!(scheduled.len(), 2);
    assert!(p.secrets.list_tenant_secrets("acme").await.unwrap().is_empty());
    assert_eq!(cloud.live_secret_names(), vec!["tenants/acme-2/database".to_string()]);
}
