//! Stage provisioners. Each owns one slice of the tenant stack and talks to
//! exactly the provider capabilities it needs.

pub mod cdn;
pub mod certificate;
pub mod containers;
pub mod database;
pub mod dns;
pub mod load_balancer;
pub mod secrets;

use std::future::Future;

use crate::config::ProvisionerConfig;
use crate::error::{ProviderError, StageError};
use crate::providers::CloudProvider;

pub use cdn::CdnProvisioner;
pub use certificate::{CertificateOutcome, CertificateProvisioner};
pub use containers::{catalog, CatalogEntry, ContainerDeployer};
pub use database::{
    DatabaseOutcome, DatabaseProvisioner, InstanceSizing, RemovedInstance, UpgradeSummary,
};
pub use dns::DnsRecordManager;
pub use load_balancer::LoadBalancerProvisioner;
pub use secrets::SecretStoreClient;

/// Outcome of a find-or-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured<T> {
    Found(T),
    Created(T),
}

impl<T> Ensured<T> {
    pub fn into_inner(self) -> T {
        match self {
            Ensured::Found(v) | Ensured::Created(v) => v,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}

/// Look the resource up by name and create it only when missing.
///
/// A create that reports `AlreadyExists` lost a race with another caller;
/// the resource is looked up again and returned as found.
pub async fn find_or_create<T, F, FFut, C, CFut>(
    op: &'static str,
    mut find: F,
    create: C,
) -> Result<Ensured<T>, StageError>
where
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<Option<T>, ProviderError>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<T, ProviderError>>,
{
    if let Some(found) = find().await.map_err(StageError::api(op))? {
        return Ok(Ensured::Found(found));
    }
    match create().await {
        Ok(created) => Ok(Ensured::Created(created)),
        Err(e) if e.is_already_exists() => {
            tracing::debug!(op, "concurrent create detected, looking up again");
            match find().await.map_err(StageError::api(op))? {
                Some(found) => Ok(Ensured::Found(found)),
                None => Err(StageError::ExternalApi { op, source: e }),
            }
        }
        Err(e) => Err(StageError::ExternalApi { op, source: e }),
    }
}

/// Treat `NotFound` as success; used by deletes.
pub(crate) fn ignore_missing<T>(result: Result<T, ProviderError>) -> Result<Option<T>, ProviderError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Every provisioner, built once per process and shared by `Arc`.
pub struct Provisioners {
    pub certificates: CertificateProvisioner,
    pub databases: DatabaseProvisioner,
    pub secrets: SecretStoreClient,
    pub load_balancers: LoadBalancerProvisioner,
    pub cdn: CdnProvisioner,
    pub dns: DnsRecordManager,
    pub containers: ContainerDeployer,
}

impl Provisioners {
    pub fn new(cloud: &CloudProvider, config: &ProvisionerConfig) -> Self {
        let dns = DnsRecordManager::new(cloud.dns.clone(), config.dns_ttl);
        Self {
            certificates: CertificateProvisioner::new(cloud.certificates.clone(), dns.clone(), config),
            databases: DatabaseProvisioner::new(cloud.databases.clone(), cloud.network.clone(), config),
            secrets: SecretStoreClient::new(cloud.secrets.clone(), config.secret_recovery_days),
            load_balancers: LoadBalancerProvisioner::new(cloud.load_balancers.clone(), cloud.network.clone()),
            cdn: CdnProvisioner::new(cloud.cdn.clone()),
            dns,
            containers: ContainerDeployer::new(cloud.containers.clone(), config),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn lost_create_race_resolves_to_found() {
        let finds = &AtomicU32::new(0);
        let ensured = find_or_create(
            "CreateThing",
            || async move {
                // Absent on the first lookup, present after the conflict.
                Ok(if finds.fetch_add(1, Ordering::SeqCst) == 0 {
                    None
                } else {
                    Some("thing-1")
                })
            },
            || async { Err(ProviderError::already_exists("thing", "thing-1")) },
        )
        .await
        .unwrap();
        assert_eq!(ensured, Ensured::Found("thing-1"));
    }

    #[tokio::test]
    async fn other_create_errors_propagate_with_op() {
        let err = find_or_create::<(), _, _, _, _>(
            "CreateThing",
            || async { Ok(None) },
            || async { Err(ProviderError::Api("denied".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::ExternalApi { op: "CreateThing", .. }));
    }

    #[test]
    fn missing_resources_are_ignored() {
        let gone: Result<(), _> = Err(ProviderError::not_found("stack", "tenant-acme-1"));
        assert_eq!(ignore_missing(gone).unwrap(), None);
        assert!(ignore_missing::<()>(Err(ProviderError::Api("boom".into()))).is_err());
    }
}
