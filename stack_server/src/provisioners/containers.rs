//! Tenant application containers: catalog, stack deployment and readiness.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::ignore_missing;
use crate::config::ProvisionerConfig;
use crate::error::StageError;
use crate::models::{ContainersHandle, CredentialBundle, ServiceEndpoint, TenantConfig};
use crate::naming::ResourceNames;
use crate::poll::{poll_until, Poll, PollSettings};
use crate::providers::{ContainerRuntimeService, ServiceSpec, ServiceState, StackSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub port: u16,
}

/// Services a tenant gets, gated by plan and feature flags.
pub fn catalog(config: &TenantConfig) -> Vec<CatalogEntry> {
    let mut services = vec![CatalogEntry {
        name: "crm",
        port: 3000,
    }];
    if config.features.file_portal {
        services.push(CatalogEntry {
            name: "portal",
            port: 3100,
        });
    }
    if config.features.booking && !config.tier.is_trial() {
        services.push(CatalogEntry {
            name: "booking",
            port: 3200,
        });
    }
    if config.features.analytics && config.tier.is_professional() {
        services.push(CatalogEntry {
            name: "analytics",
            port: 3300,
        });
    }
    services
}

pub struct ContainerDeployer {
    containers: Arc<dyn ContainerRuntimeService>,
    registry: String,
    tag: String,
    poll: PollSettings,
}

impl ContainerDeployer {
    pub fn new(containers: Arc<dyn ContainerRuntimeService>, config: &ProvisionerConfig) -> Self {
        Self {
            containers,
            registry: config.image_registry.trim_end_matches('/').to_string(),
            tag: config.image_tag.clone(),
            poll: config.services_poll,
        }
    }

    /// Deploy the tenant stack and wait until every service is running.
    pub async fn deploy_services(
        &self,
        config: &TenantConfig,
        credentials: &CredentialBundle,
        integrations_secret: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ContainersHandle, StageError> {
        let names = ResourceNames::new(&config.tenant_id);
        let spec = self.stack_spec(config, &names, credentials, integrations_secret);
        let deployment = self
            .containers
            .deploy_stack(&spec)
            .await
            .map_err(StageError::api("DeployStack"))?;
        tracing::info!(
            tenant_id = %config.tenant_id,
            stack = %spec.stack_name,
            %deployment,
            services = spec.services.len(),
            "container stack deployed"
        );

        let containers = &self.containers;
        let stack = spec.stack_name.as_str();
        let endpoints = poll_until(
            &format!("services of stack {stack}"),
            &self.poll,
            cancel,
            || async move {
                let statuses = containers
                    .describe_services(stack)
                    .await
                    .map_err(StageError::api("DescribeServices"))?;
                if let Some(failed) = statuses.iter().find(|s| s.state == ServiceState::Failed) {
                    return Err(StageError::ServiceFailed {
                        service: failed.name.clone(),
                        detail: failed.message.clone().unwrap_or_else(|| "failed".to_string()),
                    });
                }
                let mut endpoints = Vec::with_capacity(statuses.len());
                for status in &statuses {
                    match (status.state, &status.target_id, &status.host) {
                        (ServiceState::Running, Some(target_id), Some(host)) => {
                            endpoints.push(ServiceEndpoint {
                                service: status.name.clone(),
                                target_id: target_id.clone(),
                                host: host.clone(),
                                port: status.port,
                            })
                        }
                        _ => {
                            let waiting = statuses
                                .iter()
                                .filter(|s| s.state != ServiceState::Running)
                                .count();
                            return Ok(Poll::Pending(format!("{waiting} service(s) starting")));
                        }
                    }
                }
                Ok(Poll::Ready(endpoints))
            },
        )
        .await?;

        Ok(ContainersHandle {
            stack_name: spec.stack_name,
            endpoints,
        })
    }

    /// `false` when the stack was already gone.
    pub async fn remove_stack(&self, stack_name: &str) -> Result<bool, StageError> {
        let removed = ignore_missing(self.containers.remove_stack(stack_name).await)
            .map_err(StageError::api("RemoveStack"))?;
        Ok(removed.is_some())
    }

    fn stack_spec(
        &self,
        config: &TenantConfig,
        names: &ResourceNames,
        credentials: &CredentialBundle,
        integrations_secret: Option<&str>,
    ) -> StackSpec {
        let services = catalog(config)
            .into_iter()
            .map(|entry| {
                let env = BTreeMap::from([
                    ("DATABASE_URL".to_string(), credentials.connection_url(entry.name)),
                    ("TENANT_ID".to_string(), config.tenant_id.clone()),
                    ("PORT".to_string(), entry.port.to_string()),
                ]);
                let secret_refs = integrations_secret
                    .map(|path| BTreeMap::from([("INTEGRATIONS_SECRET".to_string(), path.to_string())]))
                    .unwrap_or_default();
                ServiceSpec {
                    name: entry.name.to_string(),
                    image: format!("{}/{}:{}", self.registry, entry.name, self.tag),
                    port: entry.port,
                    env,
                    secret_refs,
                }
            })
            .collect();

        StackSpec {
            stack_name: names.stack(),
            services,
            labels: names.tags(),
        }
    }
}
