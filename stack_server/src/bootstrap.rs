//! Process wiring shared by the server and the CLI.

use std::sync::Arc;

use crate::config::{BackendConfig, ProvisionerConfig};
use crate::events::EventSink;
use crate::orchestrator::Orchestrator;
use crate::providers::gateway::GatewayCloud;
use crate::providers::simulated::SimulatedCloud;
use crate::providers::CloudProvider;
use crate::provisioners::Provisioners;
use crate::service::ProvisioningService;
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// The CLI keeps stdout for the JSON result.
    Stderr,
}

/// Initialise tracing. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing(target: LogTarget) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    let json = std::env::var("LOG_FORMAT").unwrap_or_default() == "json";

    match (json, target) {
        (true, LogTarget::Stdout) => tracing_subscriber::fmt().json().with_env_filter(filter()).init(),
        (true, LogTarget::Stderr) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init(),
        (false, LogTarget::Stdout) => tracing_subscriber::fmt().with_env_filter(filter()).init(),
        (false, LogTarget::Stderr) => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// The gateway when one is configured, otherwise the in-memory simulation.
pub fn cloud_provider(
    backend: &BackendConfig,
    config: &ProvisionerConfig,
    force_simulated: bool,
) -> anyhow::Result<CloudProvider> {
    match (&backend.gateway_url, force_simulated) {
        (Some(url), false) => {
            tracing::info!(gateway = %url, region = %config.region, "using provider gateway");
            let gateway = GatewayCloud::new(url, &backend.gateway_token, backend.gateway_timeout)?;
            Ok(CloudProvider::from_backend(Arc::new(gateway)))
        }
        _ => {
            tracing::warn!("no provider gateway configured -- using the simulated cloud");
            Ok(simulated_provider(config))
        }
    }
}

pub fn simulated_provider(config: &ProvisionerConfig) -> CloudProvider {
    let settings = crate::providers::simulated::SimulationSettings {
        base_domain: config.base_domain.clone(),
        ..Default::default()
    };
    CloudProvider::from_backend(Arc::new(SimulatedCloud::new(settings)))
}

/// PostgreSQL when `DATABASE_URL` is set (migration included), else in-memory.
pub async fn deployment_store(backend: &BackendConfig) -> anyhow::Result<Arc<dyn DeploymentStore>> {
    match &backend.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url)?;
            tracing::info!("Running tenant_deployments migration...");
            store.run_migration().await?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set -- deployment records are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn provisioning_service(
    config: ProvisionerConfig,
    cloud: &CloudProvider,
    store: Arc<dyn DeploymentStore>,
    events: EventSink,
) -> ProvisioningService {
    let provisioners = Arc::new(Provisioners::new(cloud, &config));
    let orchestrator = Orchestrator::new(Arc::new(config), provisioners, store, events);
    ProvisioningService::new(orchestrator)
}
