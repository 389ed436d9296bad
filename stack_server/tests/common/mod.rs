#![allow(dead_code)]

use std::sync::Arc;

use tenantstack::config::ProvisionerConfig;
use tenantstack::events::{EventEnvelope, EventSink};
use tenantstack::orchestrator::Orchestrator;
use tenantstack::providers::simulated::{SimulatedCloud, SimulationSettings};
use tenantstack::providers::CloudProvider;
use tenantstack::provisioners::Provisioners;
use tenantstack::service::ProvisioningService;
use tenantstack::store::{DeploymentStore, MemoryStore};
use tokio::sync::mpsc;

pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: mpsc::UnboundedReceiver<EventEnvelope>,
}

pub fn harness(settings: SimulationSettings, config: ProvisionerConfig) -> Harness {
    let (orchestrator, cloud, store, events) = build(settings, config);
    Harness {
        cloud,
        store,
        orchestrator: Arc::new(orchestrator),
        events,
    }
}

pub fn default_harness() -> Harness {
    harness(SimulationSettings::default(), ProvisionerConfig::default())
}

pub struct ServiceHarness {
    pub cloud: Arc<SimulatedCloud>,
    pub store: Arc<MemoryStore>,
    pub service: ProvisioningService,
}

pub fn service_harness(settings: SimulationSettings) -> ServiceHarness {
    let (orchestrator, cloud, store, _events) = build(settings, ProvisionerConfig::default());
    ServiceHarness {
        cloud,
        store,
        service: ProvisioningService::new(orchestrator),
    }
}

fn build(
    settings: SimulationSettings,
    config: ProvisionerConfig,
) -> (
    Orchestrator,
    Arc<SimulatedCloud>,
    Arc<MemoryStore>,
    mpsc::UnboundedReceiver<EventEnvelope>,
) {
    let cloud = Arc::new(SimulatedCloud::new(settings));
    let provider = CloudProvider::from_backend(cloud.clone());
    let store = Arc::new(MemoryStore::new());
    let (events, rx) = EventSink::channel();
    let provisioners = Arc::new(Provisioners::new(&provider, &config));
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        provisioners,
        store.clone() as Arc<dyn DeploymentStore>,
        events,
    );
    (orchestrator, cloud, store, rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}
