//! Tenant stack provisioning: certificate, database, secrets, load balancer,
//! CDN, DNS, containers and target registration for every new tenant, with
//! reverse-order rollback when a stage fails.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod poll;
pub mod providers;
pub mod provisioners;
pub mod rollback;
pub mod routes;
pub mod schema;
pub mod service;
pub mod store;

pub use error::{ProviderError, ProvisionError, StageError};
pub use orchestrator::{Orchestrator, ProvisionOutcome};
pub use service::ProvisioningService;
