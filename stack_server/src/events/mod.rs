//! Progress events for provisioning runs.
//!
//! Every transition is logged; subscribers may additionally receive the
//! events over an mpsc channel.

pub mod provisioning;

pub use provisioning::{DeploymentProgress, EventEnvelope, ProvisioningEvent};

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EventEnvelope>>,
}

impl EventSink {
    /// A sink that only logs.
    pub fn logging() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, tenant_id: &str, run_id: Uuid, event: ProvisioningEvent) {
        match &event {
            ProvisioningEvent::StageFailed { stage, error } => {
                tracing::warn!(tenant_id, %run_id, %stage, %error, "stage failed");
            }
            other => {
                tracing::info!(tenant_id, %run_id, event = ?other, "provisioning event");
            }
        }

        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(EventEnvelope {
                tenant_id: tenant_id.to_string(),
                run_id,
                at: Utc::now(),
                event,
            });
        }
    }
}
