//! Provisioning run events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AccountTier, CompensationOutcome, DeploymentStatus, Stage};

/// Events emitted on every state transition of a provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProvisioningEvent {
    RunStarted {
        tier: AccountTier,
    },
    StageStarted {
        stage: Stage,
    },
    StageSucceeded {
        stage: Stage,
        duration_ms: u64,
    },
    StageFailed {
        stage: Stage,
        error: String,
    },
    /// Compensation is about to run over these stages, newest first.
    RollbackStarted {
        stages: Vec<Stage>,
    },
    StageCompensated {
        stage: Stage,
        outcome: CompensationOutcome,
    },
    RunFinished {
        status: DeploymentStatus,
        duration_ms: u64,
    },
}

/// An event plus the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub tenant_id: String,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProvisioningEvent,
}

/// Status view folded from a run's events.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentProgress {
    pub status: DeploymentStatus,
    pub current_stage: Option<Stage>,
    pub succeeded: Vec<Stage>,
    pub failed_stage: Option<Stage>,
    pub compensated: Vec<Stage>,
    pub finished: bool,
}

impl Default for DeploymentProgress {
    fn default() -> Self {
        Self {
            status: DeploymentStatus::Pending,
            current_stage: None,
            succeeded: Vec::new(),
            failed_stage: None,
            compensated: Vec::new(),
            finished: false,
        }
    }
}

impl DeploymentProgress {
    pub fn apply(&mut self, event: &ProvisioningEvent) {
        match event {
            ProvisioningEvent::RunStarted { .. } => {
                *self = Self {
                    status: DeploymentStatus::InProgress,
                    ..Self::default()
                };
            }
            ProvisioningEvent::StageStarted { stage } => {
                self.current_stage = Some(*stage);
            }
            ProvisioningEvent::StageSucceeded { stage, .. } => {
                self.current_stage = None;
                self.succeeded.push(*stage);
            }
            ProvisioningEvent::StageFailed { stage, .. } => {
                self.current_stage = None;
                self.failed_stage = Some(*stage);
                self.status = DeploymentStatus::Failed;
            }
            ProvisioningEvent::RollbackStarted { .. } => {}
            ProvisioningEvent::StageCompensated { stage, outcome } => {
                if *outcome != CompensationOutcome::Failed {
                    self.succeeded.retain(|s| s != stage);
                    self.compensated.push(*stage);
                }
            }
            ProvisioningEvent::RunFinished { status, .. } => {
                self.status = *status;
                self.current_stage = None;
                self.finished = true;
            }
        }
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a ProvisioningEvent>) -> Self {
        let mut progress = Self::default();
        for event in events {
            progress.apply(event);
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_run_folds_to_rolled_back() {
        let events = vec![
            ProvisioningEvent::RunStarted {
                tier: AccountTier::Trial,
            },
            ProvisioningEvent::StageStarted {
                stage: Stage::Certificate,
            },
            ProvisioningEvent::StageSucceeded {
                stage: Stage::Certificate,
                duration_ms: 10,
            },
            ProvisioningEvent::StageStarted {
                stage: Stage::Database,
            },
            ProvisioningEvent::StageSucceeded {
                stage: Stage::Database,
                duration_ms: 10,
            },
            ProvisioningEvent::StageStarted {
                stage: Stage::Secrets,
            },
            ProvisioningEvent::StageFailed {
                stage: Stage::Secrets,
                error: "denied".into(),
            },
            ProvisioningEvent::RollbackStarted {
                stages: vec![Stage::Database, Stage::Certificate],
            },
            ProvisioningEvent::StageCompensated {
                stage: Stage::Database,
                outcome: CompensationOutcome::Scheduled,
            },
            ProvisioningEvent::StageCompensated {
                stage: Stage::Certificate,
                outcome: CompensationOutcome::Skipped,
            },
            ProvisioningEvent::RunFinished {
                status: DeploymentStatus::RolledBack,
                duration_ms: 40,
            },
        ];
        let progress = DeploymentProgress::from_events(&events);
        assert_eq!(progress.status, DeploymentStatus::RolledBack);
        assert_eq!(progress.failed_stage, Some(Stage::Secrets));
        assert!(progress.succeeded.is_empty());
        assert_eq!(progress.compensated, vec![Stage::Database, Stage::Certificate]);
        assert!(progress.finished);
    }

    #[test]
    fn envelope_serializes_flat_with_type_tag() {
        let envelope = EventEnvelope {
            tenant_id: "acme-1".into(),
            run_id: Uuid::nil(),
            at: Utc::now(),
            event: ProvisioningEvent::StageStarted { stage: Stage::Cdn },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "StageStarted");
        assert_eq!(json["stage"], "cdn");
        assert_eq!(json["tenant_id"], "acme-1");
    }
}
