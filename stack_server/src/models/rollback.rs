//! Rollback report: per-resource outcome of the compensating actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::deployment::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationOutcome {
    Succeeded,
    Failed,
    /// Deletion accepted but completes later (recovery window, final snapshot).
    Scheduled,
    /// Nothing to undo for this tenant (shared resource).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub stage: Stage,
    pub resource: String,
    pub action: String,
    pub outcome: CompensationOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entries: Vec<CompensationEntry>,
}

impl RollbackReport {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        stage: Stage,
        resource: impl Into<String>,
        action: &str,
        outcome: CompensationOutcome,
        detail: Option<String>,
    ) {
        self.entries.push(CompensationEntry {
            stage,
            resource: resource.into(),
            action: action.to_string(),
            outcome,
            detail,
        });
    }

    pub fn failures(&self) -> Vec<&CompensationEntry> {
        self.entries
            .iter()
            .filter(|e| e.outcome == CompensationOutcome::Failed)
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.outcome == CompensationOutcome::Failed)
    }

    /// Stages in the order their compensation ran (deduplicated).
    pub fn stage_order(&self) -> Vec<Stage> {
        let mut order: Vec<Stage> = Vec::new();
        for entry in &self.entries {
            if order.last() != Some(&entry.stage) {
                order.push(entry.stage);
            }
        }
        order
    }

    /// One line per failed compensation, for error aggregation.
    pub fn failure_messages(&self) -> Vec<String> {
        self.failures()
            .into_iter()
            .map(|e| {
                format!(
                    "{} {} ({}): {}",
                    e.action,
                    e.resource,
                    e.stage,
                    e.detail.as_deref().unwrap_or("unknown error")
                )
            })
            .collect()
    }
}
