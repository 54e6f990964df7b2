//! Request records, approval steps, audit entries and domain events

use crate::{ActorId, EventId, RequestId, RequestKind, Status, StepActor, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request subject to an approval workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub kind: RequestKind,
    pub status: Status,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every committed change
    pub version: u64,
    #[serde(default)]
    pub department_id: Option<String>,
    /// Kind specific payload (asset ids, destination office, ...). Opaque to the engine.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One named sign-off slot attached to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub step_order: u32,
    pub code: String,
    pub actor: StepActor,
    pub status: StepStatus,
    #[serde(default)]
    pub auto_approve_by_creator: bool,
    pub acted_at: Option<DateTime<Utc>>,
    /// Who actually recorded the decision; differs from `actor` on overrides
    pub acted_by: Option<ActorId>,
    pub notes: Option<String>,
}

/// Free-form metadata attached to audit entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditContext(serde_json::Map<String, serde_json::Value>);

impl AuditContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of `other` win on key collisions
    pub fn merged(&self, other: &AuditContext) -> AuditContext {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        AuditContext(merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    StatusChanged,
    StepApproved,
    StepRejected,
    StepSkipped,
    Cancelled,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StatusChanged => "status_changed",
            Self::StepApproved => "step_approved",
            Self::StepRejected => "step_rejected",
            Self::StepSkipped => "step_skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable history row. Ordered by `occurred_at`, ties broken by `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub request_id: RequestId,
    pub actor: ActorId,
    pub action: AuditAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub context: AuditContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    StatusChanged,
    StepActed,
    Cancelled,
}

/// One per successful engine operation; committed with the change and delivered at least once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub kind: RequestKind,
    pub action: EventAction,
    pub old_status: Option<Status>,
    pub new_status: Status,
    pub actor: ActorId,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Key consumers deduplicate on; delivery is at-least-once
    pub fn dedupe_key(&self) -> (RequestId, Status, DateTime<Utc>) {
        (self.request_id.clone(), self.new_status, self.timestamp)
    }

    pub fn changed_status(&self) -> bool {
        self.old_status != Some(self.new_status)
    }
}

/// Actor assignment for one template step, supplied at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAssignment {
    pub code: String,
    pub actor: StepActor,
}

impl StepAssignment {
    pub fn new(code: impl Into<String>, actor: StepActor) -> Self {
        Self { code: code.into(), actor }
    }
}

/// Initial data for a new request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<StepAssignment>,
}

impl NewRequest {
    pub fn with_department(mut self, department_id: impl Into<String>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_step(mut self, code: impl Into<String>, actor: StepActor) -> Self {
        self.steps.push(StepAssignment::new(code, actor));
        self
    }
}
