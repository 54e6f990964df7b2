//! Command envelope for callers that talk to the engine through files or a transport

use crate::records::{ApprovalStep, NewRequest, RequestRecord};
use crate::Actor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single engine call. Kind, status and decision travel as plain codes so
/// that unknown values reach the engine and come back as `invalid_kind` /
/// `invalid_status` instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkflowCommand {
    Create {
        kind: String,
        actor: Actor,
        #[serde(default)]
        request: NewRequest,
    },
    Transition {
        request_id: String,
        actor: Actor,
        target: String,
        #[serde(default)]
        notes: Option<String>,
    },
    ActOnStep {
        request_id: String,
        step_order: u32,
        actor: Actor,
        decision: String,
        #[serde(default)]
        notes: Option<String>,
    },
    Cancel {
        request_id: String,
        actor: Actor,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl WorkflowCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Transition { .. } => "transition",
            Self::ActOnStep { .. } => "act_on_step",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Machine readable error for UI rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_status: Option<String>,
}

/// Result of executing a `WorkflowCommand`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<RequestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<ApprovalStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub completed_at: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn success(command: &WorkflowCommand, record: RequestRecord, step: Option<ApprovalStep>) -> Self {
        Self {
            command: command.name().to_string(),
            ok: true,
            record: Some(record),
            step,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(command: &WorkflowCommand, error: ErrorPayload) -> Self {
        Self {
            command: command.name().to_string(),
            ok: false,
            record: None,
            step: None,
            error: Some(error),
            completed_at: Utc::now(),
        }
    }
}
