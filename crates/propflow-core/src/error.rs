//! Error types for the workflow engine

use propflow_types::{ErrorPayload, ParseError, RequestKind, Status, StepStatus};
use thiserror::Error;

/// Main error type for all engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Unknown request kind: {0}")]
    InvalidKind(String),

    #[error("Status '{status}' is not valid for {kind}")]
    InvalidStatus { kind: String, status: String },

    #[error("Cannot move {kind} from {from} to {to}")]
    IllegalTransition { kind: RequestKind, from: Status, to: Status },

    #[error("Step {step_order} is already {status}")]
    StepNotPending { step_order: u32, status: StepStatus },

    #[error("Step {step_order} cannot be acted on while step {blocking_step} is pending")]
    OutOfOrder { step_order: u32, blocking_step: u32 },

    #[error("Actor {actor} is not authorized to {action}")]
    ActorNotAuthorized { actor: String, action: String },

    #[error("Request is already in terminal status {status}")]
    AlreadyTerminal { status: Status },

    #[error("Request {request_id} was modified concurrently")]
    ConcurrentModification { request_id: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// Stable code the UI keys its messages on
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKind(_) => "invalid_kind",
            Self::InvalidStatus { .. } => "invalid_status",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::StepNotPending { .. } => "step_not_pending",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::ActorNotAuthorized { .. } => "actor_not_authorized",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config",
        }
    }

    /// Only concurrent modification is worth retrying with fresh state
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Expected, caller-recoverable rule violations. Never logged as system errors.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::IllegalTransition { .. }
                | Self::StepNotPending { .. }
                | Self::OutOfOrder { .. }
                | Self::ActorNotAuthorized { .. }
                | Self::AlreadyTerminal { .. }
        )
    }

    /// Message safe to show end users
    pub fn public_message(&self) -> String {
        match self {
            Self::StorageUnavailable(_) => "The service is temporarily unavailable, try again later".to_string(),
            Self::Config(_) => "The service is misconfigured, try again later".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let (current_status, attempted_status) = match self {
            Self::IllegalTransition { from, to, .. } => {
                (Some(from.as_str().to_string()), Some(to.as_str().to_string()))
            }
            Self::AlreadyTerminal { status } => (Some(status.as_str().to_string()), None),
            Self::InvalidStatus { status, .. } => (None, Some(status.clone())),
            _ => (None, None),
        };

        ErrorPayload {
            code: self.code().to_string(),
            message: self.public_message(),
            current_status,
            attempted_status,
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<ParseError> for WorkflowError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::UnknownKind(kind) => Self::InvalidKind(kind),
            ParseError::UnknownStatus(status) => Self::InvalidStatus {
                kind: "unknown".to_string(),
                status,
            },
            ParseError::UnknownDecision(decision) => {
                Self::InvalidRequest(format!("step decision must be approved or rejected, got {}", decision))
            }
            ParseError::InvalidId(id) => Self::InvalidRequest(format!("invalid request id {}", id)),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
