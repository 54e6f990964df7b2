//! Shared types for the property workflow engine
//!
//! Identifiers, request kinds, status vocabulary and actor identity. Everything
//! here is plain data that the UI bridge, the engine and the server agree on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod commands;
pub mod records;

pub use commands::{CommandOutcome, ErrorPayload, WorkflowCommand};
pub use records::{
    ApprovalStep, AuditAction, AuditContext, AuditEntry, DomainEvent, EventAction, NewRequest,
    RequestRecord, StepAssignment,
};

/// Capability that lets an actor sign any approval step on behalf of its designated actor
pub const CAN_APPROVE_STEP: &str = "can_approve_step";

/// Capability that lets an actor move or cancel records it did not create
pub const CAN_MANAGE_STATUS: &str = "can_manage_status";

/// Errors raised when parsing kind or status codes coming from the outside
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown request kind: {0}")]
    UnknownKind(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Unknown step decision: {0}")]
    UnknownDecision(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Strongly typed RequestId
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Result<Self, ParseError> {
        uuid::Uuid::parse_str(s)
            .map(|_| Self(s.to_string()))
            .map_err(|e| ParseError::InvalidId(format!("{}: {}", s, e)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed EventId
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque actor identifier handed over by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The concrete kind of a request record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TurnoverDisposal,
    Transfer,
    OffCampusLoan,
    VerificationForm,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::TurnoverDisposal,
        RequestKind::Transfer,
        RequestKind::OffCampusLoan,
        RequestKind::VerificationForm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnoverDisposal => "turnover_disposal",
            Self::Transfer => "transfer",
            Self::OffCampusLoan => "off_campus_loan",
            Self::VerificationForm => "verification_form",
        }
    }

    /// Directory name used by file-backed storage
    pub fn directory_name(&self) -> &'static str {
        match self {
            Self::TurnoverDisposal => "turnover_disposals",
            Self::Transfer => "transfers",
            Self::OffCampusLoan => "off_campus_loans",
            Self::VerificationForm => "verification_forms",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseError::UnknownKind(s.to_string()))
    }
}

/// Every status any request kind can hold. Which ones are valid for a given
/// kind is decided by the status register, not by this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    PendingReview,
    Approved,
    Rejected,
    Cancelled,
    Completed,
    Upcoming,
    InProgress,
    Overdue,
    PendingReturn,
    Returned,
    ReturnedLate,
    StillOut,
    Transferred,
    Lost,
    Replaced,
}

impl Status {
    pub const ALL: [Status; 15] = [
        Status::PendingReview,
        Status::Approved,
        Status::Rejected,
        Status::Cancelled,
        Status::Completed,
        Status::Upcoming,
        Status::InProgress,
        Status::Overdue,
        Status::PendingReturn,
        Status::Returned,
        Status::ReturnedLate,
        Status::StillOut,
        Status::Transferred,
        Status::Lost,
        Status::Replaced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Upcoming => "upcoming",
            Self::InProgress => "in_progress",
            Self::Overdue => "overdue",
            Self::PendingReturn => "pending_return",
            Self::Returned => "returned",
            Self::ReturnedLate => "returned_late",
            Self::StillOut => "still_out",
            Self::Transferred => "transferred",
            Self::Lost => "lost",
            Self::Replaced => "replaced",
        }
    }

    /// Human readable label for tables and exported reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::PendingReview => "Pending Review",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
            Self::Completed => "Completed",
            Self::Upcoming => "Upcoming",
            Self::InProgress => "In Progress",
            Self::Overdue => "Overdue",
            Self::PendingReturn => "Pending Return",
            Self::Returned => "Returned",
            Self::ReturnedLate => "Returned (Late)",
            Self::StillOut => "Still Out",
            Self::Transferred => "Transferred",
            Self::Lost => "Lost",
            Self::Replaced => "Replaced",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError::UnknownStatus(s.to_string()))
    }
}

/// Status of a single approval step. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision an actor can record on a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDecision {
    Approved,
    Rejected,
}

impl StepDecision {
    pub fn resulting_status(&self) -> StepStatus {
        match self {
            Self::Approved => StepStatus::Approved,
            Self::Rejected => StepStatus::Rejected,
        }
    }
}

impl FromStr for StepDecision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" | "approve" => Ok(Self::Approved),
            "rejected" | "reject" => Ok(Self::Rejected),
            other => Err(ParseError::UnknownDecision(other.to_string())),
        }
    }
}

/// Who signs a step: a user of the system, or an outside signatory recorded by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepActor {
    Internal { actor_id: ActorId },
    External { name: String, title: String },
}

impl StepActor {
    pub fn internal(actor_id: impl Into<String>) -> Self {
        Self::Internal { actor_id: ActorId::new(actor_id) }
    }

    pub fn external(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self::External { name: name.into(), title: title.into() }
    }

    pub fn internal_id(&self) -> Option<&ActorId> {
        match self {
            Self::Internal { actor_id } => Some(actor_id),
            Self::External { .. } => None,
        }
    }
}

/// Capability flags granted to an actor by the identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from the `{"can_approve_step": true}` shape the identity provider hands over
    pub fn from_flags<I, K>(flags: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        Self(
            flags
                .into_iter()
                .filter(|(_, granted)| *granted)
                .map(|(name, _)| name.into())
                .collect(),
        )
    }

    pub fn with(mut self, capability: impl Into<String>) -> Self {
        self.0.insert(capability.into());
        self
    }

    pub fn has(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// An already authenticated identity plus its capabilities and request metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Request metadata (IP, route, ...) copied into audit entries verbatim
    #[serde(default)]
    pub context: AuditContext,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            capabilities: Capabilities::none(),
            context: AuditContext::default(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities = self.capabilities.with(capability);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn can(&self, capability: &str) -> bool {
        self.capabilities.has(capability)
    }
}
