//! The persisted unit of a request: record, steps and audit trail
//!
//! A store writes the whole aggregate at once, so a status change and the
//! audit entry describing it can never be committed separately. Events for a
//! change ride along in the same write and stay there until every sink has
//! taken them.

use chrono::{DateTime, Utc};
use propflow_types::{
    ActorId, ApprovalStep, AuditEntry, DomainEvent, EventId, RequestId, RequestKind, RequestRecord, Status,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAggregate {
    pub(crate) record: RequestRecord,
    pub(crate) steps: Vec<ApprovalStep>,
    pub(crate) audit: Vec<AuditEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) pending_events: Vec<DomainEvent>,
}

impl RequestAggregate {
    pub(crate) fn new(record: RequestRecord, steps: Vec<ApprovalStep>) -> Self {
        Self {
            record,
            steps,
            audit: Vec::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.record.id
    }

    pub fn kind(&self) -> RequestKind {
        self.record.kind
    }

    pub fn status(&self) -> Status {
        self.record.status
    }

    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn record(&self) -> &RequestRecord {
        &self.record
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    pub fn step(&self, step_order: u32) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.step_order == step_order)
    }

    pub fn audit_entries(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Events committed with this aggregate that no sink run has confirmed yet
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending_events
    }

    /// Queue an event to be written with the next commit
    pub(crate) fn enqueue_event(&mut self, event: DomainEvent) {
        self.pending_events.push(event);
    }

    /// Drop delivered events; returns whether anything was removed
    pub(crate) fn acknowledge(&mut self, delivered: &[EventId]) -> bool {
        let before = self.pending_events.len();
        self.pending_events.retain(|event| !delivered.contains(&event.event_id));
        self.pending_events.len() != before
    }

    pub fn into_record(self) -> RequestRecord {
        self.record
    }

    /// Next audit sequence number; sequences are dense per request
    pub(crate) fn next_sequence(&self) -> u64 {
        self.audit.last().map(|entry| entry.sequence + 1).unwrap_or(1)
    }

    /// Stamp the record as changed and advance its concurrency token
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.record.updated_at = now;
        self.record.version += 1;
    }
}

/// Read-side filter used by report and export queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub kind: Option<RequestKind>,
    #[serde(default)]
    pub status: Option<Status>,
    /// Inclusive lower bound on `created_at`
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<ActorId>,
}

impl RequestFilter {
    pub fn for_kind(kind: RequestKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &RequestRecord) -> bool {
        self.kind.map_or(true, |kind| record.kind == kind)
            && self.status.map_or(true, |status| record.status == status)
            && self.from.map_or(true, |from| record.created_at >= from)
            && self.to.map_or(true, |to| record.created_at <= to)
            && self
                .department_id
                .as_ref()
                .map_or(true, |dept| record.department_id.as_ref() == Some(dept))
            && self
                .created_by
                .as_ref()
                .map_or(true, |actor| &record.created_by == actor)
    }
}

/// Status count map for report summaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCountMap {
    counts: BTreeMap<Status, usize>,
}

impl StatusCountMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, status: Status) {
        *self.counts.entry(status).or_insert(0) += 1;
    }

    pub fn get(&self, status: Status) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Status, usize)> + '_ {
        self.counts.iter().map(|(status, count)| (*status, *count))
    }
}

impl<'a> FromIterator<&'a RequestRecord> for StatusCountMap {
    fn from_iter<I: IntoIterator<Item = &'a RequestRecord>>(records: I) -> Self {
        let mut counts = Self::new();
        for record in records {
            counts.increment(record.status);
        }
        counts
    }
}
