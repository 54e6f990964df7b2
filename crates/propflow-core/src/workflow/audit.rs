//! Append-only audit trail
//!
//! Entries are only ever created through `AuditLog::append`, which writes into
//! the aggregate that is about to be committed. No update or delete path exists.

use super::aggregate::RequestAggregate;
use chrono::{DateTime, Utc};
use propflow_types::{ActorId, AuditAction, AuditContext, AuditEntry};

pub struct AuditLog;

impl AuditLog {
    /// Append one entry to the aggregate's trail. Persisted together with the
    /// aggregate; a failed commit drops the entry along with the change it describes.
    pub(crate) fn append(
        aggregate: &mut RequestAggregate,
        actor: &ActorId,
        action: AuditAction,
        old_value: Option<String>,
        new_value: Option<String>,
        context: AuditContext,
        occurred_at: DateTime<Utc>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            sequence: aggregate.next_sequence(),
            request_id: aggregate.record.id.clone(),
            actor: actor.clone(),
            action,
            old_value,
            new_value,
            occurred_at,
            context,
        };

        log::debug!(
            "Audit {} #{}: {} {:?} -> {:?}",
            entry.request_id,
            entry.sequence,
            action.as_str(),
            entry.old_value,
            entry.new_value
        );

        aggregate.audit.push(entry.clone());
        entry
    }

    /// Snapshot of the trail, oldest first
    pub fn history(aggregate: &RequestAggregate) -> AuditHistory {
        AuditHistory::new(aggregate.audit_entries().to_vec())
    }
}

/// Ordered, read-only view of a request's history. Re-querying yields the same
/// prefix plus whatever was appended since.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditHistory {
    entries: Vec<AuditEntry>,
}

impl AuditHistory {
    fn new(mut entries: Vec<AuditEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&AuditEntry> {
        self.entries.last()
    }

    /// Entries appended after `sequence`, for consumers that resume where they stopped
    pub fn since(&self, sequence: u64) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(move |entry| entry.sequence > sequence)
    }

    pub fn count_action(&self, action: AuditAction) -> usize {
        self.entries.iter().filter(|entry| entry.action == action).count()
    }

    pub fn into_vec(self) -> Vec<AuditEntry> {
        self.entries
    }
}

impl IntoIterator for AuditHistory {
    type Item = AuditEntry;
    type IntoIter = std::vec::IntoIter<AuditEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a AuditHistory {
    type Item = &'a AuditEntry;
    type IntoIter = std::slice::Iter<'a, AuditEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propflow_types::{RequestId, RequestKind, RequestRecord, Status};

    fn aggregate() -> RequestAggregate {
        let now = Utc::now();
        RequestAggregate::new(
            RequestRecord {
                id: RequestId::new(),
                kind: RequestKind::Transfer,
                status: Status::Upcoming,
                created_by: ActorId::new("u-1"),
                created_at: now,
                updated_at: now,
                version: 1,
                department_id: None,
                data: serde_json::Value::Null,
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_sequences_are_dense_and_ordered() {
        let mut agg = aggregate();
        let actor = ActorId::new("u-1");
        let now = Utc::now();

        let first = AuditLog::append(&mut agg, &actor, AuditAction::Created, None, Some("upcoming".into()), AuditContext::new(), now);
        let second = AuditLog::append(
            &mut agg,
            &actor,
            AuditAction::StatusChanged,
            Some("upcoming".into()),
            Some("in_progress".into()),
            AuditContext::new(),
            now,
        );

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let history = AuditLog::history(&agg);
        let actions: Vec<AuditAction> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::StatusChanged]);
        assert_eq!(history.since(1).count(), 1);
    }

    #[test]
    fn test_history_orders_by_time_then_sequence() {
        let mut agg = aggregate();
        let actor = ActorId::new("u-1");
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);

        AuditLog::append(&mut agg, &actor, AuditAction::StatusChanged, None, None, AuditContext::new(), later);
        AuditLog::append(&mut agg, &actor, AuditAction::Created, None, None, AuditContext::new(), earlier);

        let history = AuditLog::history(&agg);
        assert_eq!(history.iter().next().unwrap().action, AuditAction::Created);
        assert_eq!(history.count_action(AuditAction::StatusChanged), 1);
    }

    #[test]
    fn test_history_is_a_snapshot() {
        let mut agg = aggregate();
        let actor = ActorId::new("u-1");
        AuditLog::append(&mut agg, &actor, AuditAction::Created, None, None, AuditContext::new(), Utc::now());

        let before = AuditLog::history(&agg);
        AuditLog::append(&mut agg, &actor, AuditAction::Cancelled, None, None, AuditContext::new(), Utc::now());
        let after = AuditLog::history(&agg);

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert_eq!(after.iter().next(), before.iter().next());
    }
}
