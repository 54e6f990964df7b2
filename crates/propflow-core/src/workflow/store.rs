//! Persistence seam for request aggregates

use super::aggregate::{RequestAggregate, RequestFilter};
use crate::error::{Result, WorkflowError};
use async_trait::async_trait;
use propflow_types::{DomainEvent, EventId, RequestId, RequestRecord};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable storage for request aggregates with optimistic concurrency.
///
/// `commit` must replace record, steps and audit trail as one unit, and only
/// when the stored version still equals `expected_version`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, aggregate: &RequestAggregate) -> Result<()>;

    async fn load(&self, id: &RequestId) -> Result<Option<RequestAggregate>>;

    async fn commit(&self, aggregate: &RequestAggregate, expected_version: u64) -> Result<()>;

    /// Records matching `filter`, oldest first
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>>;

    /// Every committed event not yet acknowledged, oldest first
    async fn undelivered_events(&self) -> Result<Vec<DomainEvent>>;

    /// Remove delivered events from a stored aggregate. Leaves the version
    /// alone, so it never conflicts with a status change in flight; a writer
    /// holding an older copy may put the events back, which only means they
    /// are delivered again.
    async fn acknowledge_events(&self, id: &RequestId, delivered: &[EventId]) -> Result<()>;
}

/// Process-local store, used in tests and for the `memory` backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    aggregates: RwLock<HashMap<RequestId, RequestAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.aggregates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.aggregates.read().await.is_empty()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert(&self, aggregate: &RequestAggregate) -> Result<()> {
        let mut aggregates = self.aggregates.write().await;
        if aggregates.contains_key(aggregate.id()) {
            return Err(WorkflowError::InvalidRequest(format!(
                "request {} already exists",
                aggregate.id()
            )));
        }
        aggregates.insert(aggregate.id().clone(), aggregate.clone());
        Ok(())
    }

    async fn load(&self, id: &RequestId) -> Result<Option<RequestAggregate>> {
        Ok(self.aggregates.read().await.get(id).cloned())
    }

    async fn commit(&self, aggregate: &RequestAggregate, expected_version: u64) -> Result<()> {
        let mut aggregates = self.aggregates.write().await;
        let current = aggregates
            .get_mut(aggregate.id())
            .ok_or_else(|| WorkflowError::NotFound(format!("request {}", aggregate.id())))?;

        if current.version() != expected_version {
            return Err(WorkflowError::ConcurrentModification {
                request_id: aggregate.id().to_string(),
            });
        }

        *current = aggregate.clone();
        Ok(())
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>> {
        let aggregates = self.aggregates.read().await;
        let mut records: Vec<RequestRecord> = aggregates
            .values()
            .map(RequestAggregate::record)
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn undelivered_events(&self) -> Result<Vec<DomainEvent>> {
        let aggregates = self.aggregates.read().await;
        let mut events: Vec<DomainEvent> = aggregates
            .values()
            .flat_map(|aggregate| aggregate.pending_events().iter().cloned())
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    async fn acknowledge_events(&self, id: &RequestId, delivered: &[EventId]) -> Result<()> {
        let mut aggregates = self.aggregates.write().await;
        let aggregate = aggregates
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("request {}", id)))?;
        aggregate.acknowledge(delivered);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use crate::workflow::events::tests::sample_event;
    use propflow_types::{ActorId, RequestKind, Status};

    pub(crate) fn sample_aggregate(kind: RequestKind, status: Status) -> RequestAggregate {
        let now = Utc::now();
        RequestAggregate::new(
            RequestRecord {
                id: RequestId::new(),
                kind,
                status,
                created_by: ActorId::new("u-1"),
                created_at: now,
                updated_at: now,
                version: 1,
                department_id: Some("physics".to_string()),
                data: serde_json::json!({"asset_count": 2}),
            },
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_commit_requires_matching_version() {
        let store = MemoryStore::new();
        let agg = sample_aggregate(RequestKind::Transfer, Status::Upcoming);
        store.insert(&agg).await.unwrap();

        let mut first = agg.clone();
        first.record.status = Status::InProgress;
        first.touch(Utc::now());
        store.commit(&first, 1).await.unwrap();

        let mut second = agg.clone();
        second.record.status = Status::Overdue;
        second.touch(Utc::now());
        let error = store.commit(&second, 1).await.unwrap_err();
        assert!(error.is_retriable());

        let stored = store.load(agg.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), Status::InProgress);
        assert_eq!(stored.version(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = MemoryStore::new();
        let agg = sample_aggregate(RequestKind::Transfer, Status::Upcoming);
        store.insert(&agg).await.unwrap();
        assert_eq!(store.insert(&agg).await.unwrap_err().code(), "invalid_request");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_applies_filter() {
        let store = MemoryStore::new();
        store.insert(&sample_aggregate(RequestKind::Transfer, Status::Upcoming)).await.unwrap();
        store.insert(&sample_aggregate(RequestKind::Transfer, Status::Completed)).await.unwrap();
        store.insert(&sample_aggregate(RequestKind::OffCampusLoan, Status::PendingReview)).await.unwrap();

        let transfers = store.list(&RequestFilter::for_kind(RequestKind::Transfer)).await.unwrap();
        assert_eq!(transfers.len(), 2);

        let completed = store
            .list(&RequestFilter {
                status: Some(Status::Completed),
                ..RequestFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_events_leave_version_untouched() {
        let store = MemoryStore::new();
        let mut agg = sample_aggregate(RequestKind::Transfer, Status::Upcoming);
        let first = sample_event(Status::Upcoming);
        let second = sample_event(Status::InProgress);
        agg.enqueue_event(first.clone());
        agg.enqueue_event(second.clone());
        store.insert(&agg).await.unwrap();

        assert_eq!(store.undelivered_events().await.unwrap().len(), 2);

        store.acknowledge_events(agg.id(), &[first.event_id.clone()]).await.unwrap();
        let remaining = store.undelivered_events().await.unwrap();
        assert_eq!(remaining, vec![second]);

        let stored = store.load(agg.id()).await.unwrap().unwrap();
        assert_eq!(stored.version(), 1);
        assert_eq!(
            store.acknowledge_events(&RequestId::new(), &[]).await.unwrap_err().code(),
            "not_found"
        );
    }
}
