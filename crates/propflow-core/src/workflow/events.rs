//! Domain event delivery
//!
//! Events are published after the aggregate is committed. A sink failure is
//! reported to the caller of `publish` but never undoes the committed change.

use crate::error::{Result, WorkflowError};
use crate::paths;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propflow_types::{DomainEvent, RequestId, Status};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<()>;
}

/// In-process fan-out over a tokio broadcast channel
pub struct BroadcastEventSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> BroadcastStream<DomainEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        // No subscribers is not a delivery failure
        if self.sender.send(event.clone()).is_err() {
            log::debug!("No subscribers for event {}", event.event_id);
        }
        Ok(())
    }
}

/// Durable outbox: one JSON file per event under `events/outbox/`
pub struct OutboxEventSink {
    outbox_dir: PathBuf,
}

impl OutboxEventSink {
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref();
        let outbox_dir = paths::outbox_dir(root_path);
        std::fs::create_dir_all(&outbox_dir)?;
        std::fs::create_dir_all(paths::events_processed_dir(root_path))?;

        Ok(Self { outbox_dir })
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }

    /// Timestamp first so a directory listing sorts in emission order
    fn event_file_name(event: &DomainEvent) -> String {
        format!(
            "{}{:020}_{}.json",
            paths::EVENT_FILE_PREFIX,
            event.timestamp.timestamp_micros().max(0),
            event.event_id
        )
    }
}

#[async_trait]
impl EventSink for OutboxEventSink {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let json = serde_json::to_string_pretty(event)
            .map_err(|e| WorkflowError::StorageUnavailable(format!("Failed to serialize event: {}", e)))?;

        let path = self.outbox_dir.join(Self::event_file_name(event));
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        log::debug!("Queued event {} in outbox", event.event_id);
        Ok(())
    }
}

/// Remembers recently seen events so at-least-once delivery turns into
/// effectively-once handling. Bounded; the oldest keys are evicted first.
#[derive(Debug)]
pub struct EventDeduplicator {
    seen: HashSet<(RequestId, Status, DateTime<Utc>)>,
    order: VecDeque<(RequestId, Status, DateTime<Utc>)>,
    capacity: usize,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// True the first time an event key is observed
    pub fn first_delivery(&mut self, event: &DomainEvent) -> bool {
        let key = event.dedupe_key();
        if !self.seen.insert(key.clone()) {
            return false;
        }

        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    /// Drop a key so the same event can be delivered again
    pub fn forget(&mut self, event: &DomainEvent) {
        let key = event.dedupe_key();
        if self.seen.remove(&key) {
            self.order.retain(|k| k != &key);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
