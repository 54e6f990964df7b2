//! File-backed request store
//! One JSON document per request, replaced atomically on every commit

use super::aggregate::{RequestAggregate, RequestFilter};
use super::store::WorkflowStore;
use crate::error::{Result, WorkflowError};
use crate::paths;
use async_trait::async_trait;
use propflow_types::{DomainEvent, EventId, RequestId, RequestKind, RequestRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

/// Durable store rooted at a data directory.
///
/// Layout: `records/<kind>/request_<id>.json`. Each document holds the record,
/// its steps and its audit trail, so a rename swaps all three at once.
pub struct FileStore {
    root_path: PathBuf,
    locks: Mutex<HashMap<RequestId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStore {
    /// Create new FileStore with specified root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        for kind in RequestKind::ALL {
            std::fs::create_dir_all(paths::kind_dir(&root_path, kind))?;
        }

        Ok(Self {
            root_path,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Get path for a request of a known kind
    fn record_path(&self, kind: RequestKind, id: &RequestId) -> PathBuf {
        paths::kind_dir(&self.root_path, kind).join(paths::record_file_name(id.as_str()))
    }

    /// Find a request in any kind directory
    async fn find_record_path(&self, id: &RequestId) -> Result<Option<PathBuf>> {
        for kind in RequestKind::ALL {
            let path = self.record_path(kind, id);
            if fs::try_exists(&path).await? {
                log::debug!("Found request {} under {}", id, kind);
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Per-request lock serializing read-compare-write in `commit`
    fn lock_for(&self, id: &RequestId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Drop our handle and evict the entry once nobody else holds or waits on it
    fn release_lock(&self, id: &RequestId, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(id);
        }
    }

    async fn read_aggregate(&self, path: &Path) -> Result<RequestAggregate> {
        let json = fs::read_to_string(path).await?;

        serde_json::from_str(&json).map_err(|e| {
            WorkflowError::StorageUnavailable(format!("corrupt request document {}: {}", path.display(), e))
        })
    }

    /// Write to a sibling temp file, then rename over the target
    async fn write_aggregate(&self, path: &Path, aggregate: &RequestAggregate) -> Result<()> {
        let json = serde_json::to_string_pretty(aggregate)
            .map_err(|e| WorkflowError::StorageUnavailable(format!("Failed to serialize request: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, path).await?;

        Ok(())
    }

    /// Readable aggregates of one kind; corrupt documents are logged and skipped
    async fn scan_kind(&self, kind: RequestKind) -> Result<Vec<RequestAggregate>> {
        let kind_dir = paths::kind_dir(&self.root_path, kind);
        let mut aggregates = Vec::new();

        if !fs::try_exists(&kind_dir).await? {
            return Ok(aggregates);
        }

        let mut entries = fs::read_dir(&kind_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !paths::is_pending_json(&path, paths::RECORD_FILE_PREFIX) {
                continue;
            }

            match self.read_aggregate(&path).await {
                Ok(aggregate) => aggregates.push(aggregate),
                Err(e) => log::warn!("Skipping unreadable request document {:?}: {}", path, e),
            }
        }

        Ok(aggregates)
    }

    async fn insert_locked(&self, aggregate: &RequestAggregate) -> Result<()> {
        let path = self.record_path(aggregate.kind(), aggregate.id());
        if fs::try_exists(&path).await? {
            return Err(WorkflowError::InvalidRequest(format!(
                "request {} already exists",
                aggregate.id()
            )));
        }

        self.write_aggregate(&path, aggregate).await?;

        log::info!("Created request document {}", path.display());
        Ok(())
    }

    async fn commit_locked(&self, aggregate: &RequestAggregate, expected_version: u64) -> Result<()> {
        let path = self.record_path(aggregate.kind(), aggregate.id());
        if !fs::try_exists(&path).await? {
            return Err(WorkflowError::NotFound(format!("request {}", aggregate.id())));
        }

        let current = self.read_aggregate(&path).await?;
        if current.version() != expected_version {
            return Err(WorkflowError::ConcurrentModification {
                request_id: aggregate.id().to_string(),
            });
        }

        self.write_aggregate(&path, aggregate).await?;

        log::debug!("Committed request {} at version {}", aggregate.id(), aggregate.version());
        Ok(())
    }

    async fn acknowledge_locked(&self, id: &RequestId, delivered: &[EventId]) -> Result<()> {
        let path = self
            .find_record_path(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("request {}", id)))?;

        let mut aggregate = self.read_aggregate(&path).await?;
        if aggregate.acknowledge(delivered) {
            self.write_aggregate(&path, &aggregate).await?;
            log::debug!("Acknowledged {} event(s) on request {}", delivered.len(), id);
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn insert(&self, aggregate: &RequestAggregate) -> Result<()> {
        let lock = self.lock_for(aggregate.id());
        let result = {
            let _guard = lock.lock().await;
            self.insert_locked(aggregate).await
        };
        self.release_lock(aggregate.id(), lock);
        result
    }

    async fn load(&self, id: &RequestId) -> Result<Option<RequestAggregate>> {
        match self.find_record_path(id).await? {
            Some(path) => Ok(Some(self.read_aggregate(&path).await?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, aggregate: &RequestAggregate, expected_version: u64) -> Result<()> {
        let lock = self.lock_for(aggregate.id());
        let result = {
            let _guard = lock.lock().await;
            self.commit_locked(aggregate, expected_version).await
        };
        self.release_lock(aggregate.id(), lock);
        result
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>> {
        let kinds = match filter.kind {
            Some(kind) => vec![kind],
            None => RequestKind::ALL.to_vec(),
        };

        let mut records = Vec::new();
        for kind in kinds {
            for aggregate in self.scan_kind(kind).await? {
                if filter.matches(aggregate.record()) {
                    records.push(aggregate.into_record());
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn undelivered_events(&self) -> Result<Vec<DomainEvent>> {
        let mut events = Vec::new();
        for kind in RequestKind::ALL {
            for aggregate in self.scan_kind(kind).await? {
                events.extend(aggregate.pending_events);
            }
        }

        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    async fn acknowledge_events(&self, id: &RequestId, delivered: &[EventId]) -> Result<()> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.acknowledge_locked(id, delivered).await
        };
        self.release_lock(id, lock);
        result
    }
}
