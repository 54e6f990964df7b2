//! Directory watcher for delivering queued domain events
//!
//! This module polls the event outbox and hands every event to a notification
//! consumer, treating the directory like a message queue. Delivered files move
//! to `events/processed/`; failed deliveries stay queued for the next pass.
//! One watcher owns an outbox: a `.processing` claim left behind by a crash is
//! put back in the queue before every pass.

use super::events::EventDeduplicator;
use crate::error::{Result, WorkflowError};
use crate::paths;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use propflow_types::DomainEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

const DEDUPE_CAPACITY: usize = 10_000;
const CLAIM_SUFFIX: &str = ".processing";

/// Downstream recipient of domain events (mail, chat, report cache invalidation)
#[async_trait]
pub trait NotificationConsumer: Send + Sync {
    async fn notify(&self, event: &DomainEvent) -> Result<()>;
}

/// Counts from one pass over the outbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxPass {
    pub delivered: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub invalid: usize,
}

/// Watches the outbox directory and delivers queued events
pub struct OutboxWatcher<C: NotificationConsumer> {
    consumer: Arc<C>,
    outbox_dir: PathBuf,
    processed_dir: PathBuf,
    failed_dir: PathBuf,
    processing_interval: Duration,
    dedupe: Mutex<EventDeduplicator>,
}

impl<C: NotificationConsumer + 'static> OutboxWatcher<C> {
    pub fn new<P: AsRef<Path>>(root_path: P, consumer: Arc<C>, processing_interval: Duration) -> Result<Self> {
        let root_path = root_path.as_ref();
        let watcher = Self {
            consumer,
            outbox_dir: paths::outbox_dir(root_path),
            processed_dir: paths::events_processed_dir(root_path),
            failed_dir: paths::events_failed_dir(root_path),
            processing_interval,
            dedupe: Mutex::new(EventDeduplicator::new(DEDUPE_CAPACITY)),
        };

        for dir in [&watcher.outbox_dir, &watcher.processed_dir, &watcher.failed_dir] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(watcher)
    }

    /// Start watching the outbox directory
    pub async fn start(self: Arc<Self>) {
        info!("Starting outbox watcher for directory: {:?}", self.outbox_dir);

        loop {
            match self.process_pending().await {
                Ok(pass) if pass.delivered + pass.failed + pass.invalid > 0 => {
                    info!(
                        "Outbox pass: {} delivered, {} duplicates, {} failed, {} invalid",
                        pass.delivered, pass.duplicates, pass.failed, pass.invalid
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Failed to read outbox directory: {}", e),
            }
            sleep(self.processing_interval).await;
        }
    }

    /// Return abandoned `.processing` claims to the queue
    pub async fn recover_claimed(&self) -> Result<usize> {
        let mut recovered = 0;
        let mut entries = tokio::fs::read_dir(&self.outbox_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let claimed = entry.path();
            let Some(original) = claimed
                .to_str()
                .and_then(|path| path.strip_suffix(CLAIM_SUFFIX))
                .map(PathBuf::from)
            else {
                continue;
            };

            warn!("Recovering abandoned claim {:?}", claimed);
            tokio::fs::rename(&claimed, &original).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Deliver every queued event once, oldest first
    pub async fn process_pending(&self) -> Result<OutboxPass> {
        self.recover_claimed().await?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.outbox_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if paths::is_pending_json(&path, paths::EVENT_FILE_PREFIX) {
                files.push(path);
            }
        }
        files.sort();

        let mut pass = OutboxPass::default();
        for path in files {
            match self.process_event_file(&path).await {
                Ok(Delivery::Delivered) => pass.delivered += 1,
                Ok(Delivery::Duplicate) => pass.duplicates += 1,
                Ok(Delivery::Invalid) => pass.invalid += 1,
                Err(e) => {
                    warn!("Delivery of {:?} failed, will retry: {}", path, e);
                    pass.failed += 1;
                }
            }
        }

        Ok(pass)
    }

    /// Process a single event file
    async fn process_event_file(&self, path: &Path) -> Result<Delivery> {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| WorkflowError::InvalidRequest(format!("bad outbox file name {:?}", path)))?
            .to_string();

        // Mark file as being processed by renaming it
        let processing_path = path.with_file_name(format!("{}{}", file_name, CLAIM_SUFFIX));
        tokio::fs::rename(path, &processing_path).await?;

        let result = self.deliver_claimed(&processing_path, &file_name).await;
        if result.is_err() {
            // Put the claim back so the next pass retries it
            if let Err(e) = tokio::fs::rename(&processing_path, path).await {
                error!("Could not return {} to the outbox: {}", file_name, e);
            }
        }
        result
    }

    async fn deliver_claimed(&self, processing_path: &Path, file_name: &str) -> Result<Delivery> {
        let content = tokio::fs::read_to_string(processing_path).await?;
        let event: DomainEvent = match serde_json::from_str(&content) {
            Ok(event) => event,
            Err(e) => {
                error!("Unparseable event file {}: {}", file_name, e);
                tokio::fs::rename(processing_path, self.failed_dir.join(file_name)).await?;
                return Ok(Delivery::Invalid);
            }
        };

        if !self.dedupe.lock().await.first_delivery(&event) {
            debug!("Dropping duplicate event {} for request {}", event.event_id, event.request_id);
            tokio::fs::rename(processing_path, self.processed_dir.join(file_name)).await?;
            return Ok(Delivery::Duplicate);
        }

        match self.consumer.notify(&event).await {
            Ok(()) => {
                tokio::fs::rename(processing_path, self.processed_dir.join(file_name)).await?;
                debug!("Delivered event {}", event.event_id);
                Ok(Delivery::Delivered)
            }
            Err(e) => {
                // Forget the key so the retry is not mistaken for a duplicate
                self.dedupe.lock().await.forget(&event);
                Err(e)
            }
        }
    }
}

enum Delivery {
    Delivered,
    Duplicate,
    Invalid,
}
