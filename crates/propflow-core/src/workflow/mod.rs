//! Workflow management module

pub mod aggregate;
pub mod audit;
pub mod engine;
pub mod events;
pub mod file_store;
pub mod outbox_watcher;
pub mod register;
pub mod sequencer;
pub mod store;

pub use aggregate::{RequestAggregate, RequestFilter, StatusCountMap};
pub use audit::{AuditHistory, AuditLog};
pub use engine::WorkflowEngine;
pub use events::{BroadcastEventSink, EventDeduplicator, EventSink, OutboxEventSink};
pub use file_store::FileStore;
pub use outbox_watcher::{NotificationConsumer, OutboxPass, OutboxWatcher};
pub use register::{KindRules, StatusRegister};
pub use sequencer::{StepAggregate, StepSequencer, StepTemplate};
pub use store::{MemoryStore, WorkflowStore};
