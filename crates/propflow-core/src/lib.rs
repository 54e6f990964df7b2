//! Propflow Core Library
//!
//! Approval workflow engine for university property requests: the status
//! register, audit log, step sequencer and engine, plus the stores, event
//! sinks and configuration they run on.

pub mod config;
pub mod error;
pub mod paths;
pub mod workflow;

// Re-export main types for easy access
pub use config::PropflowConfig;
pub use error::{Result, WorkflowError};

// Re-export workflow types
pub use workflow::{
    AuditHistory,
    BroadcastEventSink,
    EventSink,
    FileStore,
    MemoryStore,
    NotificationConsumer,
    OutboxEventSink,
    OutboxWatcher,
    RequestAggregate,
    RequestFilter,
    StatusCountMap,
    StatusRegister,
    StepSequencer,
    WorkflowEngine,
    WorkflowStore,
};
