//! Workflow engine: the only writer of request status, steps and audit entries

use super::aggregate::{RequestAggregate, RequestFilter, StatusCountMap};
use super::audit::{AuditHistory, AuditLog};
use super::events::EventSink;
use super::register::StatusRegister;
use super::sequencer::{StepAggregate, StepSequencer};
use super::store::WorkflowStore;
use crate::config::{EngineConfig, PropflowConfig};
use crate::error::{Result, WorkflowError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use propflow_types::{
    Actor, ActorId, ApprovalStep, AuditAction, AuditContext, CommandOutcome, DomainEvent, EventAction, EventId,
    NewRequest, RequestId, RequestKind, RequestRecord, Status, StepDecision, StepStatus, WorkflowCommand,
    CAN_MANAGE_STATUS,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const UPSTREAM_REJECTION: &str = "skipped due to upstream rejection";

/// Orchestrates register, sequencer and audit log over a store.
///
/// Every mutation loads the aggregate, applies the change to a copy and
/// commits it against the version it read. Losing a version race is retried
/// only while the record still has the status first observed; once another
/// writer has moved it, the caller gets `ConcurrentModification`.
pub struct WorkflowEngine<S: WorkflowStore + ?Sized> {
    store: Arc<S>,
    register: &'static StatusRegister,
    sequencer: StepSequencer,
    sinks: Vec<Arc<dyn EventSink>>,
    config: EngineConfig,
}

impl<S: WorkflowStore + ?Sized> WorkflowEngine<S> {
    pub fn new(store: Arc<S>, config: &PropflowConfig) -> Self {
        Self {
            store,
            register: StatusRegister::global(),
            sequencer: StepSequencer::from_config(config),
            sinks: Vec::new(),
            config: config.engine.clone(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sequencer(mut self, sequencer: StepSequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn register(&self) -> &'static StatusRegister {
        self.register
    }

    pub fn sequencer(&self) -> &StepSequencer {
        &self.sequencer
    }

    /// Create a record in its kind's initial status, with its step sequence
    pub async fn create(&self, kind: RequestKind, actor: &Actor, request: NewRequest) -> Result<RequestRecord> {
        let result = self.create_inner(kind, actor, request).await;
        result.map_err(|e| self.report("create", kind.as_str(), e))
    }

    async fn create_inner(&self, kind: RequestKind, actor: &Actor, request: NewRequest) -> Result<RequestRecord> {
        let steps = self.sequencer.instantiate(kind, &request.steps)?;
        let status = self.register.initial_status(kind);
        let now = Utc::now();

        let record = RequestRecord {
            id: RequestId::new(),
            kind,
            status,
            created_by: actor.id.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
            department_id: request.department_id,
            data: request.data,
        };

        let mut aggregate = RequestAggregate::new(record, steps);
        let mut context = actor.context.clone();
        context.insert("step_count", aggregate.steps().len() as u64);
        AuditLog::append(
            &mut aggregate,
            &actor.id,
            AuditAction::Created,
            None,
            Some(status.as_str().to_string()),
            context,
            now,
        );

        let event = build_event(&aggregate, EventAction::Created, None, &actor.id, now);
        aggregate.enqueue_event(event.clone());

        self.store.insert(&aggregate).await?;
        log::info!("Created {} request {} in {}", kind, aggregate.id(), status);

        self.deliver(&event).await;

        Ok(aggregate.into_record())
    }

    /// Move a record to `target` if the register allows it. While approval
    /// steps are still pending, the statuses those steps decide are reachable
    /// only through `act_on_step`.
    pub async fn transition_status(
        &self,
        id: &RequestId,
        actor: &Actor,
        target: Status,
        notes: Option<String>,
    ) -> Result<RequestRecord> {
        let register = self.register;

        let result = self
            .mutate(id, &actor.id, |aggregate, now| {
                let kind = aggregate.kind();
                let current = aggregate.status();
                register.ensure_valid(kind, target)?;
                if !register.is_legal_transition(kind, current, target) {
                    return Err(WorkflowError::IllegalTransition {
                        kind,
                        from: current,
                        to: target,
                    });
                }
                if is_step_derived(register, kind, target) && has_pending_steps(aggregate.steps()) {
                    log::debug!("{} on request {} is decided by its approval steps", target, aggregate.id());
                    return Err(WorkflowError::IllegalTransition {
                        kind,
                        from: current,
                        to: target,
                    });
                }
                authorize_status_change(actor, &aggregate.record.created_by, "change status")?;

                apply_status(aggregate, actor, AuditAction::StatusChanged, target, notes_context(actor, &notes), now);
                Ok(((), EventAction::StatusChanged))
            })
            .await;

        match result {
            Ok((aggregate, (), event)) => {
                log::info!("Request {} moved from {:?} to {}", id, event.old_status, event.new_status);
                self.deliver(&event).await;
                Ok(aggregate.into_record())
            }
            Err(e) => Err(self.report("transition_status", id.as_str(), e)),
        }
    }

    /// Record a step decision and apply any parent status it implies
    pub async fn act_on_step(
        &self,
        id: &RequestId,
        step_order: u32,
        actor: &Actor,
        decision: StepDecision,
        notes: Option<String>,
    ) -> Result<(RequestRecord, ApprovalStep)> {
        let register = self.register;
        let sequencer = &self.sequencer;

        let result = self
            .mutate(id, &actor.id, |aggregate, now| {
                let kind = aggregate.kind();
                let current = aggregate.status();
                if register.is_terminal(kind, current) {
                    return Err(WorkflowError::AlreadyTerminal { status: current });
                }

                let creator = aggregate.record.created_by.clone();
                let step = sequencer.act_on_step(
                    kind,
                    &creator,
                    &mut aggregate.steps,
                    step_order,
                    actor,
                    decision,
                    notes.clone(),
                    now,
                )?;

                let action = match decision {
                    StepDecision::Approved => AuditAction::StepApproved,
                    StepDecision::Rejected => AuditAction::StepRejected,
                };
                let mut context = notes_context(actor, &step.notes);
                context.insert("step_order", step.step_order);
                context.insert("step_code", step.code.clone());
                AuditLog::append(
                    aggregate,
                    &actor.id,
                    action,
                    Some(StepStatus::Pending.as_str().to_string()),
                    Some(step.status.as_str().to_string()),
                    context,
                    now,
                );

                let derived = match StepSequencer::aggregate(&aggregate.steps) {
                    StepAggregate::Rejected => {
                        for skipped in StepSequencer::skip_pending(&mut aggregate.steps, now) {
                            let context = actor
                                .context
                                .clone()
                                .with("step_order", skipped)
                                .with("reason", UPSTREAM_REJECTION);
                            AuditLog::append(
                                aggregate,
                                &actor.id,
                                AuditAction::StepSkipped,
                                Some(StepStatus::Pending.as_str().to_string()),
                                Some(StepStatus::Skipped.as_str().to_string()),
                                context,
                                now,
                            );
                        }
                        register.rejection_status(kind)
                    }
                    StepAggregate::AllApproved => register.success_status(kind),
                    StepAggregate::InFlight => None,
                };

                match derived {
                    Some(target) if register.is_legal_transition(kind, current, target) => {
                        let context = actor.context.clone().with("derived_from_step", step.step_order);
                        apply_status(aggregate, actor, AuditAction::StatusChanged, target, context, now);
                    }
                    Some(target) => {
                        log::debug!("Request {} keeps {}; {} is not reachable from it", aggregate.id(), current, target);
                        aggregate.touch(now);
                    }
                    None => aggregate.touch(now),
                }

                Ok((step, EventAction::StepActed))
            })
            .await;

        match result {
            Ok((aggregate, step, event)) => {
                log::info!(
                    "Step {} of request {} {} by {}",
                    step.step_order,
                    id,
                    step.status,
                    actor.id
                );
                self.deliver(&event).await;
                Ok((aggregate.into_record(), step))
            }
            Err(e) => Err(self.report("act_on_step", id.as_str(), e)),
        }
    }

    /// Move a record to its kind's cancellation status
    pub async fn cancel(&self, id: &RequestId, actor: &Actor, reason: Option<String>) -> Result<RequestRecord> {
        let register = self.register;

        let result = self
            .mutate(id, &actor.id, |aggregate, now| {
                let kind = aggregate.kind();
                let current = aggregate.status();
                let target = register
                    .cancellation_status(kind)
                    .ok_or_else(|| WorkflowError::InvalidStatus {
                        kind: kind.as_str().to_string(),
                        status: Status::Cancelled.as_str().to_string(),
                    })?;
                if register.is_terminal(kind, current) {
                    return Err(WorkflowError::AlreadyTerminal { status: current });
                }
                if !register.is_legal_transition(kind, current, target) {
                    return Err(WorkflowError::IllegalTransition {
                        kind,
                        from: current,
                        to: target,
                    });
                }
                authorize_status_change(actor, &aggregate.record.created_by, "cancel")?;

                let mut context = actor.context.clone();
                if let Some(reason) = reason.as_ref().filter(|r| !r.trim().is_empty()) {
                    context.insert("reason", reason.clone());
                }
                apply_status(aggregate, actor, AuditAction::Cancelled, target, context, now);
                Ok(((), EventAction::Cancelled))
            })
            .await;

        match result {
            Ok((aggregate, (), event)) => {
                log::info!("Request {} cancelled by {}", id, actor.id);
                self.deliver(&event).await;
                Ok(aggregate.into_record())
            }
            Err(e) => Err(self.report("cancel", id.as_str(), e)),
        }
    }

    /// Record plus steps and audit trail
    pub async fn get(&self, id: &RequestId) -> Result<RequestAggregate> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("request {}", id)))
    }

    pub async fn history(&self, id: &RequestId) -> Result<AuditHistory> {
        Ok(AuditLog::history(&self.get(id).await?))
    }

    /// Read query for reports and exports
    pub async fn query(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>> {
        self.store.list(filter).await
    }

    pub async fn summarize(&self, filter: &RequestFilter) -> Result<StatusCountMap> {
        let records = self.store.list(filter).await?;
        Ok(records.iter().collect())
    }

    /// Execute a serialized command, turning every failure into an error payload
    pub async fn execute(&self, command: &WorkflowCommand) -> CommandOutcome {
        match self.dispatch(command).await {
            Ok((record, step)) => CommandOutcome::success(command, record, step),
            Err(e) => CommandOutcome::failure(command, e.to_payload()),
        }
    }

    async fn dispatch(&self, command: &WorkflowCommand) -> Result<(RequestRecord, Option<ApprovalStep>)> {
        match command {
            WorkflowCommand::Create { kind, actor, request } => {
                let kind = self.register.parse_kind(kind)?;
                let record = self.create(kind, actor, request.clone()).await?;
                Ok((record, None))
            }
            WorkflowCommand::Transition {
                request_id,
                actor,
                target,
                notes,
            } => {
                let id = RequestId::from_string(request_id)?;
                let kind = self.get(&id).await?.kind();
                let target = self.register.parse_status(kind, target)?;
                let record = self.transition_status(&id, actor, target, notes.clone()).await?;
                Ok((record, None))
            }
            WorkflowCommand::ActOnStep {
                request_id,
                step_order,
                actor,
                decision,
                notes,
            } => {
                let id = RequestId::from_string(request_id)?;
                let decision: StepDecision = decision.parse()?;
                let (record, step) = self
                    .act_on_step(&id, *step_order, actor, decision, notes.clone())
                    .await?;
                Ok((record, Some(step)))
            }
            WorkflowCommand::Cancel {
                request_id,
                actor,
                reason,
            } => {
                let id = RequestId::from_string(request_id)?;
                let record = self.cancel(&id, actor, reason.clone()).await?;
                Ok((record, None))
            }
        }
    }

    /// Load, apply, commit with bounded optimistic retries
    async fn mutate<T, F>(
        &self,
        id: &RequestId,
        actor: &ActorId,
        mut apply: F,
    ) -> Result<(RequestAggregate, T, DomainEvent)>
    where
        F: FnMut(&mut RequestAggregate, DateTime<Utc>) -> Result<(T, EventAction)> + Send,
        T: Send,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut observed: Option<Status> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let current = self.get(id).await?;
            match observed {
                None => observed = Some(current.status()),
                Some(status) if status != current.status() => {
                    return Err(WorkflowError::ConcurrentModification {
                        request_id: id.to_string(),
                    });
                }
                Some(_) => {}
            }

            let mut next = current.clone();
            let now = Utc::now();
            let (value, action) = apply(&mut next, now)?;
            let event = build_event(&next, action, Some(current.status()), actor, now);
            next.enqueue_event(event.clone());

            match self.store.commit(&next, current.version()).await {
                Ok(()) => return Ok((next, value, event)),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    log::debug!("Version race on request {} (attempt {}/{})", id, attempt, max_attempts);
                    sleep(Duration::from_millis(self.config.retry_backoff_ms * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send every committed but unacknowledged event to the sinks again.
    /// Returns how many were delivered; the rest stay queued for the next run.
    pub async fn redeliver_pending(&self) -> Result<usize> {
        let events = self.store.undelivered_events().await?;
        if events.is_empty() {
            return Ok(0);
        }

        log::info!("Redelivering {} queued event(s)", events.len());
        let mut delivered = 0;
        for event in &events {
            if self.deliver(event).await {
                delivered += 1;
            }
        }

        if delivered < events.len() {
            log::warn!("{} event(s) still queued after redelivery", events.len() - delivered);
        }
        Ok(delivered)
    }

    /// Publish a committed event and acknowledge it once every sink took it.
    /// Failures never undo the change; the event stays queued on the aggregate.
    async fn deliver(&self, event: &DomainEvent) -> bool {
        if !self.publish(event).await {
            return false;
        }

        match self
            .store
            .acknowledge_events(&event.request_id, std::slice::from_ref(&event.event_id))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Event {} delivered but not acknowledged: {}", event.event_id, e);
                false
            }
        }
    }

    async fn publish(&self, event: &DomainEvent) -> bool {
        let results = join_all(self.sinks.iter().map(|sink| sink.publish(event))).await;
        let mut delivered = true;
        for result in results {
            if let Err(e) = result {
                log::warn!("Event {} for request {} not delivered: {}", event.event_id, event.request_id, e);
                delivered = false;
            }
        }
        delivered
    }

    fn report(&self, operation: &str, target: &str, error: WorkflowError) -> WorkflowError {
        match &error {
            WorkflowError::StorageUnavailable(_) | WorkflowError::Config(_) => {
                log::error!("{} on {} failed: {}", operation, target, error)
            }
            WorkflowError::ConcurrentModification { .. } => {
                log::warn!("{} on {} lost a concurrent update", operation, target)
            }
            e if e.is_business_rule() => log::info!("{} on {} rejected: {}", operation, target, error),
            _ => log::debug!("{} on {} refused: {}", operation, target, error),
        }
        error
    }
}

/// Creator of the record, or anyone holding `can_manage_status`
fn authorize_status_change(actor: &Actor, creator: &ActorId, action: &str) -> Result<()> {
    if &actor.id == creator || actor.can(CAN_MANAGE_STATUS) {
        Ok(())
    } else {
        Err(WorkflowError::ActorNotAuthorized {
            actor: actor.id.to_string(),
            action: action.to_string(),
        })
    }
}

/// Success and rejection statuses are the ones a kind's steps decide.
/// Cancellation stays a manual action even where it doubles as rejection.
fn is_step_derived(register: &StatusRegister, kind: RequestKind, target: Status) -> bool {
    let decided = register.success_status(kind) == Some(target) || register.rejection_status(kind) == Some(target);
    decided && register.cancellation_status(kind) != Some(target)
}

fn has_pending_steps(steps: &[ApprovalStep]) -> bool {
    steps.iter().any(|step| step.status == StepStatus::Pending)
}

fn notes_context(actor: &Actor, notes: &Option<String>) -> AuditContext {
    let mut context = actor.context.clone();
    if let Some(notes) = notes.as_ref().filter(|n| !n.trim().is_empty()) {
        context.insert("notes", notes.clone());
    }
    context
}

/// Status write and its audit entry, always together
fn apply_status(
    aggregate: &mut RequestAggregate,
    actor: &Actor,
    action: AuditAction,
    target: Status,
    context: AuditContext,
    now: DateTime<Utc>,
) {
    let previous = aggregate.status();
    aggregate.record.status = target;
    aggregate.touch(now);
    AuditLog::append(
        aggregate,
        &actor.id,
        action,
        Some(previous.as_str().to_string()),
        Some(target.as_str().to_string()),
        context,
        now,
    );
}

fn build_event(
    aggregate: &RequestAggregate,
    action: EventAction,
    old_status: Option<Status>,
    actor: &ActorId,
    timestamp: DateTime<Utc>,
) -> DomainEvent {
    DomainEvent {
        event_id: EventId::new(),
        request_id: aggregate.id().clone(),
        kind: aggregate.kind(),
        action,
        old_status,
        new_status: aggregate.status(),
        actor: actor.clone(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::store::MemoryStore;
    use propflow_types::StepActor;

    fn engine() -> WorkflowEngine<MemoryStore> {
        WorkflowEngine::new(Arc::new(MemoryStore::new()), &PropflowConfig::default())
    }

    fn loan_request() -> NewRequest {
        NewRequest::default()
            .with_department("library")
            .with_step("prepared_by", StepActor::internal("alice"))
            .with_step("approved_by", StepActor::internal("head"))
    }

    #[tokio::test]
    async fn test_create_sets_initial_status_and_audit() {
        let engine = engine();
        let record = engine
            .create(RequestKind::OffCampusLoan, &Actor::new("alice"), loan_request())
            .await
            .unwrap();

        assert_eq!(record.status, Status::PendingReview);
        assert_eq!(record.version, 1);

        let aggregate = engine.get(&record.id).await.unwrap();
        assert_eq!(aggregate.steps().len(), 2);
        let history = engine.history(&record.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().action, AuditAction::Created);
    }

    #[tokio::test]
    async fn test_all_approvals_reach_success_status() {
        let engine = engine();
        let record = engine
            .create(RequestKind::OffCampusLoan, &Actor::new("alice"), loan_request())
            .await
            .unwrap();

        engine
            .act_on_step(&record.id, 1, &Actor::new("alice"), StepDecision::Approved, None)
            .await
            .unwrap();
        let (record, step) = engine
            .act_on_step(&record.id, 2, &Actor::new("head"), StepDecision::Approved, None)
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::Approved);
        assert_eq!(record.status, Status::PendingReturn);
    }

    #[tokio::test]
    async fn test_act_on_terminal_parent_is_refused() {
        let engine = engine();
        let alice = Actor::new("alice");
        let record = engine
            .create(RequestKind::OffCampusLoan, &alice, loan_request())
            .await
            .unwrap();
        engine.cancel(&record.id, &alice, Some("no longer needed".to_string())).await.unwrap();

        let error = engine
            .act_on_step(&record.id, 1, &alice, StepDecision::Approved, None)
            .await
            .unwrap_err();
        assert_eq!(error, WorkflowError::AlreadyTerminal { status: Status::Cancelled });
    }

    #[tokio::test]
    async fn test_execute_reports_codes() {
        let engine = engine();
        let outcome = engine
            .execute(&WorkflowCommand::Create {
                kind: "parking_permit".to_string(),
                actor: Actor::new("alice"),
                request: NewRequest::default(),
            })
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.unwrap().code, "invalid_kind");

        let created = engine
            .execute(&WorkflowCommand::Create {
                kind: "transfer".to_string(),
                actor: Actor::new("alice"),
                request: NewRequest::default(),
            })
            .await;
        let record = created.record.unwrap();

        let outcome = engine
            .execute(&WorkflowCommand::Transition {
                request_id: record.id.to_string(),
                actor: Actor::new("alice"),
                target: "lost".to_string(),
                notes: None,
            })
            .await;
        let payload = outcome.error.unwrap();
        assert_eq!(payload.code, "invalid_status");
        assert_eq!(payload.attempted_status.as_deref(), Some("lost"));

        let outcome = engine
            .execute(&WorkflowCommand::Transition {
                request_id: record.id.to_string(),
                actor: Actor::new("alice"),
                target: "in_progress".to_string(),
                notes: Some("truck booked".to_string()),
            })
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.record.unwrap().status, Status::InProgress);
    }

    #[tokio::test]
    async fn test_cancel_without_cancellation_status() {
        let engine = engine();
        let alice = Actor::new("alice");
        let record = engine
            .create(RequestKind::Transfer, &alice, NewRequest::default())
            .await
            .unwrap();

        let error = engine.cancel(&record.id, &alice, None).await.unwrap_err();
        assert_eq!(error.code(), "invalid_status");
        assert_eq!(engine.history(&record.id).await.unwrap().len(), 1);
    }
}
