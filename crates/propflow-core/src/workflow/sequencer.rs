//! Ordered sign-off steps and the parent status they imply

use crate::config::PropflowConfig;
use crate::error::{Result, WorkflowError};
use chrono::{DateTime, Utc};
use propflow_types::{
    Actor, ActorId, ApprovalStep, RequestKind, StepActor, StepAssignment, StepDecision, StepStatus,
    CAN_APPROVE_STEP,
};
use std::collections::{HashMap, HashSet};

/// One slot in a kind's step template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTemplate {
    pub code: String,
    /// The record creator may sign this step even when assigned to someone else
    pub auto_approve_by_creator: bool,
}

impl StepTemplate {
    fn new(code: &str, auto_approve_by_creator: bool) -> Self {
        Self {
            code: code.to_string(),
            auto_approve_by_creator,
        }
    }
}

/// What the step states imply for the parent record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAggregate {
    /// Some steps still pending, none rejected
    InFlight,
    AllApproved,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct StepSequencer {
    templates: HashMap<RequestKind, Vec<StepTemplate>>,
    strict_order: HashSet<RequestKind>,
}

impl Default for StepSequencer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StepSequencer {
    /// Built-in templates; steps may be acted on in any order
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            RequestKind::TurnoverDisposal,
            vec![
                StepTemplate::new("prepared_by", true),
                StepTemplate::new("noted_by", false),
                StepTemplate::new("approved_by", false),
            ],
        );
        templates.insert(
            RequestKind::OffCampusLoan,
            vec![
                StepTemplate::new("prepared_by", true),
                StepTemplate::new("approved_by", false),
            ],
        );
        templates.insert(
            RequestKind::VerificationForm,
            vec![
                StepTemplate::new("prepared_by", true),
                StepTemplate::new("noted_by", false),
                StepTemplate::new("approved_by", false),
                StepTemplate::new("received_by", false),
            ],
        );

        Self {
            templates,
            strict_order: HashSet::new(),
        }
    }

    /// Built-in templates with the configured overrides and ordering policy applied
    pub fn from_config(config: &PropflowConfig) -> Self {
        let mut sequencer = Self::builtin();

        for (kind, steps) in &config.templates {
            let template = steps
                .iter()
                .map(|step| StepTemplate::new(&step.code, step.auto_approve_by_creator))
                .collect();
            sequencer.templates.insert(*kind, template);
        }

        sequencer.strict_order = config.engine.strict_step_order.iter().copied().collect();
        sequencer
    }

    pub fn with_strict_order(mut self, kind: RequestKind) -> Self {
        self.strict_order.insert(kind);
        self
    }

    pub fn template(&self, kind: RequestKind) -> &[StepTemplate] {
        self.templates.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_strict(&self, kind: RequestKind) -> bool {
        self.strict_order.contains(&kind)
    }

    /// Build the full step list for a new record. Every template code needs
    /// exactly one assignment; nothing else is accepted.
    pub fn instantiate(&self, kind: RequestKind, assignments: &[StepAssignment]) -> Result<Vec<ApprovalStep>> {
        let template = self.template(kind);

        let mut seen = HashSet::new();
        for assignment in assignments {
            if !seen.insert(assignment.code.as_str()) {
                return Err(WorkflowError::InvalidRequest(format!(
                    "step '{}' assigned more than once",
                    assignment.code
                )));
            }
            if !template.iter().any(|slot| slot.code == assignment.code) {
                return Err(WorkflowError::InvalidRequest(format!(
                    "{} has no step '{}'",
                    kind, assignment.code
                )));
            }
            validate_actor(&assignment.code, &assignment.actor)?;
        }

        template
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let assignment = assignments
                    .iter()
                    .find(|assignment| assignment.code == slot.code)
                    .ok_or_else(|| {
                        WorkflowError::InvalidRequest(format!("missing actor for step '{}'", slot.code))
                    })?;

                Ok(ApprovalStep {
                    step_order: index as u32 + 1,
                    code: slot.code.clone(),
                    actor: assignment.actor.clone(),
                    status: StepStatus::Pending,
                    auto_approve_by_creator: slot.auto_approve_by_creator,
                    acted_at: None,
                    acted_by: None,
                    notes: None,
                })
            })
            .collect()
    }

    /// Record `decision` on one step. Leaves `steps` untouched on any error.
    #[allow(clippy::too_many_arguments)]
    pub fn act_on_step(
        &self,
        kind: RequestKind,
        creator: &ActorId,
        steps: &mut [ApprovalStep],
        step_order: u32,
        actor: &Actor,
        decision: StepDecision,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStep> {
        let index = steps
            .iter()
            .position(|step| step.step_order == step_order)
            .ok_or_else(|| WorkflowError::NotFound(format!("step {}", step_order)))?;

        let step = &steps[index];
        if !step.status.is_pending() {
            return Err(WorkflowError::StepNotPending {
                step_order,
                status: step.status,
            });
        }

        authorize(step, actor, creator)?;

        if self.is_strict(kind) {
            if let Some(blocking) = steps
                .iter()
                .filter(|other| other.step_order < step_order && other.status.is_pending())
                .map(|other| other.step_order)
                .min()
            {
                return Err(WorkflowError::OutOfOrder {
                    step_order,
                    blocking_step: blocking,
                });
            }
        }

        let step = &mut steps[index];
        step.status = decision.resulting_status();
        step.acted_at = Some(now);
        step.acted_by = Some(actor.id.clone());
        step.notes = notes.filter(|n| !n.trim().is_empty());

        Ok(step.clone())
    }

    /// Derive the parent outcome from step states
    pub fn aggregate(steps: &[ApprovalStep]) -> StepAggregate {
        if steps.iter().any(|step| step.status == StepStatus::Rejected) {
            StepAggregate::Rejected
        } else if !steps.is_empty() && steps.iter().all(|step| step.status == StepStatus::Approved) {
            StepAggregate::AllApproved
        } else {
            StepAggregate::InFlight
        }
    }

    /// Force every pending step to `skipped`; returns the orders that changed
    pub fn skip_pending(steps: &mut [ApprovalStep], now: DateTime<Utc>) -> Vec<u32> {
        steps
            .iter_mut()
            .filter(|step| step.status.is_pending())
            .map(|step| {
                step.status = StepStatus::Skipped;
                step.acted_at = Some(now);
                step.step_order
            })
            .collect()
    }
}

/// The designated internal actor, the creator on auto-approvable steps, or a
/// holder of `can_approve_step`. External signatories are always recorded by
/// someone holding that capability.
pub fn authorize(step: &ApprovalStep, actor: &Actor, creator: &ActorId) -> Result<()> {
    let is_designated = step.actor.internal_id() == Some(&actor.id);
    let is_creator_override = step.auto_approve_by_creator && &actor.id == creator;

    if is_designated || is_creator_override || actor.can(CAN_APPROVE_STEP) {
        Ok(())
    } else {
        Err(WorkflowError::ActorNotAuthorized {
            actor: actor.id.to_string(),
            action: format!("act on step {} ({})", step.step_order, step.code),
        })
    }
}

fn validate_actor(code: &str, actor: &StepActor) -> Result<()> {
    let valid = match actor {
        StepActor::Internal { actor_id } => !actor_id.as_str().trim().is_empty(),
        StepActor::External { name, title } => !name.trim().is_empty() && !title.trim().is_empty(),
    };

    if valid {
        Ok(())
    } else {
        Err(WorkflowError::InvalidRequest(format!("step '{}' has an incomplete actor", code)))
    }
}
