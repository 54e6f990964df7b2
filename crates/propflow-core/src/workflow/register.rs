//! Status register: valid statuses and legal transitions per request kind
//!
//! The table is the only place status sets live. Forms, exports and the engine
//! all ask the register instead of keeping their own lists.

use crate::error::{Result, WorkflowError};
use once_cell::sync::Lazy;
use propflow_types::{RequestKind, Status};
use std::collections::{BTreeMap, BTreeSet};

use Status::*;

type EdgeTable = &'static [(Status, &'static [Status])];

const TRANSFER_EDGES: EdgeTable = &[
    (Upcoming, &[InProgress, Overdue, Completed]),
    (InProgress, &[Overdue, Completed]),
    (Overdue, &[Completed]),
    (Completed, &[]),
];

const TURNOVER_DISPOSAL_EDGES: EdgeTable = &[
    (PendingReview, &[Approved, Rejected, Cancelled, Completed]),
    (Approved, &[Completed, Cancelled]),
    (Rejected, &[]),
    (Cancelled, &[]),
    (Completed, &[]),
];

const OFF_CAMPUS_LOAN_EDGES: EdgeTable = &[
    (PendingReview, &[PendingReturn, Cancelled]),
    (PendingReturn, &[Returned, ReturnedLate, StillOut, Overdue, Lost, Transferred, Cancelled]),
    (StillOut, &[Returned, ReturnedLate, Overdue, Lost, Transferred]),
    (Overdue, &[ReturnedLate, StillOut, Lost, Replaced, Transferred]),
    (Returned, &[]),
    (ReturnedLate, &[]),
    (Transferred, &[]),
    (Lost, &[]),
    (Replaced, &[]),
    (Cancelled, &[]),
];

const VERIFICATION_FORM_EDGES: EdgeTable = &[
    (PendingReview, &[Approved, Rejected, Cancelled]),
    (Approved, &[]),
    (Rejected, &[]),
    (Cancelled, &[]),
];

static REGISTER: Lazy<StatusRegister> = Lazy::new(StatusRegister::builtin);

/// Status rules for one request kind
#[derive(Debug, Clone)]
pub struct KindRules {
    initial: Status,
    transitions: BTreeMap<Status, BTreeSet<Status>>,
    success: Option<Status>,
    rejection: Option<Status>,
    cancellation: Option<Status>,
}

impl KindRules {
    fn from_table(
        initial: Status,
        edges: EdgeTable,
        success: Option<Status>,
        rejection: Option<Status>,
        cancellation: Option<Status>,
    ) -> Self {
        let transitions = edges
            .iter()
            .map(|(from, targets)| (*from, targets.iter().copied().collect()))
            .collect();

        Self { initial, transitions, success, rejection, cancellation }
    }

    pub fn initial(&self) -> Status {
        self.initial
    }

    pub fn statuses(&self) -> impl Iterator<Item = Status> + '_ {
        self.transitions.keys().copied()
    }

    pub fn targets(&self, from: Status) -> impl Iterator<Item = Status> + '_ {
        self.transitions.get(&from).into_iter().flatten().copied()
    }
}

/// Single source of truth for status sets and the transition graph
#[derive(Debug, Clone)]
pub struct StatusRegister {
    turnover_disposal: KindRules,
    transfer: KindRules,
    off_campus_loan: KindRules,
    verification_form: KindRules,
}

impl StatusRegister {
    /// The process wide register, built on first use
    pub fn global() -> &'static StatusRegister {
        &REGISTER
    }

    fn builtin() -> Self {
        Self {
            turnover_disposal: KindRules::from_table(
                PendingReview,
                TURNOVER_DISPOSAL_EDGES,
                Some(Completed),
                Some(Rejected),
                Some(Cancelled),
            ),
            transfer: KindRules::from_table(Upcoming, TRANSFER_EDGES, None, None, None),
            off_campus_loan: KindRules::from_table(
                PendingReview,
                OFF_CAMPUS_LOAN_EDGES,
                Some(PendingReturn),
                Some(Cancelled),
                Some(Cancelled),
            ),
            verification_form: KindRules::from_table(
                PendingReview,
                VERIFICATION_FORM_EDGES,
                Some(Approved),
                Some(Rejected),
                Some(Cancelled),
            ),
        }
    }

    pub fn rules(&self, kind: RequestKind) -> &KindRules {
        match kind {
            RequestKind::TurnoverDisposal => &self.turnover_disposal,
            RequestKind::Transfer => &self.transfer,
            RequestKind::OffCampusLoan => &self.off_campus_loan,
            RequestKind::VerificationForm => &self.verification_form,
        }
    }

    pub fn parse_kind(&self, code: &str) -> Result<RequestKind> {
        code.parse::<RequestKind>()
            .map_err(|_| WorkflowError::InvalidKind(code.to_string()))
    }

    /// Parse a status code and check it belongs to `kind`
    pub fn parse_status(&self, kind: RequestKind, code: &str) -> Result<Status> {
        let status = code.parse::<Status>().map_err(|_| WorkflowError::InvalidStatus {
            kind: kind.as_str().to_string(),
            status: code.to_string(),
        })?;
        self.ensure_valid(kind, status)?;
        Ok(status)
    }

    pub fn valid_statuses(&self, kind: RequestKind) -> BTreeSet<Status> {
        self.rules(kind).statuses().collect()
    }

    pub fn is_valid(&self, kind: RequestKind, status: Status) -> bool {
        self.rules(kind).transitions.contains_key(&status)
    }

    pub fn ensure_valid(&self, kind: RequestKind, status: Status) -> Result<()> {
        if self.is_valid(kind, status) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidStatus {
                kind: kind.as_str().to_string(),
                status: status.as_str().to_string(),
            })
        }
    }

    pub fn initial_status(&self, kind: RequestKind) -> Status {
        self.rules(kind).initial
    }

    pub fn is_legal_transition(&self, kind: RequestKind, from: Status, to: Status) -> bool {
        self.rules(kind)
            .transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// A valid status with no outgoing edges
    pub fn is_terminal(&self, kind: RequestKind, status: Status) -> bool {
        self.rules(kind)
            .transitions
            .get(&status)
            .map(|targets| targets.is_empty())
            .unwrap_or(false)
    }

    pub fn terminal_statuses(&self, kind: RequestKind) -> BTreeSet<Status> {
        self.rules(kind)
            .statuses()
            .filter(|status| self.is_terminal(kind, *status))
            .collect()
    }

    /// Status the record takes once every approval step is approved
    pub fn success_status(&self, kind: RequestKind) -> Option<Status> {
        self.rules(kind).success
    }

    /// Status the record takes once any approval step is rejected
    pub fn rejection_status(&self, kind: RequestKind) -> Option<Status> {
        self.rules(kind).rejection
    }

    pub fn cancellation_status(&self, kind: RequestKind) -> Option<Status> {
        self.rules(kind).cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> &'static StatusRegister {
        StatusRegister::global()
    }

    #[test]
    fn test_transfer_status_set() {
        let statuses = register().valid_statuses(RequestKind::Transfer);
        let expected: BTreeSet<Status> = [Upcoming, InProgress, Overdue, Completed].into_iter().collect();
        assert_eq!(statuses, expected);
        assert_eq!(register().initial_status(RequestKind::Transfer), Upcoming);
    }

    #[test]
    fn test_turnover_and_off_campus_status_sets() {
        assert_eq!(register().valid_statuses(RequestKind::TurnoverDisposal).len(), 5);
        let loan = register().valid_statuses(RequestKind::OffCampusLoan);
        assert_eq!(loan.len(), 10);
        assert!(loan.contains(&StillOut));
        assert!(!loan.contains(&Completed));
    }

    #[test]
    fn test_every_table_entry_is_internally_consistent() {
        for kind in RequestKind::ALL {
            let rules = register().rules(kind);
            assert!(register().is_valid(kind, rules.initial()), "{kind} initial status");
            for status in rules.statuses() {
                for target in rules.targets(status) {
                    assert!(register().is_valid(kind, target), "{kind}: {status} -> {target}");
                }
            }
            for status in [register().success_status(kind), register().rejection_status(kind)]
                .into_iter()
                .flatten()
            {
                assert!(register().is_valid(kind, status));
                assert!(register().is_legal_transition(kind, rules.initial(), status));
            }
        }
    }

    #[test]
    fn test_named_terminal_statuses_have_no_outgoing_edges() {
        for kind in RequestKind::ALL {
            for status in [Completed, Cancelled, Rejected, Returned, Lost, Replaced] {
                if register().is_valid(kind, status) {
                    assert!(register().is_terminal(kind, status), "{kind}: {status}");
                    for target in Status::ALL {
                        assert!(!register().is_legal_transition(kind, status, target));
                    }
                }
            }
        }
    }

    #[test]
    fn test_statuses_of_other_kinds_are_never_legal() {
        assert!(!register().is_legal_transition(RequestKind::Transfer, Upcoming, Approved));
        assert!(!register().is_legal_transition(RequestKind::Transfer, PendingReview, InProgress));
        assert!(!register().is_terminal(RequestKind::Transfer, Lost));
    }

    #[test]
    fn test_parse_status_checks_membership() {
        assert_eq!(register().parse_status(RequestKind::OffCampusLoan, "still_out").unwrap(), StillOut);

        let error = register().parse_status(RequestKind::Transfer, "approved").unwrap_err();
        assert_eq!(error.code(), "invalid_status");

        let error = register().parse_status(RequestKind::Transfer, "teleported").unwrap_err();
        assert_eq!(error.code(), "invalid_status");
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(register().parse_kind("transfer").unwrap(), RequestKind::Transfer);
        assert_eq!(
            register().parse_kind("vehicle_request").unwrap_err(),
            WorkflowError::InvalidKind("vehicle_request".to_string())
        );
    }

    #[test]
    fn test_transfer_has_no_cancellation_or_step_outcomes() {
        assert!(register().cancellation_status(RequestKind::Transfer).is_none());
        assert!(register().success_status(RequestKind::Transfer).is_none());
        assert_eq!(register().success_status(RequestKind::TurnoverDisposal), Some(Completed));
        assert_eq!(register().rejection_status(RequestKind::OffCampusLoan), Some(Cancelled));
    }
}
