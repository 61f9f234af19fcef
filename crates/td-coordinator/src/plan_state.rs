//! Plan Lifecycle (C8) state machine.
//!
//! Mirrors the order-lifecycle state machine elsewhere in this codebase:
//! [`PlanMachine::apply`] is the single entry point, illegal transitions
//! return a typed [`TransitionError`], and a supplied `event_id` is
//! deduplicated so replaying the same event log after a restart converges
//! to the same state instead of erroring or double-applying.
//!
//! This type only knows about the five states and their legal edges. The
//! preconditions gating `Approved -> Executing` (a Session Guardrail check
//! returning `can_execute`, or an override) live with the caller, the same
//! way the mirrored order state machine knows nothing about broker
//! connectivity.

use std::collections::HashSet;

use serde::Serialize;
use td_schemas::PlanStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlanEvent {
    MarkReadyForApproval,
    Approve,
    Reject,
    StartExecuting,
    MarkExecuted,
    MarkFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: PlanStatus,
    pub event: PlanEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal plan transition: {:?} + {:?}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

pub fn is_terminal(status: PlanStatus) -> bool {
    matches!(status, PlanStatus::Rejected | PlanStatus::Executed | PlanStatus::Failed)
}

/// Tracks one plan's lifecycle state plus the set of event ids already
/// applied to it, for idempotent replay.
#[derive(Debug, Clone)]
pub struct PlanMachine {
    pub plan_id: String,
    pub status: PlanStatus,
    applied: HashSet<String>,
}

impl PlanMachine {
    pub fn new(plan_id: impl Into<String>, status: PlanStatus) -> Self {
        PlanMachine { plan_id: plan_id.into(), status, applied: HashSet::new() }
    }

    pub fn apply(&mut self, event: &PlanEvent, event_id: Option<&str>) -> Result<(), TransitionError> {
        if let Some(id) = event_id {
            if self.applied.contains(id) {
                return Ok(());
            }
        }

        self.do_transition(event)?;

        if let Some(id) = event_id {
            self.applied.insert(id.to_string());
        }
        Ok(())
    }

    fn do_transition(&mut self, event: &PlanEvent) -> Result<(), TransitionError> {
        use PlanEvent::*;
        use PlanStatus::*;

        match (self.status, event) {
            (Draft, MarkReadyForApproval) => self.status = ReadyForApproval,
            (ReadyForApproval, Approve) => self.status = Approved,
            (ReadyForApproval, Reject) => self.status = Rejected,
            (Approved, Reject) => self.status = Rejected,
            (Approved, StartExecuting) => self.status = Executing,
            (Executing, MarkExecuted) => self.status = Executed,
            (Executing, MarkFailed) => self.status = Failed,
            (from, ev) => {
                return Err(TransitionError { from, event: ev.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_executed() {
        let mut m = PlanMachine::new("plan-1", PlanStatus::Draft);
        m.apply(&PlanEvent::MarkReadyForApproval, Some("e1")).unwrap();
        m.apply(&PlanEvent::Approve, Some("e2")).unwrap();
        m.apply(&PlanEvent::StartExecuting, Some("e3")).unwrap();
        m.apply(&PlanEvent::MarkExecuted, Some("e4")).unwrap();
        assert_eq!(m.status, PlanStatus::Executed);
        assert!(is_terminal(m.status));
    }

    #[test]
    fn rejected_from_ready_for_approval() {
        let mut m = PlanMachine::new("plan-1", PlanStatus::Draft);
        m.apply(&PlanEvent::MarkReadyForApproval, Some("e1")).unwrap();
        m.apply(&PlanEvent::Reject, Some("e2")).unwrap();
        assert_eq!(m.status, PlanStatus::Rejected);
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_unchanged() {
        let mut m = PlanMachine::new("plan-1", PlanStatus::Draft);
        let err = m.apply(&PlanEvent::Approve, Some("e1")).unwrap_err();
        assert_eq!(err.from, PlanStatus::Draft);
        assert_eq!(m.status, PlanStatus::Draft);
    }

    #[test]
    fn duplicate_event_id_is_a_silent_noop() {
        let mut m = PlanMachine::new("plan-1", PlanStatus::Draft);
        m.apply(&PlanEvent::MarkReadyForApproval, Some("e1")).unwrap();
        m.apply(&PlanEvent::MarkReadyForApproval, Some("e1")).unwrap();
        assert_eq!(m.status, PlanStatus::ReadyForApproval);

        // Same event_id replayed for a now-illegal event must still no-op,
        // not error, since the replay guard is checked before transition.
        let mut m2 = PlanMachine::new("plan-2", PlanStatus::Draft);
        m2.apply(&PlanEvent::Approve, Some("dup")).unwrap_err();
    }

    #[test]
    fn executing_can_fail() {
        let mut m = PlanMachine::new("plan-1", PlanStatus::Draft);
        m.apply(&PlanEvent::MarkReadyForApproval, Some("e1")).unwrap();
        m.apply(&PlanEvent::Approve, Some("e2")).unwrap();
        m.apply(&PlanEvent::StartExecuting, Some("e3")).unwrap();
        m.apply(&PlanEvent::MarkFailed, Some("e4")).unwrap();
        assert_eq!(m.status, PlanStatus::Failed);
    }
}
