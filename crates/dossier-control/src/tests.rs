//! Unit tests for the controller transition core.
//!
//! The core is pure, so every path of the state machine is testable without
//! the bus or any mocks.

use dossier_types::{
    Address, ContentHash, SectionId, SectionState, Severity, canonical_graph,
};
use proptest::prelude::*;
use test_case::test_case;

use crate::ledger::SectionLedger;
use crate::transition::{ControlCommand, ControlEffect, ControlError, apply};

// ============================================================================
// Test helpers
// ============================================================================

fn register(section_id: SectionId, depends_on: Vec<SectionId>, priority: u8) -> ControlCommand {
    ControlCommand::Register {
        section_id,
        depends_on,
        priority,
        max_reruns: 2,
    }
}

fn registered_chain() -> SectionLedger {
    let mut ledger = SectionLedger::new();
    for (section_id, depends_on, priority) in canonical_graph() {
        let (next, _) = apply(ledger, register(section_id, depends_on, priority))
            .expect("canonical registration");
        ledger = next;
    }
    ledger
}

fn payload_hash() -> ContentHash {
    ContentHash::of(b"published payload")
}

fn complete(section_id: SectionId) -> ControlCommand {
    ControlCommand::MarkComplete {
        section_id,
        payload_hash: payload_hash(),
        input_evidence: vec![],
        by: Address::gateway(),
    }
}

/// Drives a section through prepare → start → complete.
fn run_to_completion(mut ledger: SectionLedger, section_id: SectionId) -> SectionLedger {
    for command in [
        ControlCommand::Prepare { section_id },
        ControlCommand::Start { section_id },
        complete(section_id),
    ] {
        let (next, _) = apply(ledger, command).expect("legal transition");
        ledger = next;
    }
    ledger
}

fn state_of(ledger: &SectionLedger, id: SectionId) -> SectionState {
    ledger.get(id).expect("registered").state
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn registration_is_idempotent() {
    let ledger = registered_chain();
    let version = ledger.version();
    let (ledger, effects) = apply(ledger, register(SectionId::Toc, vec![SectionId::Cp], 2)).unwrap();
    assert!(effects.is_empty());
    assert_eq!(ledger.version(), version, "no-op must not bump the version");
}

#[test]
fn conflicting_registration_is_rejected() {
    let ledger = registered_chain();
    let err = apply(ledger, register(SectionId::Toc, vec![SectionId::S1], 2)).unwrap_err();
    assert_eq!(err, ControlError::ConflictingRegistration(SectionId::Toc));
    assert_eq!(
        err.fault_family(),
        dossier_types::FaultFamily::Validation
    );
}

#[test]
fn cycle_closing_registration_is_rejected() {
    let mut ledger = SectionLedger::new();
    let (next, _) = apply(ledger, register(SectionId::S1, vec![SectionId::S2], 1)).unwrap();
    ledger = next;
    let err = apply(ledger, register(SectionId::S2, vec![SectionId::S1], 2)).unwrap_err();
    assert_eq!(err, ControlError::DependencyCycle(SectionId::S2));
}

#[test]
fn self_dependency_is_rejected() {
    let err = apply(
        SectionLedger::new(),
        register(SectionId::S3, vec![SectionId::S3], 1),
    )
    .unwrap_err();
    assert_eq!(err, ControlError::DependencyCycle(SectionId::S3));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn cover_page_runs_to_completion() {
    let ledger = registered_chain();
    assert!(ledger.can_run(SectionId::Cp).unwrap());
    assert!(!ledger.can_run(SectionId::Toc).unwrap());

    let (ledger, _) =
        apply(ledger, ControlCommand::Prepare { section_id: SectionId::Cp }).unwrap();
    assert_eq!(state_of(&ledger, SectionId::Cp), SectionState::Preparing);

    let (ledger, _) = apply(ledger, ControlCommand::Start { section_id: SectionId::Cp }).unwrap();
    assert_eq!(state_of(&ledger, SectionId::Cp), SectionState::Executing);

    let (ledger, complete_effects) = apply(ledger, complete(SectionId::Cp)).unwrap();
    assert_eq!(state_of(&ledger, SectionId::Cp), SectionState::Completed);
    let frozen = ledger.get(SectionId::Cp).unwrap().frozen.as_ref().unwrap();
    assert_eq!(frozen.payload_hash, payload_hash());
    assert!(complete_effects
        .iter()
        .any(|e| matches!(e, ControlEffect::SectionComplete(f) if f.section_id == SectionId::Cp)));

    // Completion unblocks the next link of the chain.
    assert!(ledger.can_run(SectionId::Toc).unwrap());
}

#[test]
fn preparing_with_incomplete_dependency_is_forbidden() {
    let ledger = registered_chain();
    let err = apply(ledger, ControlCommand::Prepare { section_id: SectionId::S3 }).unwrap_err();
    assert_eq!(err, ControlError::DependenciesUnresolved(SectionId::S3));
    assert_eq!(err.fault_family(), dossier_types::FaultFamily::Forbidden);
}

#[test_case(SectionState::Idle; "from idle")]
#[test_case(SectionState::Completed; "from completed")]
fn start_requires_preparing(state: SectionState) {
    let mut ledger = registered_chain();
    if state == SectionState::Completed {
        ledger = run_to_completion(ledger, SectionId::Cp);
        let err = apply(ledger, ControlCommand::Start { section_id: SectionId::Cp }).unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { from: SectionState::Completed, .. }));
    } else {
        let err = apply(ledger, ControlCommand::Start { section_id: SectionId::Cp }).unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { from: SectionState::Idle, .. }));
    }
}

#[test]
fn illegal_transition_leaves_ledger_unchanged() {
    let ledger = registered_chain();
    let before = ledger.clone();
    let err = apply(ledger.clone(), complete(SectionId::Cp)).unwrap_err();
    assert!(matches!(err, ControlError::InvalidTransition { .. }));
    assert_eq!(ledger, before);
}

#[test]
fn unregistered_section_is_an_invalid_state() {
    let err = apply(
        SectionLedger::new(),
        ControlCommand::Prepare { section_id: SectionId::Fr },
    )
    .unwrap_err();
    assert_eq!(err, ControlError::Unregistered(SectionId::Fr));
    assert_eq!(err.fault_family(), dossier_types::FaultFamily::InvalidState);
}

// ============================================================================
// Revisions
// ============================================================================

#[test]
fn revision_reopens_a_completed_section() {
    let ledger = registered_chain();
    let ledger = run_to_completion(ledger, SectionId::Cp);

    let (ledger, _) = apply(
        ledger,
        ControlCommand::RequestRevision {
            section_id: SectionId::Cp,
            reason: "typo in header".into(),
            requester: Address::gateway(),
        },
    )
    .unwrap();
    assert_eq!(state_of(&ledger, SectionId::Cp), SectionState::RevisionRequested);
    assert_eq!(ledger.get(SectionId::Cp).unwrap().revision_depth, 1);
    assert!(ledger.can_run(SectionId::Cp).unwrap());

    // Prepare accepts the pending revision.
    let (ledger, effects) =
        apply(ledger, ControlCommand::Prepare { section_id: SectionId::Cp }).unwrap();
    assert!(effects
        .iter()
        .any(|e| matches!(e, ControlEffect::RevisionAccepted { section_id: SectionId::Cp, .. })));
    assert_eq!(state_of(&ledger, SectionId::Cp), SectionState::Preparing);
}

#[test]
fn revision_overflow_fails_the_section_and_blocks_downstream() {
    // Drive sections 1..=6 of the chain to completion.
    let mut ledger = registered_chain();
    for section_id in [
        SectionId::Cp,
        SectionId::Toc,
        SectionId::S1,
        SectionId::S2,
        SectionId::S3,
        SectionId::S4,
        SectionId::S5,
        SectionId::S6,
    ] {
        ledger = run_to_completion(ledger, section_id);
    }

    // Burn the rerun budget of section 6 (max_reruns = 2).
    for _ in 0..2 {
        let (next, _) = apply(
            ledger,
            ControlCommand::RequestRevision {
                section_id: SectionId::S6,
                reason: "billing conflict".into(),
                requester: Address::gateway(),
            },
        )
        .unwrap();
        let (next, _) = apply(next, ControlCommand::Prepare { section_id: SectionId::S6 }).unwrap();
        let (next, _) = apply(next, ControlCommand::Start { section_id: SectionId::S6 }).unwrap();
        let (next, _) = apply(next, complete(SectionId::S6)).unwrap();
        ledger = next;
    }
    assert_eq!(ledger.get(SectionId::S6).unwrap().revision_depth, 2);

    // The request past the budget fails the section with a HIGH 2-1-53.
    let (ledger, effects) = apply(
        ledger,
        ControlCommand::RequestRevision {
            section_id: SectionId::S6,
            reason: "billing conflict".into(),
            requester: Address::gateway(),
        },
    )
    .unwrap();
    assert_eq!(state_of(&ledger, SectionId::S6), SectionState::Failed);
    assert!(effects.iter().any(|e| matches!(
        e,
        ControlEffect::RaiseFault {
            family: dossier_types::FaultFamily::RevisionLimit,
            severity: Severity::High,
            ..
        }
    )));

    // Downstream sections stay blocked until administrative reopen.
    for blocked in [SectionId::S7, SectionId::S8, SectionId::Dp, SectionId::Fr] {
        assert!(!ledger.can_run(blocked).unwrap(), "{blocked} must stay blocked");
    }
    assert!(
        ledger
            .downstream_of(SectionId::S6)
            .contains(&SectionId::Fr)
    );
}

#[test]
fn revision_of_failed_section_is_illegal() {
    let ledger = registered_chain();
    let (ledger, _) = apply(
        ledger,
        ControlCommand::Fail {
            section_id: SectionId::Cp,
            reason: "execution budget exceeded".into(),
        },
    )
    .unwrap();
    let err = apply(
        ledger,
        ControlCommand::RequestRevision {
            section_id: SectionId::Cp,
            reason: "retry".into(),
            requester: Address::gateway(),
        },
    )
    .unwrap_err();
    assert!(matches!(err, ControlError::InvalidTransition { .. }));
}

#[test]
fn reopen_resets_a_failed_section() {
    let ledger = registered_chain();
    let (ledger, _) = apply(
        ledger,
        ControlCommand::Fail {
            section_id: SectionId::Cp,
            reason: "worker crash".into(),
        },
    )
    .unwrap();
    let (ledger, _) = apply(ledger, ControlCommand::Reopen { section_id: SectionId::Cp }).unwrap();
    let record = ledger.get(SectionId::Cp).unwrap();
    assert_eq!(record.state, SectionState::Idle);
    assert_eq!(record.revision_depth, 0);

    // Reopen is only legal from FAILED.
    let err = apply(ledger, ControlCommand::Reopen { section_id: SectionId::Cp }).unwrap_err();
    assert!(matches!(err, ControlError::InvalidTransition { .. }));
}

// ============================================================================
// Execution order
// ============================================================================

#[test]
fn canonical_chain_orders_in_report_order() {
    let ledger = registered_chain();
    assert_eq!(ledger.execution_order(), SectionId::all().to_vec());
}

#[test]
fn ties_break_by_priority_then_label() {
    let mut ledger = SectionLedger::new();
    // Three sections with no dependencies: priority decides, then label.
    for (id, priority) in [(SectionId::S8, 2), (SectionId::S2, 1), (SectionId::S1, 1)] {
        let (next, _) = apply(ledger, register(id, vec![], priority)).unwrap();
        ledger = next;
    }
    assert_eq!(
        ledger.execution_order(),
        vec![SectionId::S1, SectionId::S2, SectionId::S8]
    );
}

proptest! {
    /// Registration order never changes the schedule, and dependencies
    /// always precede their dependents.
    #[test]
    fn execution_order_is_a_stable_topological_sort(seed in any::<u64>()) {
        let mut entries: Vec<_> = canonical_graph().to_vec();
        // Deterministic shuffle from the seed.
        let len = entries.len();
        let mut state = seed;
        for i in (1..len).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state % (i as u64 + 1)) as usize;
            entries.swap(i, j);
        }

        let mut ledger = SectionLedger::new();
        for (section_id, depends_on, priority) in entries {
            let (next, _) = apply(ledger, register(section_id, depends_on, priority)).unwrap();
            ledger = next;
        }

        let order = ledger.execution_order();
        prop_assert_eq!(order.len(), 12);
        for (section_id, depends_on, _) in canonical_graph() {
            let pos = order.iter().position(|s| *s == section_id).unwrap();
            for dep in depends_on {
                let dep_pos = order.iter().position(|s| *s == dep).unwrap();
                prop_assert!(dep_pos < pos, "{} must precede {}", dep, section_id);
            }
        }
        prop_assert_eq!(order, SectionId::all().to_vec());
    }
}
