//! The pure transition core.
//!
//! [`apply`] consumes the ledger and one command, producing the new ledger
//! and the effects the actor shell must execute (event emission, fault
//! reporting). On error the caller keeps its previous ledger: state is
//! never half-updated.

use chrono::Utc;
use dossier_types::{
    Address, ContentHash, EvidenceId, FrozenSection, SectionId, SectionState, Severity,
};
use thiserror::Error;

use crate::ledger::SectionLedger;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Operation on a section nobody registered (`2-1-51`).
    #[error("section {0} is not registered")]
    Unregistered(SectionId),

    /// Re-registration with a different dependency set (`2-1-31`).
    #[error("section {0} already registered with different dependencies")]
    ConflictingRegistration(SectionId),

    /// Registration would close a dependency cycle (`2-1-31`).
    #[error("registering {0} would close a dependency cycle")]
    DependencyCycle(SectionId),

    /// Transition not on the legal state graph (`2-1-51`).
    #[error("section {section}: illegal transition {from} -> {attempted}")]
    InvalidTransition {
        section: SectionId,
        from: SectionState,
        attempted: SectionState,
    },

    /// EXECUTING entered while a dependency is incomplete (`2-1-52`).
    #[error("section {0} has unresolved dependencies")]
    DependenciesUnresolved(SectionId),
}

impl ControlError {
    /// The fault family this error surfaces as.
    pub fn fault_family(&self) -> dossier_types::FaultFamily {
        use dossier_types::FaultFamily;
        match self {
            Self::Unregistered(_) | Self::InvalidTransition { .. } => FaultFamily::InvalidState,
            Self::ConflictingRegistration(_) | Self::DependencyCycle(_) => FaultFamily::Validation,
            Self::DependenciesUnresolved(_) => FaultFamily::Forbidden,
        }
    }
}

/// Commands accepted by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Idempotent registration. Conflicting re-registration is rejected.
    Register {
        section_id: SectionId,
        depends_on: Vec<SectionId>,
        priority: u8,
        max_reruns: u32,
    },
    /// `IDLE → PREPARING` (or accepts a pending revision first).
    Prepare { section_id: SectionId },
    /// `PREPARING → EXECUTING`. Re-checks dependencies.
    Start { section_id: SectionId },
    /// `EXECUTING → COMPLETED`; freezes the payload snapshot.
    MarkComplete {
        section_id: SectionId,
        payload_hash: ContentHash,
        input_evidence: Vec<EvidenceId>,
        by: Address,
    },
    /// Any non-terminal state `→ FAILED`.
    Fail { section_id: SectionId, reason: String },
    /// `→ REVISION_REQUESTED` while under the rerun bound; `→ FAILED` past it.
    RequestRevision {
        section_id: SectionId,
        reason: String,
        requester: Address,
    },
    /// Administrative `FAILED → IDLE`; resets the revision depth.
    Reopen { section_id: SectionId },
}

/// Effects for the actor shell to execute after a successful transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEffect {
    /// Publish a state-change event on the controller's event stream.
    StateChanged {
        section_id: SectionId,
        from: SectionState,
        to: SectionState,
    },
    /// Publish `gateway.section.complete` with the frozen snapshot.
    SectionComplete(FrozenSection),
    /// A revision was accepted; the gateway re-opens the section's inputs.
    RevisionAccepted {
        section_id: SectionId,
        reason: String,
    },
    /// Raise a fault against the controller's address.
    RaiseFault {
        family: dossier_types::FaultFamily,
        severity: Severity,
        context: String,
    },
}

/// Applies one command, producing the next ledger and effects.
pub fn apply(
    mut ledger: SectionLedger,
    command: ControlCommand,
) -> Result<(SectionLedger, Vec<ControlEffect>), ControlError> {
    let mut effects = Vec::new();

    match command {
        ControlCommand::Register {
            section_id,
            depends_on,
            priority,
            max_reruns,
        } => {
            if let Some(existing) = ledger.get(section_id) {
                if existing.depends_on == depends_on && existing.priority == priority {
                    // Idempotent no-op.
                    return Ok((ledger, effects));
                }
                return Err(ControlError::ConflictingRegistration(section_id));
            }
            if depends_on.contains(&section_id) || ledger.would_cycle(section_id, &depends_on) {
                return Err(ControlError::DependencyCycle(section_id));
            }
            ledger.insert(dossier_types::SectionRecord::new(
                section_id, depends_on, priority, max_reruns,
            ));
            ledger.bump_version();
        }

        ControlCommand::Prepare { section_id } => {
            // A pending revision is accepted on prepare: the section first
            // re-enters IDLE, then moves on.
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            let from = record.state;
            match from {
                SectionState::Idle | SectionState::RevisionRequested => {}
                _ => {
                    return Err(ControlError::InvalidTransition {
                        section: section_id,
                        from,
                        attempted: SectionState::Preparing,
                    });
                }
            }
            if !ledger.dependencies_completed(record) {
                return Err(ControlError::DependenciesUnresolved(section_id));
            }
            if from == SectionState::RevisionRequested {
                effects.push(ControlEffect::RevisionAccepted {
                    section_id,
                    reason: String::new(),
                });
            }
            transition(&mut ledger, section_id, SectionState::Preparing, &mut effects);
        }

        ControlCommand::Start { section_id } => {
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            if record.state != SectionState::Preparing {
                return Err(ControlError::InvalidTransition {
                    section: section_id,
                    from: record.state,
                    attempted: SectionState::Executing,
                });
            }
            if !ledger.dependencies_completed(record) {
                return Err(ControlError::DependenciesUnresolved(section_id));
            }
            transition(&mut ledger, section_id, SectionState::Executing, &mut effects);
        }

        ControlCommand::MarkComplete {
            section_id,
            payload_hash,
            input_evidence,
            by,
        } => {
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            if record.state != SectionState::Executing {
                return Err(ControlError::InvalidTransition {
                    section: section_id,
                    from: record.state,
                    attempted: SectionState::Completed,
                });
            }
            let frozen = FrozenSection {
                section_id,
                payload_hash,
                input_evidence,
                frozen_at: Utc::now(),
                frozen_by: by,
            };
            transition(&mut ledger, section_id, SectionState::Completed, &mut effects);
            let record = ledger
                .get_mut(section_id)
                .expect("section present after transition");
            record.frozen = Some(frozen.clone());
            effects.push(ControlEffect::SectionComplete(frozen));
        }

        ControlCommand::Fail { section_id, reason } => {
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            match record.state {
                SectionState::Completed | SectionState::Failed => {
                    return Err(ControlError::InvalidTransition {
                        section: section_id,
                        from: record.state,
                        attempted: SectionState::Failed,
                    });
                }
                _ => {}
            }
            transition(&mut ledger, section_id, SectionState::Failed, &mut effects);
            effects.push(ControlEffect::RaiseFault {
                family: dossier_types::FaultFamily::BusinessRule,
                severity: Severity::High,
                context: format!("section {section_id} failed: {reason}"),
            });
        }

        ControlCommand::RequestRevision {
            section_id,
            reason,
            requester,
        } => {
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            if record.state == SectionState::Failed {
                return Err(ControlError::InvalidTransition {
                    section: section_id,
                    from: record.state,
                    attempted: SectionState::RevisionRequested,
                });
            }
            let max_reruns = record.max_reruns;
            if record.revision_depth >= max_reruns {
                // The rerun budget is spent: fatal for the section, not the
                // case.
                transition(&mut ledger, section_id, SectionState::Failed, &mut effects);
                effects.push(ControlEffect::RaiseFault {
                    family: dossier_types::FaultFamily::RevisionLimit,
                    severity: Severity::High,
                    context: format!(
                        "section {section_id} exceeded max_reruns ({max_reruns}) on revision from {requester}: {reason}"
                    ),
                });
            } else {
                let depth = record.revision_depth + 1;
                transition(
                    &mut ledger,
                    section_id,
                    SectionState::RevisionRequested,
                    &mut effects,
                );
                let record = ledger
                    .get_mut(section_id)
                    .expect("section present after transition");
                record.revision_depth = depth;
            }
        }

        ControlCommand::Reopen { section_id } => {
            let record = ledger.get(section_id).ok_or(ControlError::Unregistered(section_id))?;
            if record.state != SectionState::Failed {
                return Err(ControlError::InvalidTransition {
                    section: section_id,
                    from: record.state,
                    attempted: SectionState::Idle,
                });
            }
            transition(&mut ledger, section_id, SectionState::Idle, &mut effects);
            let record = ledger
                .get_mut(section_id)
                .expect("section present after transition");
            record.revision_depth = 0;
        }
    }

    Ok((ledger, effects))
}

/// Records the state change, stamps the transition, bumps the ledger
/// version, and queues the event effect.
fn transition(
    ledger: &mut SectionLedger,
    section_id: SectionId,
    to: SectionState,
    effects: &mut Vec<ControlEffect>,
) {
    let record = ledger.get_mut(section_id).expect("caller validated presence");
    let from = record.state;
    record.state = to;
    record.last_transition_at = Utc::now();
    ledger.bump_version();
    effects.push(ControlEffect::StateChanged {
        section_id,
        from,
        to,
    });
}
