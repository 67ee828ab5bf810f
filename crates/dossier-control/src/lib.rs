//! # dossier-control: the ecosystem controller
//!
//! The controller owns section lifecycle: it decides what may run, what must
//! wait, and what must re-run. It is the single writer of section records;
//! every other component observes version-stamped snapshots.
//!
//! ## Key principles
//!
//! - **Pure transition core**: [`apply`] takes the ledger and a command and
//!   returns the new ledger plus effects. No IO, no clocks beyond the
//!   transition timestamp, no signal emission — the actor shell executes
//!   effects.
//! - **Legal transitions only**: `IDLE → PREPARING → EXECUTING →
//!   {COMPLETED, FAILED}`, `COMPLETED → REVISION_REQUESTED → IDLE`, and the
//!   administrative `FAILED → IDLE` reopen. Anything else is an
//!   invalid-state fault and leaves the ledger unchanged.
//! - **Bounded revisions**: `revision_depth` may grow to `max_reruns`;
//!   the request that would exceed it fails the section instead and raises
//!   a HIGH `2-1-53`.
//!
//! The controller listens at address `2-1` and publishes lifecycle events on
//! `2-1.events`.

mod controller;
mod ledger;
mod transition;

#[cfg(test)]
mod tests;

pub use controller::{Controller, ControllerSettings};
pub use ledger::{LedgerSnapshot, SectionLedger};
pub use transition::{ControlCommand, ControlEffect, ControlError, apply};
