//! # dossier-locker: the evidence locker
//!
//! Single source of truth for evidence identity and history. The locker
//! owns evidence items and the manifest; every other component holds
//! read-only references and goes through the bus to mutate.
//!
//! ## Ingest pipeline
//!
//! 1. SHA-256 the content bytes.
//! 2. Dedupe by fingerprint: known bytes gain a custody entry and merged
//!    tags (`evidence.duplicate`); fresh bytes get a new id and a manifest
//!    row (`evidence.new`).
//! 3. Classification runs asynchronously, at most once per fingerprint,
//!    within a budget and bounded retries (`evidence.classified`).
//! 4. The item is indexed for routing (`evidence.indexed`).
//!
//! The manifest persists as an append-only JSON-lines file and replays on
//! open, rebuilding the dedupe index. Custody chains are append-only and
//! never pruned. A re-read hash mismatch quarantines the row with a
//! data-corruption fault; the system stays operable.

mod classifier;
mod locker;
mod manifest;
mod store;

pub use classifier::{Classifier, ClassifierError, ClassifierSettings, classify_with_retry};
pub use locker::{Locker, LockerError, LockerSettings};
pub use manifest::{Manifest, ManifestError, ManifestRow};
pub use store::{EvidenceStore, IngestMeta, IngestOutcome, StoreError, StoreSnapshot};
