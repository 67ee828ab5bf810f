//! # dossier-debrief: mission debrief
//!
//! The final stop of the pipeline: collects frozen section payloads as the
//! controller completes them, assembles the narrative document in execution
//! order, computes the bundle digest, signs it with the supplied Ed25519
//! key, and packages the disclosure bundle.
//!
//! Assembly is always available: before the full dependency graph has
//! completed it produces a partial document flagged as such, so a case that
//! hits a HIGH fault still yields everything produced up to that point.

mod assembly;
mod debrief;
mod signing;

pub use assembly::{NarrativeDocument, ReportAssembler, SectionEntry};
pub use debrief::{Debrief, DebriefError};
pub use signing::{
    BundleManifest, ReportBundle, SectionSummary, SigningError, sign_document, verify_bundle,
};
