//! # Dossier
//!
//! A section-aware evidence processing and report orchestration platform
//! for investigative case work. Heterogeneous evidence is ingested, hashed,
//! classified, routed to a fixed pipeline of report sections, and assembled
//! into a signed, disclosure-compliant final artifact.
//!
//! This crate is the facade: it owns the [`CaseContext`], wires every
//! subsystem onto one bus, hosts the section worker pool, and exposes the
//! operations an operator drives a case with:
//!
//! ```ignore
//! let runtime = CaseRuntime::start(config, classifier, signing_key).await?;
//! runtime.ingest("evidence/photo-01.jpg", EvidenceKind::Image, &["field"]).await?;
//! let bundle = runtime.generate_report().await?;
//! verify_bundle(&bundle)?;
//! ```
//!
//! ## Architecture
//!
//! Seven addressable subsystems share one bus; components communicate
//! exclusively through it:
//!
//! | Addr | Component |
//! |-------|-----------|
//! | `Bus-1` | Signal bus |
//! | `1-1` | Evidence locker |
//! | `2-1` | Ecosystem controller |
//! | `2-2` | Gateway |
//! | `3-1` | Mission debrief |
//! | `4-1`…`4-12` | Section workers |
//! | `5-2` | Evidence marshall |
//! | `Diag` | Diagnostic supervisor |
//!
//! There is no ambient global state: the runtime threads one root context
//! into every component at construction.

mod case;
mod runtime;
mod section;

pub use case::{CaseContext, CaseFailure};
pub use runtime::{CaseRuntime, IngestReceipt, RuntimeError};
pub use section::{DefaultSectionProcessor, SectionKind, SectionProcessor, SectionWorkers};

pub use dossier_config::{ConfigLoader, DossierConfig};
pub use dossier_debrief::{ReportBundle, verify_bundle};
pub use dossier_locker::{Classifier, ClassifierError};
pub use dossier_types as types;
