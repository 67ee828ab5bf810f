//! # dossier-types: Core types for the Dossier platform
//!
//! This crate contains shared types used across the Dossier system:
//! - Bus addressing ([`Address`], [`AddressError`])
//! - Signal envelope ([`Signal`], [`SignalId`], [`Payload`])
//! - Radio vocabulary ([`RadioCode`], [`DeliveryClass`])
//! - Fault taxonomy ([`FaultCode`], [`FaultFamily`], [`FaultRecord`], [`Severity`])
//! - Evidence identity ([`EvidenceId`], [`ContentHash`], [`EvidenceItem`],
//!   [`CustodyEntry`], [`ManifestRecord`])
//! - Report sections ([`SectionId`], [`SectionState`], [`SectionRecord`],
//!   [`FrozenSection`])
//! - Case identity ([`CaseId`], [`ReportType`])
//!
//! Every persisted or wire-visible type derives `Serialize`/`Deserialize`;
//! identifiers are cheap newtypes with `Display` and `FromStr`.

pub mod address;
pub mod evidence;
pub mod fault;
pub mod radio;
pub mod section;
pub mod signal;

pub use address::{Address, AddressError};
pub use evidence::{
    Classification, ContentHash, CustodyAction, CustodyEntry, EvidenceId, EvidenceItem,
    EvidenceKind, EvidenceStatus, ManifestEvent, ManifestRecord,
};
pub use fault::{FaultCode, FaultFamily, FaultId, FaultRecord, FaultState, Severity};
pub use radio::{DeliveryClass, RadioCode};
pub use section::{
    CaseId, FrozenSection, ReportType, SectionId, SectionRecord, SectionState, canonical_graph,
};
pub use signal::{Payload, Signal, SignalError, SignalId};
