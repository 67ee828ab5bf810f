//! Report sections, their lifecycle states, and the canonical dependency graph.
//!
//! A report is assembled from twelve sections forming a fixed chain: cover
//! page, table of contents, body sections 1 through 8, disclosure page, and
//! final review. Section workers are opaque to the coordination core; the
//! types here carry only what the controller and gateway need.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::evidence::{ContentHash, EvidenceId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown section id {0:?}")]
pub struct UnknownSection(pub String);

// ============================================================================
// Section identity
// ============================================================================

/// Identifier of one of the twelve report sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SectionId {
    /// Cover page (`CP`).
    Cp,
    /// Table of contents (`TOC`).
    Toc,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    /// Disclosure page (`DP`).
    Dp,
    /// Final review (`FR`).
    Fr,
}

impl SectionId {
    /// All twelve sections in canonical report order.
    pub fn all() -> [SectionId; 12] {
        [
            Self::Cp,
            Self::Toc,
            Self::S1,
            Self::S2,
            Self::S3,
            Self::S4,
            Self::S5,
            Self::S6,
            Self::S7,
            Self::S8,
            Self::Dp,
            Self::Fr,
        ]
    }

    /// The wire/report label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cp => "CP",
            Self::Toc => "TOC",
            Self::S1 => "1",
            Self::S2 => "2",
            Self::S3 => "3",
            Self::S4 => "4",
            Self::S5 => "5",
            Self::S6 => "6",
            Self::S7 => "7",
            Self::S8 => "8",
            Self::Dp => "DP",
            Self::Fr => "FR",
        }
    }

    /// One-based position in report order; also the worker sub-address.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Cp => 1,
            Self::Toc => 2,
            Self::S1 => 3,
            Self::S2 => 4,
            Self::S3 => 5,
            Self::S4 => 6,
            Self::S5 => 7,
            Self::S6 => 8,
            Self::S7 => 9,
            Self::S8 => 10,
            Self::Dp => 11,
            Self::Fr => 12,
        }
    }
}

impl Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SectionId {
    type Err = UnknownSection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = match s {
            "CP" => Self::Cp,
            "TOC" => Self::Toc,
            "1" => Self::S1,
            "2" => Self::S2,
            "3" => Self::S3,
            "4" => Self::S4,
            "5" => Self::S5,
            "6" => Self::S6,
            "7" => Self::S7,
            "8" => Self::S8,
            "DP" => Self::Dp,
            "FR" => Self::Fr,
            other => return Err(UnknownSection(other.to_string())),
        };
        Ok(id)
    }
}

impl TryFrom<String> for SectionId {
    type Error = UnknownSection;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SectionId> for String {
    fn from(id: SectionId) -> Self {
        id.as_str().to_string()
    }
}

/// The canonical dependency graph: `(section, depends_on, priority)`.
///
/// Every section depends on exactly the one before it in report order; the
/// cover page has no dependency. Report type does not change this graph.
pub fn canonical_graph() -> [(SectionId, Vec<SectionId>, u8); 12] {
    let order = SectionId::all();
    std::array::from_fn(|i| {
        let depends_on = if i == 0 { vec![] } else { vec![order[i - 1]] };
        (order[i], depends_on, (i + 1) as u8)
    })
}

// ============================================================================
// Section lifecycle
// ============================================================================

/// Lifecycle state of a section.
///
/// Legal transitions: `Idle → Preparing → Executing → {Completed, Failed}`;
/// `Completed → RevisionRequested → Idle`; `Failed → Idle` only by
/// administrative reopen. Everything else is an invalid-state fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionState {
    Idle,
    Preparing,
    Executing,
    Completed,
    Failed,
    RevisionRequested,
}

impl Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Preparing => "PREPARING",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RevisionRequested => "REVISION_REQUESTED",
        };
        write!(f, "{s}")
    }
}

/// An immutable snapshot of a section's inputs and outputs taken at sign-off.
///
/// Content-addressed by the payload hash; superseding a frozen snapshot
/// requires a fresh `Completed` transition producing a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenSection {
    pub section_id: SectionId,
    /// SHA-256 over the canonical JSON of the published payload.
    pub payload_hash: ContentHash,
    /// Evidence the section had been delivered when it signed off.
    pub input_evidence: Vec<EvidenceId>,
    pub frozen_at: DateTime<Utc>,
    pub frozen_by: crate::address::Address,
}

/// The controller's record for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub section_id: SectionId,
    pub state: SectionState,
    pub depends_on: Vec<SectionId>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen: Option<FrozenSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<BTreeMap<String, Value>>,
    pub revision_depth: u32,
    pub max_reruns: u32,
    pub last_transition_at: DateTime<Utc>,
}

impl SectionRecord {
    /// A freshly registered section in `Idle`.
    pub fn new(section_id: SectionId, depends_on: Vec<SectionId>, priority: u8, max_reruns: u32) -> Self {
        Self {
            section_id,
            state: SectionState::Idle,
            depends_on,
            priority,
            frozen: None,
            payload: None,
            revision_depth: 0,
            max_reruns,
            last_transition_at: Utc::now(),
        }
    }
}

// ============================================================================
// Case identity
// ============================================================================

/// The report type for a case. Influences section configuration downstream
/// but never the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportType {
    Investigative,
    Surveillance,
    Hybrid,
}

impl Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Investigative => "Investigative",
            Self::Surveillance => "Surveillance",
            Self::Hybrid => "Hybrid",
        };
        write!(f, "{s}")
    }
}

/// Unique identifier for one investigative case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseId(Uuid);

impl CaseId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_graph_is_a_chain() {
        let graph = canonical_graph();
        assert_eq!(graph.len(), 12);
        assert!(graph[0].1.is_empty());
        for i in 1..12 {
            assert_eq!(graph[i].1, vec![graph[i - 1].0]);
            assert_eq!(graph[i].2, (i + 1) as u8);
        }
    }

    #[test]
    fn section_labels_roundtrip() {
        for id in SectionId::all() {
            assert_eq!(id.as_str().parse::<SectionId>().unwrap(), id);
        }
        assert!("9".parse::<SectionId>().is_err());
        assert!("cp".parse::<SectionId>().is_err());
    }

    #[test]
    fn ordinals_cover_one_through_twelve() {
        let ords: Vec<u8> = SectionId::all().iter().map(|s| s.ordinal()).collect();
        assert_eq!(ords, (1..=12).collect::<Vec<u8>>());
    }
}
