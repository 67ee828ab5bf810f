//! Per-section input envelopes.

use chrono::{DateTime, Utc};
use dossier_types::{EvidenceId, SectionId};
use serde::{Deserialize, Serialize};

/// Everything a section worker needs to start executing: the evidence ids
/// delivered to it so far. Bytes are checked out separately through the
/// marshall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEnvelope {
    pub section_id: SectionId,
    /// Delivered evidence in delivery order.
    pub evidence: Vec<EvidenceId>,
    /// How many times this section has been prepared (1 on first run).
    pub run: u32,
    pub composed_at: DateTime<Utc>,
}

impl InputEnvelope {
    pub fn new(section_id: SectionId, evidence: Vec<EvidenceId>, run: u32) -> Self {
        Self {
            section_id,
            evidence,
            run,
            composed_at: Utc::now(),
        }
    }
}
