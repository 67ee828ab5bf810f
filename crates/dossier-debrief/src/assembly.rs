//! Narrative assembly over frozen section payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dossier_types::{ContentHash, Payload, ReportType, SectionId};
use serde::{Deserialize, Serialize};

/// One completed section as collected from the gateway's completion stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub section_id: SectionId,
    /// Content address of the frozen payload.
    pub payload_hash: ContentHash,
    pub payload: Payload,
    pub frozen_at: DateTime<Utc>,
}

/// The assembled narrative: sections in report order, watermarked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeDocument {
    pub case_name: String,
    pub report_type: ReportType,
    pub watermark: String,
    pub assembled_at: DateTime<Utc>,
    /// False when sections are still missing (partial assembly after a
    /// fault).
    pub complete: bool,
    pub sections: Vec<SectionEntry>,
}

impl NarrativeDocument {
    /// Canonical bytes of the document; the signing input.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Collects completions and assembles documents. Owned by the debrief task.
#[derive(Debug)]
pub struct ReportAssembler {
    case_name: String,
    report_type: ReportType,
    collected: BTreeMap<SectionId, SectionEntry>,
}

impl ReportAssembler {
    pub fn new(case_name: impl Into<String>, report_type: ReportType) -> Self {
        Self {
            case_name: case_name.into(),
            report_type,
            collected: BTreeMap::new(),
        }
    }

    /// Records a completion. A re-completed section (revision) supersedes
    /// its previous snapshot.
    pub fn record(&mut self, entry: SectionEntry) {
        self.collected.insert(entry.section_id, entry);
    }

    /// Whether every section of the canonical graph has a snapshot.
    pub fn is_complete(&self) -> bool {
        self.collected.len() == SectionId::all().len()
    }

    pub fn collected_count(&self) -> usize {
        self.collected.len()
    }

    /// The sections collected so far, in report order.
    pub fn collected_sections(&self) -> Vec<SectionId> {
        SectionId::all()
            .into_iter()
            .filter(|id| self.collected.contains_key(id))
            .collect()
    }

    /// Assembles the document from whatever has completed so far, in
    /// report order.
    pub fn assemble(&self) -> NarrativeDocument {
        let sections: Vec<SectionEntry> = SectionId::all()
            .into_iter()
            .filter_map(|id| self.collected.get(&id).cloned())
            .collect();
        NarrativeDocument {
            case_name: self.case_name.clone(),
            report_type: self.report_type,
            watermark: format!("DISCLOSURE CONTROLLED — {}", self.case_name),
            assembled_at: Utc::now(),
            complete: self.is_complete(),
            sections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(section_id: SectionId) -> SectionEntry {
        let mut payload = Payload::new();
        payload.insert("body".into(), json!(format!("section {section_id}")));
        SectionEntry {
            section_id,
            payload_hash: ContentHash::of(section_id.as_str().as_bytes()),
            payload,
            frozen_at: Utc::now(),
        }
    }

    #[test]
    fn assembles_in_report_order_regardless_of_arrival() {
        let mut assembler = ReportAssembler::new("case-0042", ReportType::Investigative);
        for id in [SectionId::Fr, SectionId::Cp, SectionId::S4, SectionId::Toc] {
            assembler.record(entry(id));
        }
        let document = assembler.assemble();
        let order: Vec<&str> = document.sections.iter().map(|s| s.section_id.as_str()).collect();
        assert_eq!(order, vec!["CP", "TOC", "4", "FR"]);
        assert!(!document.complete);
    }

    #[test]
    fn full_graph_yields_a_complete_document() {
        let mut assembler = ReportAssembler::new("case-0042", ReportType::Hybrid);
        for id in SectionId::all() {
            assembler.record(entry(id));
        }
        assert!(assembler.is_complete());
        let document = assembler.assemble();
        assert!(document.complete);
        assert_eq!(document.sections.len(), 12);
        assert!(document.watermark.contains("case-0042"));
    }

    #[test]
    fn revision_supersedes_previous_snapshot() {
        let mut assembler = ReportAssembler::new("case-0042", ReportType::Surveillance);
        assembler.record(entry(SectionId::S1));
        let mut revised = entry(SectionId::S1);
        revised.payload_hash = ContentHash::of(b"revised");
        assembler.record(revised.clone());

        assert_eq!(assembler.collected_count(), 1);
        let document = assembler.assemble();
        assert_eq!(document.sections[0].payload_hash, revised.payload_hash);
    }
}
