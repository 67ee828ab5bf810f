//! The in-memory evidence store: dedupe index, items, custody chains.
//!
//! Uniqueness is keyed by content hash: the same bytes ingested twice
//! resolve to the same evidence id with merged tags and an appended custody
//! entry. Every mutation lands a manifest row before the in-memory state
//! changes, so a replayed store can never claim more than the file shows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use dossier_types::{
    Address, Classification, ContentHash, CustodyAction, CustodyEntry, EvidenceId, EvidenceItem,
    EvidenceKind, EvidenceStatus, ManifestEvent, ManifestRecord,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::manifest::{Manifest, ManifestError, ManifestRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Operation on an id the store has never issued (`1-1-51`).
    #[error("unknown evidence id {0}")]
    UnknownEvidence(EvidenceId),

    /// Operation on a quarantined row (`1-1-52`).
    #[error("evidence {0} is quarantined")]
    Quarantined(EvidenceId),
}

/// What the locker needs to know to ingest one item.
#[derive(Debug, Clone)]
pub struct IngestMeta {
    pub path: String,
    pub kind: EvidenceKind,
    pub captured_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    pub section_hints: BTreeSet<dossier_types::SectionId>,
    pub actor: Address,
}

/// Result of one ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub evidence_id: EvidenceId,
    pub content_hash: ContentHash,
    /// True when the bytes were already known; no new manifest `ingested`
    /// row was written.
    pub duplicate: bool,
}

/// A version-stamped read-only copy of the store, handed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u64,
    pub items: Vec<EvidenceItem>,
    pub manifest_rows: usize,
}

/// The locker's owned state. Single writer; readers get snapshot copies.
#[derive(Debug)]
pub struct EvidenceStore {
    manifest: Manifest,
    by_hash: HashMap<ContentHash, EvidenceId>,
    items: BTreeMap<EvidenceId, EvidenceItem>,
    /// Bumped on every accepted mutation; stamps every snapshot.
    version: u64,
}

impl EvidenceStore {
    /// Opens the store, replaying the manifest to rebuild the dedupe index
    /// and item skeletons.
    pub fn open(manifest_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manifest = Manifest::open(manifest_path)?;
        let mut by_hash = HashMap::new();
        let mut items: BTreeMap<EvidenceId, EvidenceItem> = BTreeMap::new();

        for row in manifest.rows() {
            let id = row.record.evidence_id;
            match row.record.event {
                ManifestEvent::Ingested => {
                    let Some(content_hash) = row.content_hash else {
                        continue;
                    };
                    by_hash.insert(content_hash, id);
                    items.insert(
                        id,
                        EvidenceItem {
                            evidence_id: id,
                            content_hash,
                            kind: row.kind.unwrap_or(EvidenceKind::Document),
                            path: row.path.clone().unwrap_or_default(),
                            size: row.size.unwrap_or_default(),
                            captured_at: None,
                            ingested_at: row.record.timestamp,
                            classification: None,
                            tags: BTreeSet::new(),
                            section_hints: BTreeSet::new(),
                            status: EvidenceStatus::Ingested,
                            custody_chain: vec![CustodyEntry {
                                actor_address: row.record.actor_address.clone(),
                                action: CustodyAction::Ingested,
                                timestamp: row.record.timestamp,
                                note: None,
                            }],
                        },
                    );
                }
                ManifestEvent::Classified | ManifestEvent::Reclassified => {
                    if let Some(item) = items.get_mut(&id) {
                        item.classification = row.classification.clone();
                        if item.status == EvidenceStatus::Ingested {
                            item.status = EvidenceStatus::Classified;
                        }
                    }
                }
                ManifestEvent::Indexed => {
                    if let Some(item) = items.get_mut(&id) {
                        item.status = EvidenceStatus::Indexed;
                    }
                }
                ManifestEvent::Dispatched => {
                    if let Some(item) = items.get_mut(&id) {
                        item.status = EvidenceStatus::Dispatched;
                    }
                }
                ManifestEvent::Processed => {
                    if let Some(item) = items.get_mut(&id) {
                        item.status = EvidenceStatus::Processed;
                    }
                }
                ManifestEvent::Quarantined => {
                    if let Some(item) = items.get_mut(&id) {
                        item.status = EvidenceStatus::Quarantined;
                    }
                }
                ManifestEvent::Duplicate => {}
            }
        }

        if !items.is_empty() {
            info!(items = items.len(), "evidence store replayed from manifest");
        }
        let version = manifest.len() as u64;
        Ok(Self {
            manifest,
            by_hash,
            items,
            version,
        })
    }

    /// Ingests bytes: dedupes by fingerprint, appends manifest and custody
    /// records.
    pub fn ingest(&mut self, meta: IngestMeta, bytes: &[u8]) -> Result<IngestOutcome, StoreError> {
        let content_hash = ContentHash::of(bytes);

        if let Some(&evidence_id) = self.by_hash.get(&content_hash) {
            // Known bytes: no new manifest `ingested` row, no new id.
            self.manifest.append(ManifestRow::bare(ManifestRecord::now(
                evidence_id,
                ManifestEvent::Duplicate,
                meta.actor.clone(),
            )))?;
            let item = self
                .items
                .get_mut(&evidence_id)
                .expect("index and items stay in sync");
            item.tags.extend(meta.tags);
            item.section_hints.extend(meta.section_hints);
            item.custody_chain.push(
                CustodyEntry::now(meta.actor, CustodyAction::DuplicateIngest)
                    .with_note(meta.path.clone()),
            );
            self.version += 1;
            return Ok(IngestOutcome {
                evidence_id,
                content_hash,
                duplicate: true,
            });
        }

        let evidence_id = EvidenceId::generate();
        let mut row = ManifestRow::bare(ManifestRecord::now(
            evidence_id,
            ManifestEvent::Ingested,
            meta.actor.clone(),
        ));
        row.content_hash = Some(content_hash);
        row.path = Some(meta.path.clone());
        row.kind = Some(meta.kind);
        row.size = Some(bytes.len() as u64);
        self.manifest.append(row)?;

        self.by_hash.insert(content_hash, evidence_id);
        self.items.insert(
            evidence_id,
            EvidenceItem {
                evidence_id,
                content_hash,
                kind: meta.kind,
                path: meta.path,
                size: bytes.len() as u64,
                captured_at: meta.captured_at,
                ingested_at: Utc::now(),
                classification: None,
                tags: meta.tags,
                section_hints: meta.section_hints,
                status: EvidenceStatus::Ingested,
                custody_chain: vec![CustodyEntry::now(meta.actor, CustodyAction::Ingested)],
            },
        );
        self.version += 1;
        Ok(IngestOutcome {
            evidence_id,
            content_hash,
            duplicate: false,
        })
    }

    /// Whether classification still needs to run for this item.
    pub fn needs_classification(&self, id: EvidenceId) -> bool {
        self.items
            .get(&id)
            .is_some_and(|item| item.classification.is_none())
    }

    /// Records a classification outcome. Returns `false` when the item was
    /// already classified and this was not an explicit reclassify — the
    /// at-most-once-per-fingerprint rule.
    pub fn record_classified(
        &mut self,
        id: EvidenceId,
        classification: Classification,
        reclassify: bool,
    ) -> Result<bool, StoreError> {
        let item = self.items.get(&id).ok_or(StoreError::UnknownEvidence(id))?;
        if item.status == EvidenceStatus::Quarantined {
            return Err(StoreError::Quarantined(id));
        }
        if item.classification.is_some() && !reclassify {
            return Ok(false);
        }
        let event = if reclassify && item.classification.is_some() {
            ManifestEvent::Reclassified
        } else {
            ManifestEvent::Classified
        };
        let mut row = ManifestRow::bare(ManifestRecord::now(id, event, Address::locker()));
        row.classification = Some(classification.clone());
        self.manifest.append(row)?;

        let item = self.items.get_mut(&id).expect("checked above");
        item.classification = Some(classification);
        if item.status == EvidenceStatus::Ingested {
            item.status = EvidenceStatus::Classified;
        }
        if reclassify {
            item.custody_chain
                .push(CustodyEntry::now(Address::locker(), CustodyAction::Reclassified));
        }
        self.version += 1;
        Ok(true)
    }

    /// Marks the item routed into the per-section sets.
    pub fn record_indexed(&mut self, id: EvidenceId) -> Result<(), StoreError> {
        self.transition_status(id, ManifestEvent::Indexed, EvidenceStatus::Indexed)
    }

    /// Marks the item delivered to at least one section.
    pub fn record_dispatched(&mut self, id: EvidenceId) -> Result<(), StoreError> {
        self.transition_status(id, ManifestEvent::Dispatched, EvidenceStatus::Dispatched)
    }

    /// Marks the item fully processed by its sections.
    pub fn record_processed(&mut self, id: EvidenceId) -> Result<(), StoreError> {
        self.transition_status(id, ManifestEvent::Processed, EvidenceStatus::Processed)
    }

    /// Pulls a row from circulation after a re-read hash mismatch.
    pub fn quarantine(&mut self, id: EvidenceId, note: impl Into<String>) -> Result<(), StoreError> {
        if !self.items.contains_key(&id) {
            return Err(StoreError::UnknownEvidence(id));
        }
        self.manifest.append(ManifestRow::bare(ManifestRecord::now(
            id,
            ManifestEvent::Quarantined,
            Address::locker(),
        )))?;
        let item = self.items.get_mut(&id).expect("checked above");
        item.status = EvidenceStatus::Quarantined;
        item.custody_chain.push(
            CustodyEntry::now(Address::locker(), CustodyAction::Quarantined).with_note(note),
        );
        self.version += 1;
        Ok(())
    }

    /// Appends a custody entry (checkout, return) to the chain.
    pub fn append_custody(&mut self, id: EvidenceId, entry: CustodyEntry) -> Result<(), StoreError> {
        let item = self.items.get_mut(&id).ok_or(StoreError::UnknownEvidence(id))?;
        item.custody_chain.push(entry);
        self.version += 1;
        Ok(())
    }

    pub fn item(&self, id: EvidenceId) -> Option<&EvidenceItem> {
        self.items.get(&id)
    }

    /// Current mutation version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// A version-stamped read-only copy of the whole store.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: self.version,
            items: self.items.values().cloned().collect(),
            manifest_rows: self.manifest.len(),
        }
    }

    pub fn find_by_hash(&self, hash: ContentHash) -> Option<&EvidenceItem> {
        self.by_hash.get(&hash).and_then(|id| self.items.get(id))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Serializes the item and its custody chain for disclosure review.
    pub fn custody_export(&self, id: EvidenceId) -> Result<serde_json::Value, StoreError> {
        let item = self.items.get(&id).ok_or(StoreError::UnknownEvidence(id))?;
        let events: Vec<_> = self.manifest.events_for(id);
        Ok(serde_json::json!({
            "evidence": item,
            "manifest_events": events,
        }))
    }

    fn transition_status(
        &mut self,
        id: EvidenceId,
        event: ManifestEvent,
        status: EvidenceStatus,
    ) -> Result<(), StoreError> {
        let item = self.items.get(&id).ok_or(StoreError::UnknownEvidence(id))?;
        if item.status == EvidenceStatus::Quarantined {
            return Err(StoreError::Quarantined(id));
        }
        self.manifest.append(ManifestRow::bare(ManifestRecord::now(
            id,
            event,
            Address::locker(),
        )))?;
        self.items.get_mut(&id).expect("checked above").status = status;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> IngestMeta {
        IngestMeta {
            path: path.to_string(),
            kind: EvidenceKind::Document,
            captured_at: None,
            tags: BTreeSet::from(["field-notes".to_string()]),
            section_hints: BTreeSet::new(),
            actor: Address::locker(),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> EvidenceStore {
        EvidenceStore::open(dir.path().join("manifest.jsonl")).unwrap()
    }

    #[test]
    fn fresh_ingest_writes_one_ingested_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let outcome = store.ingest(meta("notes.pdf"), &[0u8; 1024]).unwrap();
        assert!(!outcome.duplicate);

        let events = store.manifest().events_for(outcome.evidence_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.event, ManifestEvent::Ingested);
        assert_eq!(events[0].size, Some(1024));
    }

    #[test]
    fn duplicate_ingest_reuses_id_and_merges_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let first = store.ingest(meta("notes.pdf"), b"same bytes").unwrap();

        let mut second_meta = meta("copy-of-notes.pdf");
        second_meta.tags = BTreeSet::from(["billing".to_string()]);
        let second = store.ingest(second_meta, b"same bytes").unwrap();

        assert!(second.duplicate);
        assert_eq!(second.evidence_id, first.evidence_id);

        let item = store.item(first.evidence_id).unwrap();
        assert!(item.tags.contains("field-notes"));
        assert!(item.tags.contains("billing"));
        assert_eq!(item.custody_chain.len(), 2);

        // Exactly one `ingested` event, one `duplicate`.
        let events = store.manifest().events_for(first.evidence_id);
        let ingested = events
            .iter()
            .filter(|r| r.record.event == ManifestEvent::Ingested)
            .count();
        let duplicates = events
            .iter()
            .filter(|r| r.record.event == ManifestEvent::Duplicate)
            .count();
        assert_eq!((ingested, duplicates), (1, 1));
    }

    #[test]
    fn evidence_id_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let mut store = open_store(&dir);
            store.ingest(meta("a.txt"), b"replayed bytes").unwrap()
        };

        let mut store = open_store(&dir);
        let second = store.ingest(meta("b.txt"), b"replayed bytes").unwrap();
        assert!(second.duplicate);
        assert_eq!(second.evidence_id, first.evidence_id);
    }

    #[test]
    fn classification_runs_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let outcome = store.ingest(meta("a.txt"), b"bytes").unwrap();

        assert!(store.needs_classification(outcome.evidence_id));
        assert!(store
            .record_classified(outcome.evidence_id, Classification::new("ledger"), false)
            .unwrap());
        // Second non-explicit attempt is a no-op.
        assert!(!store
            .record_classified(outcome.evidence_id, Classification::new("other"), false)
            .unwrap());
        assert_eq!(
            store.item(outcome.evidence_id).unwrap().classification,
            Some(Classification::new("ledger"))
        );

        // Explicit reclassify is the only path to overwrite.
        assert!(store
            .record_classified(outcome.evidence_id, Classification::new("invoice"), true)
            .unwrap());
        assert_eq!(
            store.item(outcome.evidence_id).unwrap().classification,
            Some(Classification::new("invoice"))
        );
    }

    #[test]
    fn classification_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = open_store(&dir);
            let outcome = store.ingest(meta("a.txt"), b"bytes").unwrap();
            store
                .record_classified(outcome.evidence_id, Classification::new("ledger"), false)
                .unwrap();
            outcome.evidence_id
        };

        let store = open_store(&dir);
        assert!(!store.needs_classification(id));
        assert_eq!(
            store.item(id).unwrap().classification,
            Some(Classification::new("ledger"))
        );
    }

    #[test]
    fn quarantined_rows_refuse_further_processing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let outcome = store.ingest(meta("a.txt"), b"bytes").unwrap();
        store.quarantine(outcome.evidence_id, "hash mismatch on re-read").unwrap();

        assert!(matches!(
            store.record_indexed(outcome.evidence_id),
            Err(StoreError::Quarantined(_))
        ));
        let item = store.item(outcome.evidence_id).unwrap();
        assert_eq!(item.status, EvidenceStatus::Quarantined);
        assert!(item
            .custody_chain
            .iter()
            .any(|entry| entry.action == CustodyAction::Quarantined));
    }

    #[test]
    fn snapshot_is_version_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        assert_eq!(store.version(), 0);

        let outcome = store.ingest(meta("a.txt"), b"bytes").unwrap();
        let after_ingest = store.version();
        assert!(after_ingest > 0);

        store
            .record_classified(outcome.evidence_id, Classification::new("ledger"), false)
            .unwrap();
        assert!(store.version() > after_ingest);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.version, store.version());
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.manifest_rows, 2);

        // The copy is detached: further mutations do not touch it.
        store.quarantine(outcome.evidence_id, "tamper check").unwrap();
        assert_eq!(snapshot.items[0].status, EvidenceStatus::Classified);
        assert!(store.version() > snapshot.version);
    }

    #[test]
    fn custody_export_includes_chain_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let outcome = store.ingest(meta("a.txt"), b"bytes").unwrap();
        let export = store.custody_export(outcome.evidence_id).unwrap();
        assert!(export["evidence"]["custody_chain"].is_array());
        assert_eq!(export["manifest_events"].as_array().unwrap().len(), 1);
    }
}
