//! The append-only evidence manifest.
//!
//! One JSON record per line, in append order. The manifest is the
//! authoritative history for a case and the source of dedup decisions:
//! `ingested` rows carry the content fingerprint so the index can be
//! rebuilt by replaying the file on open.
//!
//! Rows are never rewritten. A torn final line (power loss mid-append) is
//! dropped during replay with a warning; everything before it is intact.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use dossier_types::{Classification, ContentHash, EvidenceId, EvidenceKind, ManifestRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("manifest row failed to serialize: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One persisted manifest line: the event record plus the ingest details
/// needed to rebuild the dedupe index on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    #[serde(flatten)]
    pub record: ManifestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EvidenceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl ManifestRow {
    pub fn bare(record: ManifestRecord) -> Self {
        Self {
            record,
            content_hash: None,
            path: None,
            kind: None,
            size: None,
            classification: None,
        }
    }
}

/// The manifest file plus its in-memory replica. Single writer: the locker.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    file: File,
    rows: Vec<ManifestRow>,
}

impl Manifest {
    /// Opens (or creates) the manifest and replays existing rows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ManifestError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let mut rows = Vec::new();
        if path.exists() {
            let reader = File::open(&path).map_err(|source| ManifestError::Io {
                path: path.clone(),
                source,
            })?;
            for (number, line) in BufReader::new(reader).lines().enumerate() {
                let line = line.map_err(|source| ManifestError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ManifestRow>(&line) {
                    Ok(row) => rows.push(row),
                    Err(err) => {
                        // Only the final line can legitimately be torn.
                        warn!(line = number + 1, %err, "dropping unparseable manifest row");
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ManifestError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self { path, file, rows })
    }

    /// Appends one row, flushing to disk before it becomes visible.
    pub fn append(&mut self, row: ManifestRow) -> Result<(), ManifestError> {
        let line = serde_json::to_string(&row)?;
        writeln!(self.file, "{line}").map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file.flush().map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[ManifestRow] {
        &self.rows
    }

    pub fn events_for(&self, evidence_id: EvidenceId) -> Vec<&ManifestRow> {
        self.rows
            .iter()
            .filter(|row| row.record.evidence_id == evidence_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_types::{Address, ManifestEvent};

    fn row(event: ManifestEvent, id: EvidenceId) -> ManifestRow {
        ManifestRow::bare(ManifestRecord::now(id, event, Address::locker()))
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let id = EvidenceId::generate();

        {
            let mut manifest = Manifest::open(&path).unwrap();
            let mut ingested = row(ManifestEvent::Ingested, id);
            ingested.content_hash = Some(ContentHash::of(b"bytes"));
            ingested.kind = Some(EvidenceKind::Document);
            manifest.append(ingested).unwrap();
            manifest.append(row(ManifestEvent::Classified, id)).unwrap();
        }

        let manifest = Manifest::open(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.events_for(id).len(), 2);
        assert_eq!(
            manifest.rows()[0].content_hash,
            Some(ContentHash::of(b"bytes"))
        );
    }

    #[test]
    fn torn_final_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let id = EvidenceId::generate();

        {
            let mut manifest = Manifest::open(&path).unwrap();
            manifest.append(row(ManifestEvent::Ingested, id)).unwrap();
        }
        // Simulate a torn write.
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"evidence_id\":").unwrap();
        }

        let manifest = Manifest::open(&path).unwrap();
        assert_eq!(manifest.len(), 1);
    }
}
