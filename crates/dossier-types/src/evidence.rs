//! Evidence identity, custody, and manifest records.
//!
//! Evidence uniqueness is keyed by [`ContentHash`], the SHA-256 of the raw
//! bytes. The same bytes ingested twice always resolve to the same
//! [`EvidenceId`]; the manifest is the append-only history that makes the
//! dedup decision auditable.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::address::Address;
use crate::section::SectionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid content hash {0:?}")]
pub struct InvalidContentHash(pub String);

// ============================================================================
// Content hash
// ============================================================================

/// SHA-256 fingerprint of evidence bytes, rendered as lower-hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn parse(hex: &str) -> Result<Self, InvalidContentHash> {
        if hex.len() != 64 {
            return Err(InvalidContentHash(hex.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| InvalidContentHash(hex.to_string()))?;
            out[i] = u8::from_str_radix(s, 16).map_err(|_| InvalidContentHash(hex.to_string()))?;
        }
        Ok(Self(out))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ContentHash {
    type Err = InvalidContentHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidContentHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

// ============================================================================
// Evidence identity
// ============================================================================

/// Unique identifier for an evidence item. Stable across duplicate ingests
/// of the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvidenceId(Uuid);

impl EvidenceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broad media kind of an evidence item, known at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Document,
    Image,
    Audio,
    Video,
    Text,
}

impl Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
        };
        write!(f, "{s}")
    }
}

/// Where an item sits in the ingest pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStatus {
    Ingested,
    Classified,
    Indexed,
    Dispatched,
    Processed,
    /// Pulled from circulation after a re-read hash mismatch.
    Quarantined,
}

/// Classifier output. The classifier is an external service; its label is
/// opaque to the core and only matched against routing rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Classification(String);

impl Classification {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// The sentinel used when classification attempts are exhausted.
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == "unknown"
    }
}

impl Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Custody
// ============================================================================

/// What an actor did with a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodyAction {
    Ingested,
    DuplicateIngest,
    Checkout,
    Returned,
    Quarantined,
    Reclassified,
}

/// One append-only custody chain entry. Never pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyEntry {
    pub actor_address: Address,
    pub action: CustodyAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CustodyEntry {
    pub fn now(actor_address: Address, action: CustodyAction) -> Self {
        Self {
            actor_address,
            action,
            timestamp: Utc::now(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ============================================================================
// Evidence item
// ============================================================================

/// One evidence item as held by the locker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: EvidenceId,
    pub content_hash: ContentHash,
    pub kind: EvidenceKind,
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub tags: BTreeSet<String>,
    pub section_hints: BTreeSet<SectionId>,
    pub status: EvidenceStatus,
    pub custody_chain: Vec<CustodyEntry>,
}

// ============================================================================
// Manifest
// ============================================================================

/// Event kinds recorded in the evidence manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestEvent {
    Ingested,
    Duplicate,
    Classified,
    Indexed,
    Dispatched,
    Processed,
    Quarantined,
    Reclassified,
}

impl Display for ManifestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ingested => "ingested",
            Self::Duplicate => "duplicate",
            Self::Classified => "classified",
            Self::Indexed => "indexed",
            Self::Dispatched => "dispatched",
            Self::Processed => "processed",
            Self::Quarantined => "quarantined",
            Self::Reclassified => "reclassified",
        };
        write!(f, "{s}")
    }
}

/// One row of the append-only evidence manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub evidence_id: EvidenceId,
    pub event: ManifestEvent,
    pub timestamp: DateTime<Utc>,
    pub actor_address: Address,
}

impl ManifestRecord {
    pub fn now(evidence_id: EvidenceId, event: ManifestEvent, actor_address: Address) -> Self {
        Self {
            evidence_id,
            event,
            timestamp: Utc::now(),
            actor_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = ContentHash::of(b"surveillance footage 2026-03-14");
        let b = ContentHash::of(b"surveillance footage 2026-03-14");
        assert_eq!(a, b);
        assert_ne!(a, ContentHash::of(b"surveillance footage 2026-03-15"));
    }

    #[test]
    fn hash_hex_form_is_64_chars() {
        let hash = ContentHash::of(&[0u8; 1024]);
        let hex = hash.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::parse(&hex).unwrap(), hash);
    }

    #[test]
    fn rejects_short_or_invalid_hex() {
        assert!(ContentHash::parse("abcd").is_err());
        assert!(ContentHash::parse(&"zz".repeat(32)).is_err());
    }

    proptest! {
        #[test]
        fn hash_roundtrips_serde(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let hash = ContentHash::of(&bytes);
            let json = serde_json::to_string(&hash).unwrap();
            let back: ContentHash = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, hash);
        }
    }
}
