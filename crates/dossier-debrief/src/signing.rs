//! Bundle digesting, signing, and verification.
//!
//! The finished report is packaged as an opaque blob (the canonical JSON of
//! the narrative document) plus a manifest carrying the SHA-256 digest and
//! an Ed25519 signature over it. Key lifecycle is out of scope: the signing
//! key is supplied by the caller.

use chrono::{DateTime, Utc};
use dossier_types::{ContentHash, ReportType, SectionId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembly::NarrativeDocument;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("bundle digest does not match the blob")]
    DigestMismatch,

    #[error("bundle signature is invalid")]
    BadSignature,

    #[error("bundle carries a malformed verifying key or signature")]
    MalformedKeyMaterial,
}

/// Summary row for one section in the bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub section_id: SectionId,
    pub payload_hash: ContentHash,
}

/// The disclosure-facing description of a packaged report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub case_name: String,
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
    pub complete: bool,
    pub sections: Vec<SectionSummary>,
    /// SHA-256 over the blob bytes.
    pub digest: ContentHash,
}

/// A signed, packaged report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBundle {
    pub manifest: BundleManifest,
    /// The canonical narrative document bytes. Opaque to consumers.
    pub blob: Vec<u8>,
    /// Ed25519 signature over the digest bytes.
    pub signature: Vec<u8>,
    /// The signer's public key.
    pub verifying_key: Vec<u8>,
}

/// Digests, signs, and packages an assembled document.
pub fn sign_document(document: &NarrativeDocument, key: &SigningKey) -> ReportBundle {
    let blob = document.canonical_bytes();
    let digest = ContentHash::of(&blob);
    let signature = key.sign(digest.as_bytes());
    ReportBundle {
        manifest: BundleManifest {
            case_name: document.case_name.clone(),
            report_type: document.report_type,
            generated_at: document.assembled_at,
            complete: document.complete,
            sections: document
                .sections
                .iter()
                .map(|s| SectionSummary {
                    section_id: s.section_id,
                    payload_hash: s.payload_hash,
                })
                .collect(),
            digest,
        },
        blob,
        signature: signature.to_bytes().to_vec(),
        verifying_key: key.verifying_key().to_bytes().to_vec(),
    }
}

/// Verifies a bundle end to end: digest against blob, signature against
/// digest.
pub fn verify_bundle(bundle: &ReportBundle) -> Result<(), SigningError> {
    let digest = ContentHash::of(&bundle.blob);
    if digest != bundle.manifest.digest {
        return Err(SigningError::DigestMismatch);
    }

    let key_bytes: [u8; 32] = bundle
        .verifying_key
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::MalformedKeyMaterial)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SigningError::MalformedKeyMaterial)?;
    let signature_bytes: [u8; 64] = bundle
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::MalformedKeyMaterial)?;
    let signature = Signature::from_bytes(&signature_bytes);

    verifying_key
        .verify(digest.as_bytes(), &signature)
        .map_err(|_| SigningError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::ReportAssembler;
    use rand::rngs::OsRng;

    fn signed_bundle() -> ReportBundle {
        let assembler = ReportAssembler::new("case-0042", ReportType::Investigative);
        let document = assembler.assemble();
        let key = SigningKey::generate(&mut OsRng);
        sign_document(&document, &key)
    }

    #[test]
    fn roundtrip_verifies() {
        let bundle = signed_bundle();
        assert_eq!(verify_bundle(&bundle), Ok(()));
    }

    #[test]
    fn tampered_blob_is_detected() {
        let mut bundle = signed_bundle();
        bundle.blob.push(b'!');
        assert_eq!(verify_bundle(&bundle), Err(SigningError::DigestMismatch));
    }

    #[test]
    fn recomputed_digest_with_foreign_signature_is_rejected() {
        let mut bundle = signed_bundle();
        bundle.blob.push(b'!');
        bundle.manifest.digest = ContentHash::of(&bundle.blob);
        assert_eq!(verify_bundle(&bundle), Err(SigningError::BadSignature));
    }

    #[test]
    fn truncated_key_material_is_rejected() {
        let mut bundle = signed_bundle();
        bundle.verifying_key.pop();
        assert_eq!(
            verify_bundle(&bundle),
            Err(SigningError::MalformedKeyMaterial)
        );
    }
}
