//! The classification→section routing table.
//!
//! Supplied externally as configuration; the core never infers routes. A
//! rule fires when every present match-field matches the evidence; the
//! routing set for an item is the union over all firing rules.

use std::collections::BTreeSet;

use dossier_types::{EvidenceKind, SectionId};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing rule {index}: unknown evidence kind {kind:?}")]
    UnknownKind { index: usize, kind: String },

    #[error("routing rule {index}: unknown section {section:?}")]
    UnknownSection { index: usize, section: String },

    #[error("routing rule {index}: no target sections")]
    EmptyTargets { index: usize },
}

/// One compiled routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub kind: Option<EvidenceKind>,
    pub classification: Option<String>,
    pub tag: Option<String>,
    pub sections: BTreeSet<SectionId>,
}

impl RoutingRule {
    fn matches(&self, kind: EvidenceKind, classification: Option<&str>, tags: &BTreeSet<String>) -> bool {
        if self.kind.is_some_and(|k| k != kind) {
            return false;
        }
        if let Some(wanted) = &self.classification {
            if classification != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// The compiled table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    /// Compiles the configuration-supplied rules, validating kinds and
    /// section labels. An empty table routes nothing and is flagged loudly.
    pub fn from_config(rules: &[dossier_config::RoutingRule]) -> Result<Self, RoutingError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let kind = match &rule.kind {
                Some(raw) => Some(
                    serde_json::from_value::<EvidenceKind>(serde_json::json!(raw)).map_err(
                        |_| RoutingError::UnknownKind {
                            index,
                            kind: raw.clone(),
                        },
                    )?,
                ),
                None => None,
            };
            if rule.sections.is_empty() {
                return Err(RoutingError::EmptyTargets { index });
            }
            let sections = rule
                .sections
                .iter()
                .map(|label| {
                    label
                        .parse::<SectionId>()
                        .map_err(|_| RoutingError::UnknownSection {
                            index,
                            section: label.clone(),
                        })
                })
                .collect::<Result<BTreeSet<_>, _>>()?;
            compiled.push(RoutingRule {
                kind,
                classification: rule.classification.clone(),
                tag: rule.tag.clone(),
                sections,
            });
        }
        if compiled.is_empty() {
            warn!("routing table is empty; no evidence will reach any section");
        }
        Ok(Self { rules: compiled })
    }

    /// The set of sections that should see this evidence.
    pub fn routes_for(
        &self,
        kind: EvidenceKind,
        classification: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> BTreeSet<SectionId> {
        let mut targets = BTreeSet::new();
        for rule in &self.rules {
            if rule.matches(kind, classification, tags) {
                targets.extend(rule.sections.iter().copied());
            }
        }
        targets
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_rule(
        kind: Option<&str>,
        classification: Option<&str>,
        tag: Option<&str>,
        sections: &[&str],
    ) -> dossier_config::RoutingRule {
        dossier_config::RoutingRule {
            kind: kind.map(str::to_string),
            classification: classification.map(str::to_string),
            tag: tag.map(str::to_string),
            sections: sections.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn union_over_firing_rules() {
        let table = RoutingTable::from_config(&[
            config_rule(Some("image"), None, None, &["3", "8"]),
            config_rule(None, Some("surveillance-photo"), None, &["1"]),
            config_rule(None, None, Some("billing"), &["6"]),
        ])
        .unwrap();

        let tags = BTreeSet::from(["billing".to_string()]);
        let routes = table.routes_for(EvidenceKind::Image, Some("surveillance-photo"), &tags);
        let labels: Vec<&str> = routes.iter().map(|s| s.as_str()).collect();
        assert_eq!(labels, vec!["1", "3", "6", "8"]);
    }

    #[test]
    fn absent_fields_match_anything() {
        let table =
            RoutingTable::from_config(&[config_rule(None, None, None, &["FR"])]).unwrap();
        let routes = table.routes_for(EvidenceKind::Audio, None, &BTreeSet::new());
        assert_eq!(routes, BTreeSet::from([SectionId::Fr]));
    }

    #[test]
    fn non_matching_evidence_routes_nowhere() {
        let table = RoutingTable::from_config(&[config_rule(
            Some("video"),
            None,
            None,
            &["5"],
        )])
        .unwrap();
        assert!(
            table
                .routes_for(EvidenceKind::Text, None, &BTreeSet::new())
                .is_empty()
        );
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(matches!(
            RoutingTable::from_config(&[config_rule(Some("hologram"), None, None, &["1"])]),
            Err(RoutingError::UnknownKind { .. })
        ));
        assert!(matches!(
            RoutingTable::from_config(&[config_rule(None, None, None, &["99"])]),
            Err(RoutingError::UnknownSection { .. })
        ));
        assert!(matches!(
            RoutingTable::from_config(&[config_rule(None, None, None, &[])]),
            Err(RoutingError::EmptyTargets { .. })
        ));
    }
}
