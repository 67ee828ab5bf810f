//! Hierarchical bus addressing.
//!
//! Addresses take the form `X`, `X-Y`, or `X-Y.Z`: a top-level system, an
//! optional subsystem, and an optional component. Segments are alphanumeric.
//! The hierarchy is lexically parseable, so a subscriber may register for an
//! exact address or for a prefix that covers a whole subtree:
//!
//! ```
//! use dossier_types::Address;
//!
//! let complete = Address::parse("2-2.complete").unwrap();
//! assert!(complete.matches_prefix(&Address::parse("2-2").unwrap()));
//! assert!(!complete.matches_prefix(&Address::parse("2-1").unwrap()));
//! ```
//!
//! `Bus-1` is reserved for the bus itself.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::section::SectionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("address segment is empty in {0:?}")]
    EmptySegment(String),

    #[error("address segment contains non-alphanumeric character in {0:?}")]
    InvalidCharacter(String),

    #[error("address has too many levels: {0:?}")]
    TooDeep(String),
}

/// A hierarchical identifier for a bus participant.
///
/// Stored in its string form; the segment structure is validated at
/// construction so downstream code can split on `-` and `.` without
/// re-checking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and validates an address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        // Split `X-Y.Z` into at most three segments. The component separator
        // `.` is only legal after the subsystem separator `-`.
        let (system, rest) = match raw.split_once('-') {
            Some((sys, rest)) => (sys, Some(rest)),
            None => (raw, None),
        };

        let mut segments = vec![system];
        if let Some(rest) = rest {
            match rest.split_once('.') {
                Some((subsystem, component)) => {
                    segments.push(subsystem);
                    segments.push(component);
                    if component.contains(['-', '.']) {
                        return Err(AddressError::TooDeep(raw.to_string()));
                    }
                    if subsystem.contains('-') {
                        return Err(AddressError::TooDeep(raw.to_string()));
                    }
                }
                None => {
                    segments.push(rest);
                    if rest.contains('-') {
                        return Err(AddressError::TooDeep(raw.to_string()));
                    }
                }
            }
        }

        for segment in &segments {
            if segment.is_empty() {
                return Err(AddressError::EmptySegment(raw.to_string()));
            }
            if !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(AddressError::InvalidCharacter(raw.to_string()));
            }
        }

        Ok(Self(raw.to_string()))
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` equals `prefix` or sits below it in the hierarchy.
    ///
    /// A prefix only matches at segment boundaries: `2-2.complete` is under
    /// `2-2`, but `2-21` is not.
    pub fn matches_prefix(&self, prefix: &Address) -> bool {
        if self.0 == prefix.0 {
            return true;
        }
        match self.0.strip_prefix(prefix.0.as_str()) {
            Some(rest) => rest.starts_with('-') || rest.starts_with('.'),
            None => false,
        }
    }

    /// The bus's own reserved address, `Bus-1`.
    pub fn bus() -> Self {
        Self("Bus-1".to_string())
    }

    /// The evidence locker, `1-1`.
    pub fn locker() -> Self {
        Self("1-1".to_string())
    }

    /// The ecosystem controller, `2-1`.
    pub fn controller() -> Self {
        Self("2-1".to_string())
    }

    /// The gateway, `2-2`.
    pub fn gateway() -> Self {
        Self("2-2".to_string())
    }

    /// Mission debrief, `3-1`.
    pub fn debrief() -> Self {
        Self("3-1".to_string())
    }

    /// The evidence marshall, `5-2`.
    pub fn marshall() -> Self {
        Self("5-2".to_string())
    }

    /// The diagnostic supervisor, `Diag`.
    pub fn diagnostics() -> Self {
        Self("Diag".to_string())
    }

    /// The worker address for a report section, `4-1` through `4-12`.
    pub fn section(id: SectionId) -> Self {
        Self(format!("4-{}", id.ordinal()))
    }

    /// A component-level sub-address of `self`, e.g. `2-2` + `complete`
    /// yields `2-2.complete`. Used for published event streams.
    pub fn component(&self, name: &str) -> Result<Self, AddressError> {
        Self::parse(&format!("{}.{name}", self.0))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_all_three_levels() {
        for raw in ["1", "2-1", "2-2.complete", "Bus-1", "Diag", "4-12"] {
            assert!(Address::parse(raw).is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn rejects_malformed() {
        for raw in ["", "-1", "2-", "2-1.", "2.1", "2-1.1.2", "2-1-3", "a b"] {
            assert!(Address::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn prefix_matches_at_segment_boundaries() {
        let a = Address::parse("2-2.complete").unwrap();
        assert!(a.matches_prefix(&Address::parse("2-2").unwrap()));
        assert!(a.matches_prefix(&Address::parse("2").unwrap()));
        assert!(a.matches_prefix(&a));

        let sibling = Address::parse("2-21").unwrap();
        assert!(!sibling.matches_prefix(&Address::parse("2-2").unwrap()));
    }

    #[test]
    fn section_addresses_are_distinct() {
        let mut seen = std::collections::BTreeSet::new();
        for id in SectionId::all() {
            assert!(seen.insert(Address::section(id)));
        }
        assert_eq!(seen.len(), 12);
    }

    proptest! {
        #[test]
        fn roundtrips_through_string(sys in "[a-zA-Z0-9]{1,4}", sub in "[0-9]{1,3}", comp in "[a-z]{1,8}") {
            let raw = format!("{sys}-{sub}.{comp}");
            let addr = Address::parse(&raw).unwrap();
            prop_assert_eq!(addr.to_string(), raw);
        }

        #[test]
        fn child_always_matches_parent(sys in "[0-9]{1,2}", sub in "[0-9]{1,2}") {
            let parent = Address::parse(&sys).unwrap();
            let child = Address::parse(&format!("{sys}-{sub}")).unwrap();
            prop_assert!(child.matches_prefix(&parent));
        }
    }
}
