//! Fault codes, severity, and fault records.
//!
//! Fault codes follow the grammar `<ADDRESS>-<XX>` where `XX` is a two-digit
//! family from the closed taxonomy: `2-1-51` reads "invalid state, raised at
//! the ecosystem controller". The family drives the propagation policy:
//! retryable families go through backoff and the repair queue, contract
//! families are reported as-is, fatal families trigger a component restart.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::address::Address;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FaultCodeError {
    #[error("fault code {0:?} has no family suffix")]
    MissingFamily(String),

    #[error("unknown fault family {0:?}")]
    UnknownFamily(String),

    #[error("invalid origin address in fault code: {0}")]
    BadOrigin(#[from] crate::address::AddressError),
}

// ============================================================================
// Taxonomy
// ============================================================================

/// The two-digit fault family taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultFamily {
    /// 01 — syntax or configuration error.
    Syntax,
    /// 10 — initialization failure.
    Init,
    /// 20 — timeout.
    Timeout,
    /// 23 — expected signal not received.
    SignalNotReceived,
    /// 24 — address unknown.
    AddressUnknown,
    /// 30 — data processing error.
    DataProcessing,
    /// 31 — validation failed.
    Validation,
    /// 32 — data corruption.
    DataCorruption,
    /// 40 — resource unavailable.
    ResourceUnavailable,
    /// 50 — business rule violation.
    BusinessRule,
    /// 51 — invalid state.
    InvalidState,
    /// 52 — operation forbidden in current state.
    Forbidden,
    /// 53 — revision limit exceeded.
    RevisionLimit,
    /// 60 — external service failure.
    ExternalService,
    /// 70 — file missing.
    FileMissing,
    /// 80 — database error.
    Database,
    /// 90 — crash.
    Crash,
    /// 91 — out of memory.
    OutOfMemory,
    /// 93 — network failure.
    Network,
}

impl FaultFamily {
    /// The numeric two-digit code.
    pub fn code(self) -> u8 {
        match self {
            Self::Syntax => 1,
            Self::Init => 10,
            Self::Timeout => 20,
            Self::SignalNotReceived => 23,
            Self::AddressUnknown => 24,
            Self::DataProcessing => 30,
            Self::Validation => 31,
            Self::DataCorruption => 32,
            Self::ResourceUnavailable => 40,
            Self::BusinessRule => 50,
            Self::InvalidState => 51,
            Self::Forbidden => 52,
            Self::RevisionLimit => 53,
            Self::ExternalService => 60,
            Self::FileMissing => 70,
            Self::Database => 80,
            Self::Crash => 90,
            Self::OutOfMemory => 91,
            Self::Network => 93,
        }
    }

    /// Parses the two-digit numeric form.
    pub fn from_code(code: u8) -> Option<Self> {
        let family = match code {
            1 => Self::Syntax,
            10 => Self::Init,
            20 => Self::Timeout,
            23 => Self::SignalNotReceived,
            24 => Self::AddressUnknown,
            30 => Self::DataProcessing,
            31 => Self::Validation,
            32 => Self::DataCorruption,
            40 => Self::ResourceUnavailable,
            50 => Self::BusinessRule,
            51 => Self::InvalidState,
            52 => Self::Forbidden,
            53 => Self::RevisionLimit,
            60 => Self::ExternalService,
            70 => Self::FileMissing,
            80 => Self::Database,
            90 => Self::Crash,
            91 => Self::OutOfMemory,
            93 => Self::Network,
            _ => return None,
        };
        Some(family)
    }

    /// Families resolved by local retry with backoff before escalation.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ResourceUnavailable | Self::ExternalService | Self::Database | Self::Network
        )
    }

    /// Contract errors: reported with full context, never retried.
    pub fn is_contract_error(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::DataCorruption | Self::InvalidState | Self::Forbidden
        )
    }

    /// Fatal families: the owning component attempts a single restart.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Crash | Self::OutOfMemory)
    }
}

impl Display for FaultFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.code())
    }
}

// ============================================================================
// Fault code
// ============================================================================

/// A located fault: origin address plus family, rendered `<ADDRESS>-<XX>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FaultCode {
    pub origin: Address,
    pub family: FaultFamily,
}

impl FaultCode {
    pub fn new(origin: Address, family: FaultFamily) -> Self {
        Self { origin, family }
    }

    pub fn parse(raw: &str) -> Result<Self, FaultCodeError> {
        let (origin, suffix) = raw
            .rsplit_once('-')
            .ok_or_else(|| FaultCodeError::MissingFamily(raw.to_string()))?;
        let code: u8 = suffix
            .parse()
            .map_err(|_| FaultCodeError::UnknownFamily(suffix.to_string()))?;
        let family = FaultFamily::from_code(code)
            .ok_or_else(|| FaultCodeError::UnknownFamily(suffix.to_string()))?;
        Ok(Self {
            origin: Address::parse(origin)?,
            family,
        })
    }
}

impl Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.family)
    }
}

impl FromStr for FaultCode {
    type Err = FaultCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FaultCode {
    type Error = FaultCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FaultCode> for String {
    fn from(code: FaultCode) -> Self {
        code.to_string()
    }
}

// ============================================================================
// Severity and records
// ============================================================================

/// Fault severity. Variant order gives the repair queue its priority order:
/// `High < Medium < Low` under `Ord`, so a min-heap pops HIGH first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a fault record inside the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    Open,
    InRepair,
    Closed,
    /// Repair attempts exhausted; escalated and left for operator review.
    Unrepaired,
}

/// Unique identifier for a fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FaultId(Uuid);

impl FaultId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for FaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fault, as stored in the fault vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub fault_id: FaultId,
    pub origin_address: Address,
    pub fault_code: FaultCode,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Free-form human context: what was happening when the fault surfaced.
    pub context: String,
    pub state: FaultState,
    /// Repair attempts consumed so far.
    pub attempts: u32,
    /// Set when the record enters `Closed`; drives retention eviction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl FaultRecord {
    /// Creates an open fault detected now.
    pub fn new(origin: Address, family: FaultFamily, severity: Severity, context: impl Into<String>) -> Self {
        Self {
            fault_id: FaultId::generate(),
            fault_code: FaultCode::new(origin.clone(), family),
            origin_address: origin,
            severity,
            detected_at: Utc::now(),
            context: context.into(),
            state: FaultState::Open,
            attempts: 0,
            closed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn fault_code_renders_address_dash_family() {
        let code = FaultCode::new(Address::controller(), FaultFamily::InvalidState);
        assert_eq!(code.to_string(), "2-1-51");

        let timeout = FaultCode::new(Address::bus(), FaultFamily::Timeout);
        assert_eq!(timeout.to_string(), "Bus-1-20");
    }

    #[test]
    fn fault_code_parses_back() {
        for raw in ["2-1-51", "Bus-1-20", "1-1-32", "5-2-52", "Diag-23", "2-2.complete-31"] {
            let code = FaultCode::parse(raw).unwrap();
            assert_eq!(code.to_string(), raw);
        }
        assert!(FaultCode::parse("2-1-99").is_err());
        assert!(FaultCode::parse("51").is_err());
    }

    #[test_case(FaultFamily::ResourceUnavailable; "resource unavailable")]
    #[test_case(FaultFamily::ExternalService; "external service")]
    #[test_case(FaultFamily::Database; "database")]
    #[test_case(FaultFamily::Network; "network")]
    fn retryable_families(family: FaultFamily) {
        assert!(family.is_retryable());
        assert!(!family.is_contract_error());
        assert!(!family.is_fatal());
    }

    #[test]
    fn severity_orders_high_first() {
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Medium < Severity::Low);
    }

    #[test]
    fn family_codes_roundtrip() {
        for code in [1u8, 10, 20, 23, 24, 30, 31, 32, 40, 50, 51, 52, 53, 60, 70, 80, 90, 91, 93] {
            let family = FaultFamily::from_code(code).unwrap();
            assert_eq!(family.code(), code);
        }
        assert!(FaultFamily::from_code(99).is_none());
    }
}
