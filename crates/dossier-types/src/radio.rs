//! The closed radio-code vocabulary.
//!
//! Every signal carries exactly one radio code indicating intent. The set is
//! closed; unknown codes are rejected at the wire boundary. Each code knows
//! whether a response is expected and its default timeout:
//!
//! | Code | Meaning | Response | Default timeout |
//! |------|---------|----------|-----------------|
//! | `10-4` | Acknowledged | no | — |
//! | `10-6` | Evidence received | yes | 30 s |
//! | `10-8` | Processing complete | yes | 30 s |
//! | `10-9` | Please repeat | yes | 15 s |
//! | `10-10` | Standby | yes | 60 s |
//! | `STATUS` | Status request | yes | 30 s |
//! | `ROLLCALL` | All respond | yes | 60 s |
//! | `RADIO_CHECK` | Connectivity probe | yes | 15 s |
//! | `SOS` | Emergency | yes | 5 s |
//! | `MAYDAY` | System down | yes | 5 s |

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown radio code {0:?}")]
pub struct UnknownRadioCode(pub String);

/// How the bus treats a signal when a subscriber mailbox is under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryClass {
    /// Never dropped; may evict older low-class entries to make room.
    Critical,
    /// Dropped (with a fault) while the mailbox is in backpressure.
    Normal,
    /// First to go: dropped under backpressure and evictable by criticals.
    Low,
}

/// Closed-vocabulary intent tag attached to every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioCode {
    #[serde(rename = "10-4")]
    TenFour,
    #[serde(rename = "10-6")]
    TenSix,
    #[serde(rename = "10-8")]
    TenEight,
    #[serde(rename = "10-9")]
    TenNine,
    #[serde(rename = "10-10")]
    TenTen,
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "ROLLCALL")]
    Rollcall,
    #[serde(rename = "RADIO_CHECK")]
    RadioCheck,
    #[serde(rename = "SOS")]
    Sos,
    #[serde(rename = "MAYDAY")]
    Mayday,
}

impl RadioCode {
    /// The wire string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TenFour => "10-4",
            Self::TenSix => "10-6",
            Self::TenEight => "10-8",
            Self::TenNine => "10-9",
            Self::TenTen => "10-10",
            Self::Status => "STATUS",
            Self::Rollcall => "ROLLCALL",
            Self::RadioCheck => "RADIO_CHECK",
            Self::Sos => "SOS",
            Self::Mayday => "MAYDAY",
        }
    }

    /// Whether a signal carrying this code expects a response.
    pub fn expects_response(self) -> bool {
        !matches!(self, Self::TenFour)
    }

    /// Default timeout for the response, if one is expected.
    pub fn default_timeout(self) -> Option<Duration> {
        let secs = match self {
            Self::TenFour => return None,
            Self::TenSix | Self::TenEight | Self::Status => 30,
            Self::TenNine | Self::RadioCheck => 15,
            Self::TenTen | Self::Rollcall => 60,
            Self::Sos | Self::Mayday => 5,
        };
        Some(Duration::from_secs(secs))
    }

    /// Delivery class under mailbox backpressure.
    ///
    /// Emergencies and completion notifications must always land; plain
    /// acknowledgments are the first to be shed.
    pub fn delivery_class(self) -> DeliveryClass {
        match self {
            Self::Sos | Self::Mayday | Self::TenEight => DeliveryClass::Critical,
            Self::TenFour => DeliveryClass::Low,
            _ => DeliveryClass::Normal,
        }
    }
}

impl Display for RadioCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RadioCode {
    type Err = UnknownRadioCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "10-4" => Ok(Self::TenFour),
            "10-6" => Ok(Self::TenSix),
            "10-8" => Ok(Self::TenEight),
            "10-9" => Ok(Self::TenNine),
            "10-10" => Ok(Self::TenTen),
            "STATUS" => Ok(Self::Status),
            "ROLLCALL" => Ok(Self::Rollcall),
            "RADIO_CHECK" => Ok(Self::RadioCheck),
            "SOS" => Ok(Self::Sos),
            "MAYDAY" => Ok(Self::Mayday),
            other => Err(UnknownRadioCode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RadioCode::TenFour, None; "acknowledgment has no timeout")]
    #[test_case(RadioCode::Status, Some(30); "status waits 30s")]
    #[test_case(RadioCode::Rollcall, Some(60); "rollcall waits 60s")]
    #[test_case(RadioCode::Sos, Some(5); "sos waits 5s")]
    #[test_case(RadioCode::Mayday, Some(5); "mayday waits 5s")]
    #[test_case(RadioCode::RadioCheck, Some(15); "radio check waits 15s")]
    fn default_timeouts(code: RadioCode, secs: Option<u64>) {
        assert_eq!(code.default_timeout(), secs.map(Duration::from_secs));
        assert_eq!(code.expects_response(), secs.is_some());
    }

    #[test]
    fn wire_strings_roundtrip() {
        let all = [
            RadioCode::TenFour,
            RadioCode::TenSix,
            RadioCode::TenEight,
            RadioCode::TenNine,
            RadioCode::TenTen,
            RadioCode::Status,
            RadioCode::Rollcall,
            RadioCode::RadioCheck,
            RadioCode::Sos,
            RadioCode::Mayday,
        ];
        for code in all {
            assert_eq!(code.as_str().parse::<RadioCode>().unwrap(), code);
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn emergencies_are_critical() {
        assert_eq!(RadioCode::Sos.delivery_class(), DeliveryClass::Critical);
        assert_eq!(RadioCode::Mayday.delivery_class(), DeliveryClass::Critical);
        assert_eq!(RadioCode::TenEight.delivery_class(), DeliveryClass::Critical);
        assert_eq!(RadioCode::TenFour.delivery_class(), DeliveryClass::Low);
        assert_eq!(RadioCode::Status.delivery_class(), DeliveryClass::Normal);
    }
}
