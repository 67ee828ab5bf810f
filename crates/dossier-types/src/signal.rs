//! The signal envelope: one bus message.
//!
//! Signals are created by senders, consumed by handlers, and never mutated
//! in transit. The wire form is UTF-8 JSON with the exact field set below;
//! unknown fields are ignored, missing mandatory fields are rejected at the
//! bus boundary with a validation fault.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::address::Address;
use crate::radio::{DeliveryClass, RadioCode};

/// Free-form keyed payload attached to a signal.
pub type Payload = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum SignalError {
    /// Missing or malformed mandatory field. Surfaced as `Bus-1-31`.
    #[error("invalid signal envelope: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Globally unique signal identifier. Responses are keyed by the id of the
/// request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId(Uuid);

impl SignalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One addressed bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: SignalId,
    pub caller_address: Address,
    pub target_address: Address,
    pub bus_address: Address,
    /// Dotted event name, e.g. `evidence.indexed`. Handlers dispatch on it.
    pub signal_type: String,
    pub radio_code: RadioCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub response_expected: bool,
    /// Response timeout in whole seconds, if this signal expects one.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Signal {
    /// A fire-and-forget notification (`10-4`, no response expected).
    pub fn notify(
        caller: Address,
        target: Address,
        signal_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            signal_id: SignalId::generate(),
            caller_address: caller,
            target_address: target,
            bus_address: Address::bus(),
            signal_type: signal_type.into(),
            radio_code: RadioCode::TenFour,
            message: String::new(),
            payload,
            response_expected: false,
            timeout_secs: None,
        }
    }

    /// A request expecting exactly one response within the radio code's
    /// default timeout.
    pub fn request(
        caller: Address,
        target: Address,
        signal_type: impl Into<String>,
        radio_code: RadioCode,
        payload: Payload,
    ) -> Self {
        let timeout_secs = radio_code.default_timeout().map(|d| d.as_secs());
        Self {
            signal_id: SignalId::generate(),
            caller_address: caller,
            target_address: target,
            bus_address: Address::bus(),
            signal_type: signal_type.into(),
            radio_code,
            message: String::new(),
            payload,
            response_expected: true,
            timeout_secs,
        }
    }

    /// A response answering `request`, carrying the request's signal id.
    pub fn respond_to(request: &Signal, responder: Address, payload: Payload) -> Self {
        Self {
            signal_id: request.signal_id,
            caller_address: responder,
            target_address: request.caller_address.clone(),
            bus_address: Address::bus(),
            signal_type: format!("{}.reply", request.signal_type),
            radio_code: RadioCode::TenFour,
            message: String::new(),
            payload,
            response_expected: false,
            timeout_secs: None,
        }
    }

    /// Sets the human-readable message line.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Overrides the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Sets a radio code on a notification.
    pub fn with_radio_code(mut self, code: RadioCode) -> Self {
        self.radio_code = code;
        self
    }

    /// The effective response deadline duration, falling back to the radio
    /// code's default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.radio_code.default_timeout())
    }

    /// Delivery class under backpressure, from the radio code.
    pub fn delivery_class(&self) -> DeliveryClass {
        self.radio_code.delivery_class()
    }

    /// Encodes the wire form.
    pub fn to_wire(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes the wire form. Unknown fields are ignored; missing mandatory
    /// fields fail here and surface as `Bus-1-31` at the bus.
    pub fn from_wire(raw: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Signal {
        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), Value::String("E1".into()));
        Signal::notify(Address::locker(), Address::gateway(), "evidence.indexed", payload)
    }

    #[test]
    fn wire_roundtrip() {
        let signal = sample();
        let wire = signal.to_wire().unwrap();
        let back = Signal::from_wire(&wire).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["legacy_field"] = Value::String("ignored".into());
        let raw = value.to_string();
        assert!(Signal::from_wire(&raw).is_ok());
    }

    #[test]
    fn missing_mandatory_field_is_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("target_address");
        assert!(Signal::from_wire(&value.to_string()).is_err());

        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("radio_code");
        assert!(Signal::from_wire(&value.to_string()).is_err());
    }

    #[test]
    fn request_inherits_radio_default_timeout() {
        let req = Signal::request(
            Address::gateway(),
            Address::controller(),
            "controller.can_run",
            RadioCode::TenSix,
            Payload::new(),
        );
        assert!(req.response_expected);
        assert_eq!(req.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn response_reuses_request_id() {
        let req = Signal::request(
            Address::gateway(),
            Address::controller(),
            "controller.can_run",
            RadioCode::TenSix,
            Payload::new(),
        );
        let resp = Signal::respond_to(&req, Address::controller(), Payload::new());
        assert_eq!(resp.signal_id, req.signal_id);
        assert_eq!(resp.target_address, req.caller_address);
        assert!(!resp.response_expected);
    }
}
