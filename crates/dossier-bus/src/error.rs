//! Bus error types.

use dossier_types::{Address, FaultCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// The bus task has shut down; no further signals can be routed.
    #[error("bus is not running")]
    Closed,

    /// Wire-form envelope failed validation (`Bus-1-31`).
    #[error("invalid signal envelope: {0}")]
    InvalidEnvelope(#[from] dossier_types::SignalError),
}

/// Terminal outcomes of a `request()` other than a response.
///
/// Every request with `response_expected` resolves exactly once: a response,
/// a timeout fault, or an explicit cancellation.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No response arrived inside the deadline. Carries the synthesized
    /// `Bus-1-20` fault code.
    #[error("request timed out ({fault_code})")]
    Timeout { fault_code: FaultCode },

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// Nothing is subscribed at the target address (`<target>-24`).
    #[error("no subscriber at {target}")]
    AddressUnknown { target: Address },

    /// The bus task has shut down.
    #[error("bus is not running")]
    Closed,
}
