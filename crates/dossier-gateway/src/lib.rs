//! # dossier-gateway: the evidence-to-section bridge
//!
//! The gateway mediates between the evidence stream and the report
//! sections: it routes indexed evidence to the sections that should see it,
//! composes per-section input envelopes, validates and publishes section
//! payloads, and forwards revision requests to the controller.
//!
//! Routing carries ids, never bytes: an `evidence.deliver` signal tells a
//! section what exists; the section checks the bytes out through the
//! marshall while it is EXECUTING.
//!
//! The gateway enforces the order lock: a section is never prepared while
//! any of its dependencies is incomplete. Violations raise `2-2-52`.

mod envelope;
mod gateway;
mod routing;

pub use envelope::InputEnvelope;
pub use gateway::{Gateway, GatewayError};
pub use routing::{RoutingError, RoutingRule, RoutingTable};
