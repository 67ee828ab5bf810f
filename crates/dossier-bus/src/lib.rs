//! # dossier-bus: the signal bus
//!
//! The bus delivers signals; nothing more. It owns the subscription table
//! and the pending-response map and carries no domain state.
//!
//! ## Design
//!
//! - One long-lived bus task owns all routing state and consumes a single
//!   command channel. Because every handle feeds that one channel, delivery
//!   order per `(sender, topic)` pair follows emission order with no extra
//!   sequencing machinery. No global ordering is promised across topics or
//!   senders.
//! - Subscribers register for an exact address or an address prefix; a
//!   signal fans out to every subscription matching its target address.
//!   Published event streams use component-form addresses (`2-2.complete`)
//!   so observers can subscribe without intercepting directed traffic.
//! - Each subscriber owns a bounded [`Mailbox`]. Above the soft threshold
//!   the mailbox enters backpressure: non-critical signals are dropped with
//!   a MEDIUM fault, critical signals (SOS, MAYDAY, and `10-8` completion
//!   notifications) are always delivered, evicting the oldest low-class
//!   entries when the hard cap is hit.
//! - `request()` registers a pending entry with a deadline; the bus's
//!   timeout loop wakes at the earliest deadline, synthesizes a `Bus-1-20`
//!   fault, and fails the caller. Late responses are dropped silently.
//!
//! Faults are reported out-of-band through a [`FaultReporter`] consumed by
//! the diagnostic supervisor.

mod bus;
mod error;
mod mailbox;
mod reporter;

pub use bus::{Bus, BusHandle, BusSettings, Subscription, SubscriptionId};
pub use error::{BusError, RequestError};
pub use mailbox::{Mailbox, MailboxSettings, PushOutcome};
pub use reporter::FaultReporter;
