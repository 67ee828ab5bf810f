//! # dossier-diagnostics: the diagnostic supervisor
//!
//! Cross-cutting liveness, fault bookkeeping, and repair scheduling. The
//! supervisor owns the fault vault and the repair queue; every other
//! component reaches it out-of-band through the fault channel, so a
//! congested bus can never delay a fault.
//!
//! ## Responsibilities
//!
//! - **Liveness**: STATUS sweeps on a fixed period with a bounded reply
//!   window; three consecutive misses mark a component unhealthy. Full
//!   rollcalls are throttled per originating caller.
//! - **Fault vault**: faults keyed by id, closed entries retained for a
//!   bounded interval, an active-table ceiling with oldest-first LOW
//!   eviction, and JSON-lines persistence.
//! - **Repair queue**: HIGH before MEDIUM before LOW, FIFO within a
//!   severity, soft-cap coalescing and hard-cap eviction, a bounded worker
//!   pool, and SOS escalation when attempts run out.
//! - **Cancellation**: a failed section's outstanding requests are
//!   cancelled and its checkouts force-released, with a network fault if
//!   the release does not confirm in time.
//!
//! HIGH faults are mirrored to the user-visible surface the moment they
//! reach the vault.

mod liveness;
mod repair;
mod supervisor;
mod vault;

pub use liveness::{HealthEvent, HealthRegistry, RollcallThrottle};
pub use repair::{RepairEntry, RepairPush, RepairQueue, RepairQueueSettings};
pub use supervisor::{Supervisor, SupervisorError, SupervisorSettings, SurfaceFault};
pub use vault::{FaultVault, VaultError, VaultSettings};
