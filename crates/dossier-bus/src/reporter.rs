//! Out-of-band fault reporting.
//!
//! Diagnostic signals cross all layers outside the normal bus flow so that
//! a congested mailbox can never delay or drop a fault. Every component
//! holds a [`FaultReporter`]; the diagnostic supervisor consumes the other
//! end.

use dossier_types::FaultRecord;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Cheap-to-clone sender half of the fault channel.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<FaultRecord>,
}

impl FaultReporter {
    /// Creates the channel; the receiver goes to the diagnostic supervisor.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FaultRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reports a fault. Never blocks; if the supervisor is gone the fault
    /// is logged and dropped.
    pub fn report(&self, fault: FaultRecord) {
        error!(
            fault_code = %fault.fault_code,
            severity = %fault.severity,
            context = %fault.context,
            "fault raised"
        );
        if self.tx.send(fault).is_err() {
            warn!("diagnostic supervisor unavailable; fault dropped");
        }
    }

    /// A reporter wired to nowhere, for tests and standalone components.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}
