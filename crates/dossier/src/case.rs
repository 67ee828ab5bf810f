//! The case context: root container for one investigative report instance.

use chrono::{DateTime, Utc};
use dossier_types::{CaseId, ReportType};
use tokio::sync::watch;

/// The structured failure surfaced by the outermost operation: the first
/// HIGH fault observed, with a remediation hint. Partial results produced
/// up to that point remain available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("case failed ({fault_code}): {message}")]
pub struct CaseFailure {
    pub fault_code: String,
    pub message: String,
    pub remediation_hint: String,
}

/// Root container for one case: identity, report type, and the
/// cancellation channel every long-running operation derives from.
#[derive(Debug)]
pub struct CaseContext {
    case_id: CaseId,
    name: String,
    report_type: ReportType,
    opened_at: DateTime<Utc>,
    cancel_tx: watch::Sender<bool>,
}

impl CaseContext {
    pub fn new(name: impl Into<String>, report_type: ReportType) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            case_id: CaseId::generate(),
            name: name.into(),
            report_type,
            opened_at: Utc::now(),
            cancel_tx,
        }
    }

    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// A token observers can watch; flips to `true` exactly once.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Cancels the case. Idempotent.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.subscribe().borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_flips_once_and_sticks() {
        let context = CaseContext::new("case-0042", ReportType::Hybrid);
        let watcher = context.cancellation();
        assert!(!context.is_cancelled());
        context.cancel();
        context.cancel();
        assert!(context.is_cancelled());
        assert!(*watcher.borrow());
    }
}
