//! The repair queue.
//!
//! Priority order HIGH < MEDIUM < LOW with FIFO inside each severity,
//! implemented as one bucket per severity. Capacity discipline:
//!
//! - Soft cap (default 800): incoming LOW entries are dropped with a
//!   warning; MEDIUM entries coalesce with a matching queued entry (same
//!   fault code and origin) by bumping its attempt count.
//! - Hard cap (default 1000): the oldest LOW entries are evicted and
//!   logged to admit the newcomer; with nothing evictable, the newcomer is
//!   rejected.

use std::collections::VecDeque;

use dossier_types::{Address, FaultCode, FaultId, Severity};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RepairQueueSettings {
    pub hard_cap: usize,
    pub soft_cap: usize,
}

impl Default for RepairQueueSettings {
    fn default() -> Self {
        Self {
            hard_cap: 1000,
            soft_cap: 800,
        }
    }
}

/// One queued repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairEntry {
    pub fault_id: FaultId,
    pub fault_code: FaultCode,
    pub origin: Address,
    pub severity: Severity,
    /// Attempts already consumed, including coalesced duplicates.
    pub attempts: u32,
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPush {
    Queued,
    /// Merged into an existing entry with the same code and origin.
    Coalesced,
    /// Shed under the capacity policy.
    Dropped,
    /// Queued after evicting this many LOW entries at the hard cap.
    QueuedWithEviction(usize),
}

/// The queue: one FIFO bucket per severity, popped HIGH first.
#[derive(Debug, Default)]
pub struct RepairQueue {
    settings: RepairQueueSettings,
    high: VecDeque<RepairEntry>,
    medium: VecDeque<RepairEntry>,
    low: VecDeque<RepairEntry>,
}

impl RepairQueue {
    pub fn new(settings: RepairQueueSettings) -> Self {
        Self {
            settings,
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is past its soft cap (backpressure).
    pub fn in_backpressure(&self) -> bool {
        self.len() >= self.settings.soft_cap
    }

    /// Enqueues a repair under the capacity policy.
    pub fn push(&mut self, entry: RepairEntry) -> RepairPush {
        let depth = self.len();

        if depth >= self.settings.hard_cap {
            // At the hard cap only eviction can admit anything.
            let mut evicted = 0;
            while self.len() >= self.settings.hard_cap {
                if self.low.pop_front().is_none() {
                    break;
                }
                evicted += 1;
            }
            if self.len() >= self.settings.hard_cap {
                warn!(fault_code = %entry.fault_code, "repair queue at hard cap; entry rejected");
                return RepairPush::Dropped;
            }
            warn!(evicted, "repair queue evicted oldest LOW entries at hard cap");
            self.bucket(entry.severity).push_back(entry);
            return RepairPush::QueuedWithEviction(evicted);
        }

        if depth >= self.settings.soft_cap {
            match entry.severity {
                Severity::Low => {
                    warn!(fault_code = %entry.fault_code, "repair queue backpressure; LOW entry dropped");
                    return RepairPush::Dropped;
                }
                Severity::Medium => {
                    if let Some(existing) = self.medium.iter_mut().find(|queued| {
                        queued.fault_code == entry.fault_code && queued.origin == entry.origin
                    }) {
                        existing.attempts += 1;
                        return RepairPush::Coalesced;
                    }
                }
                Severity::High => {}
            }
        }

        self.bucket(entry.severity).push_back(entry);
        RepairPush::Queued
    }

    /// Pops the next repair: HIGH before MEDIUM before LOW, FIFO within.
    pub fn pop(&mut self) -> Option<RepairEntry> {
        self.high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn bucket(&mut self, severity: Severity) -> &mut VecDeque<RepairEntry> {
        match severity {
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_types::FaultFamily;

    fn entry(severity: Severity, family: FaultFamily) -> RepairEntry {
        RepairEntry {
            fault_id: FaultId::generate(),
            fault_code: FaultCode::new(Address::locker(), family),
            origin: Address::locker(),
            severity,
            attempts: 0,
        }
    }

    fn queue(hard: usize, soft: usize) -> RepairQueue {
        RepairQueue::new(RepairQueueSettings {
            hard_cap: hard,
            soft_cap: soft,
        })
    }

    #[test]
    fn pops_high_first_fifo_within() {
        let mut queue = queue(100, 80);
        let low = entry(Severity::Low, FaultFamily::Network);
        let medium_a = entry(Severity::Medium, FaultFamily::Database);
        let medium_b = entry(Severity::Medium, FaultFamily::ExternalService);
        let high = entry(Severity::High, FaultFamily::Crash);

        queue.push(low.clone());
        queue.push(medium_a.clone());
        queue.push(medium_b.clone());
        queue.push(high.clone());

        assert_eq!(queue.pop().unwrap().fault_id, high.fault_id);
        assert_eq!(queue.pop().unwrap().fault_id, medium_a.fault_id);
        assert_eq!(queue.pop().unwrap().fault_id, medium_b.fault_id);
        assert_eq!(queue.pop().unwrap().fault_id, low.fault_id);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn soft_cap_drops_low_and_coalesces_medium() {
        let mut queue = queue(10, 2);
        queue.push(entry(Severity::Medium, FaultFamily::Database));
        queue.push(entry(Severity::Medium, FaultFamily::Network));
        assert!(queue.in_backpressure());

        // LOW is shed outright.
        assert_eq!(
            queue.push(entry(Severity::Low, FaultFamily::Network)),
            RepairPush::Dropped
        );

        // MEDIUM with a matching queued entry coalesces.
        assert_eq!(
            queue.push(entry(Severity::Medium, FaultFamily::Database)),
            RepairPush::Coalesced
        );
        assert_eq!(queue.len(), 2);
        let first = queue.pop().unwrap();
        assert_eq!(first.attempts, 1, "coalescing bumps the attempt count");

        // HIGH is never shed by the soft cap.
        assert_eq!(
            queue.push(entry(Severity::High, FaultFamily::Crash)),
            RepairPush::Queued
        );
    }

    #[test]
    fn hard_cap_evicts_oldest_low() {
        let mut queue = queue(3, 3);
        let oldest_low = entry(Severity::Low, FaultFamily::Network);
        queue.push(oldest_low.clone());
        queue.push(entry(Severity::High, FaultFamily::Crash));
        queue.push(entry(Severity::High, FaultFamily::Crash));

        assert_eq!(
            queue.push(entry(Severity::High, FaultFamily::OutOfMemory)),
            RepairPush::QueuedWithEviction(1)
        );
        assert_eq!(queue.len(), 3);

        // All HIGH now: nothing evictable, newcomer rejected.
        assert_eq!(
            queue.push(entry(Severity::High, FaultFamily::Crash)),
            RepairPush::Dropped
        );
    }

    #[test]
    fn length_never_exceeds_hard_cap() {
        let mut queue = queue(5, 3);
        for _ in 0..50 {
            queue.push(entry(Severity::Medium, FaultFamily::Database));
            queue.push(entry(Severity::Low, FaultFamily::Network));
            queue.push(entry(Severity::High, FaultFamily::Crash));
            assert!(queue.len() <= 5);
        }
    }
}
