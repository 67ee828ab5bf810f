//! Liveness tracking and the rollcall throttle.
//!
//! Each registered address is probed on the STATUS period and must answer
//! inside the reply window. Misses are tallied per address; hitting the
//! consecutive-miss limit (default 3) marks the component unhealthy and is
//! reported exactly once until it recovers. A rollcall miss counts as one
//! ordinary miss, not an immediate escalation.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use dossier_types::Address;
use tokio::time::Instant;
use std::time::Duration;

/// What a recorded probe outcome changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The component hit the miss limit with this probe.
    BecameUnhealthy { address: Address, misses: u32 },
    /// A previously unhealthy component answered again.
    Recovered { address: Address },
}

#[derive(Debug, Clone)]
struct ComponentHealth {
    consecutive_misses: u32,
    healthy: bool,
    last_seen: Option<DateTime<Utc>>,
}

/// Per-address health bookkeeping. Owned by the supervisor.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    miss_limit: u32,
    components: BTreeMap<Address, ComponentHealth>,
}

impl HealthRegistry {
    pub fn new(miss_limit: u32) -> Self {
        Self {
            miss_limit,
            components: BTreeMap::new(),
        }
    }

    /// Registers an address for sweeping. Idempotent.
    pub fn register(&mut self, address: Address) {
        self.components.entry(address).or_insert(ComponentHealth {
            consecutive_misses: 0,
            healthy: true,
            last_seen: None,
        });
    }

    pub fn deregister(&mut self, address: &Address) {
        self.components.remove(address);
    }

    /// Every address currently under watch.
    pub fn addresses(&self) -> Vec<Address> {
        self.components.keys().cloned().collect()
    }

    /// Records a successful probe response.
    pub fn record_response(&mut self, address: &Address) -> Option<HealthEvent> {
        let health = self.components.get_mut(address)?;
        health.consecutive_misses = 0;
        health.last_seen = Some(Utc::now());
        if !health.healthy {
            health.healthy = true;
            return Some(HealthEvent::Recovered {
                address: address.clone(),
            });
        }
        None
    }

    /// Records a missed probe. The component becomes unhealthy on the miss
    /// that reaches the limit — the third by default, not the second.
    pub fn record_miss(&mut self, address: &Address) -> Option<HealthEvent> {
        let miss_limit = self.miss_limit;
        let health = self.components.get_mut(address)?;
        health.consecutive_misses += 1;
        if health.healthy && health.consecutive_misses >= miss_limit {
            health.healthy = false;
            return Some(HealthEvent::BecameUnhealthy {
                address: address.clone(),
                misses: health.consecutive_misses,
            });
        }
        None
    }

    pub fn is_healthy(&self, address: &Address) -> Option<bool> {
        self.components.get(address).map(|h| h.healthy)
    }

    pub fn misses(&self, address: &Address) -> Option<u32> {
        self.components.get(address).map(|h| h.consecutive_misses)
    }

    /// Serializable health snapshot: address → (healthy, misses).
    pub fn snapshot(&self) -> BTreeMap<String, (bool, u32)> {
        self.components
            .iter()
            .map(|(addr, h)| (addr.to_string(), (h.healthy, h.consecutive_misses)))
            .collect()
    }
}

/// Per-caller rollcall throttle: one rollcall per interval per originating
/// caller. Excess attempts are rejected, never queued.
#[derive(Debug)]
pub struct RollcallThrottle {
    min_interval: Duration,
    last_by_caller: HashMap<Address, Instant>,
}

impl RollcallThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_by_caller: HashMap::new(),
        }
    }

    /// Returns whether this caller may roll call now, recording the attempt
    /// when allowed.
    pub fn allow(&mut self, caller: &Address, now: Instant) -> bool {
        match self.last_by_caller.get(caller) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_by_caller.insert(caller.clone(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: &str) -> Address {
        Address::parse(raw).unwrap()
    }

    #[test]
    fn third_consecutive_miss_flips_to_unhealthy() {
        let mut registry = HealthRegistry::new(3);
        registry.register(addr("4-5"));

        assert_eq!(registry.record_miss(&addr("4-5")), None);
        assert_eq!(registry.record_miss(&addr("4-5")), None);
        assert_eq!(
            registry.record_miss(&addr("4-5")),
            Some(HealthEvent::BecameUnhealthy {
                address: addr("4-5"),
                misses: 3
            })
        );
        // Further misses do not re-report.
        assert_eq!(registry.record_miss(&addr("4-5")), None);
        assert_eq!(registry.is_healthy(&addr("4-5")), Some(false));
    }

    #[test]
    fn a_response_resets_the_tally() {
        let mut registry = HealthRegistry::new(3);
        registry.register(addr("1-1"));

        registry.record_miss(&addr("1-1"));
        registry.record_miss(&addr("1-1"));
        assert_eq!(registry.record_response(&addr("1-1")), None);
        assert_eq!(registry.misses(&addr("1-1")), Some(0));

        // Two misses after the reset still leave it healthy.
        registry.record_miss(&addr("1-1"));
        registry.record_miss(&addr("1-1"));
        assert_eq!(registry.is_healthy(&addr("1-1")), Some(true));
    }

    #[test]
    fn recovery_is_reported_once() {
        let mut registry = HealthRegistry::new(3);
        registry.register(addr("2-2"));
        for _ in 0..3 {
            registry.record_miss(&addr("2-2"));
        }
        assert_eq!(
            registry.record_response(&addr("2-2")),
            Some(HealthEvent::Recovered { address: addr("2-2") })
        );
        assert_eq!(registry.record_response(&addr("2-2")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rollcall_throttle_is_per_caller() {
        let mut throttle = RollcallThrottle::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(throttle.allow(&addr("2-1"), now));
        assert!(!throttle.allow(&addr("2-1"), now));
        // A different caller is not throttled by the first.
        assert!(throttle.allow(&addr("2-2"), now));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(throttle.allow(&addr("2-1"), Instant::now()));
    }
}
