//! Bounded subscriber mailboxes with backpressure.
//!
//! Each subscription owns one mailbox. Depth above the soft threshold puts
//! the mailbox into backpressure; depth is bounded by the hard capacity.
//! Under pressure, delivery is decided by the signal's delivery class:
//!
//! - `Critical` (SOS, MAYDAY, completion notifications) always enqueues,
//!   evicting the oldest low-class entries when the hard cap is reached.
//! - `Normal` and `Low` are dropped; the bus raises a MEDIUM fault per drop.
//!
//! Backpressure is monotonic per window: once the state changes it cannot
//! change again until the window (default 30 s) has elapsed, so a mailbox
//! hovering around the threshold cannot flap.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dossier_types::{DeliveryClass, Signal};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Tuning for one mailbox.
#[derive(Debug, Clone, Copy)]
pub struct MailboxSettings {
    /// Hard capacity. Only critical signals may push depth past this, and
    /// only when no low-class entry is left to evict.
    pub capacity: usize,
    /// Depth above which the mailbox enters backpressure.
    pub soft_threshold: usize,
    /// Minimum time between backpressure state changes.
    pub backpressure_window: Duration,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            soft_threshold: 800,
            backpressure_window: Duration::from_secs(30),
        }
    }
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued normally.
    Delivered,
    /// Enqueued after evicting this many low-class entries.
    DeliveredWithEviction(usize),
    /// Shed under backpressure or at the hard cap.
    Dropped,
}

impl PushOutcome {
    pub fn was_delivered(self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Signal>,
    backpressure: bool,
    /// When the backpressure state last changed.
    last_transition: Option<Instant>,
}

/// A bounded mailbox for one subscriber.
#[derive(Debug)]
pub struct Mailbox {
    settings: MailboxSettings,
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    /// Creates an empty mailbox.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero or below the soft threshold.
    pub fn new(settings: MailboxSettings) -> Self {
        assert!(settings.capacity > 0, "mailbox capacity must be positive");
        assert!(
            settings.soft_threshold <= settings.capacity,
            "soft threshold must not exceed capacity"
        );
        Self {
            settings,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                backpressure: false,
                last_transition: None,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Attempts to enqueue a signal, applying the backpressure policy.
    pub fn push(&self, signal: Signal) -> PushOutcome {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        let now = Instant::now();
        self.update_backpressure(&mut inner, now);

        let class = signal.delivery_class();
        let under_pressure = inner.backpressure;
        let at_cap = inner.queue.len() >= self.settings.capacity;

        if class == DeliveryClass::Critical {
            let mut evicted = 0;
            while inner.queue.len() >= self.settings.capacity {
                match evict_oldest_low(&mut inner.queue) {
                    true => evicted += 1,
                    // Nothing evictable left: the critical still lands, the
                    // cap is temporarily exceeded.
                    false => break,
                }
            }
            inner.queue.push_back(signal);
            drop(inner);
            self.notify.notify_one();
            return if evicted > 0 {
                PushOutcome::DeliveredWithEviction(evicted)
            } else {
                PushOutcome::Delivered
            };
        }

        if under_pressure || at_cap {
            return PushOutcome::Dropped;
        }

        inner.queue.push_back(signal);
        drop(inner);
        self.notify.notify_one();
        PushOutcome::Delivered
    }

    /// Receives the next signal, waiting if the mailbox is empty. Returns
    /// `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<Signal> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("mailbox lock poisoned");
                if let Some(signal) = inner.queue.pop_front() {
                    return Some(signal);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Signal> {
        self.inner
            .lock()
            .expect("mailbox lock poisoned")
            .queue
            .pop_front()
    }

    /// Current depth.
    pub fn depth(&self) -> usize {
        self.inner.lock().expect("mailbox lock poisoned").queue.len()
    }

    /// Whether the mailbox is currently shedding non-critical signals.
    pub fn in_backpressure(&self) -> bool {
        self.inner
            .lock()
            .expect("mailbox lock poisoned")
            .backpressure
    }

    /// Closes the mailbox; pending signals remain receivable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Applies the monotonic-per-window backpressure transition rule.
    ///
    /// Entering is immediate the first time depth exceeds the soft
    /// threshold; leaving requires depth back at or under the threshold AND
    /// a full window elapsed since the last transition.
    fn update_backpressure(&self, inner: &mut Inner, now: Instant) {
        let over = inner.queue.len() > self.settings.soft_threshold;
        let window_elapsed = inner
            .last_transition
            .is_none_or(|t| now.duration_since(t) >= self.settings.backpressure_window);

        if !inner.backpressure && over && window_elapsed {
            inner.backpressure = true;
            inner.last_transition = Some(now);
        } else if inner.backpressure && !over && window_elapsed {
            inner.backpressure = false;
            inner.last_transition = Some(now);
        }
    }
}

/// Removes the oldest low-class entry, if any. Returns whether one was
/// removed.
fn evict_oldest_low(queue: &mut VecDeque<Signal>) -> bool {
    let position = queue
        .iter()
        .position(|s| s.delivery_class() == DeliveryClass::Low);
    match position {
        Some(index) => {
            queue.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_types::{Address, Payload, RadioCode};

    fn settings(capacity: usize, soft: usize) -> MailboxSettings {
        MailboxSettings {
            capacity,
            soft_threshold: soft,
            backpressure_window: Duration::from_secs(30),
        }
    }

    fn low_signal() -> Signal {
        Signal::notify(Address::locker(), Address::gateway(), "evidence.new", Payload::new())
    }

    fn normal_signal() -> Signal {
        low_signal().with_radio_code(RadioCode::Status)
    }

    fn critical_signal() -> Signal {
        low_signal().with_radio_code(RadioCode::Sos)
    }

    #[test]
    fn accepts_up_to_soft_threshold() {
        let mailbox = Mailbox::new(settings(10, 4));
        for _ in 0..4 {
            assert_eq!(mailbox.push(low_signal()), PushOutcome::Delivered);
        }
        // Exactly at the soft threshold: still accepted.
        assert_eq!(mailbox.push(low_signal()), PushOutcome::Delivered);
        assert!(!mailbox.in_backpressure());
        // Depth is now above the threshold: backpressure engages.
        assert_eq!(mailbox.push(low_signal()), PushOutcome::Dropped);
        assert!(mailbox.in_backpressure());
    }

    #[test]
    fn critical_always_lands_and_evicts_oldest_low() {
        let mailbox = Mailbox::new(settings(3, 1));
        assert!(mailbox.push(low_signal()).was_delivered());
        assert!(mailbox.push(critical_signal()).was_delivered());
        assert!(mailbox.push(critical_signal()).was_delivered());
        assert_eq!(mailbox.depth(), 3);

        // At the hard cap: the critical evicts the single low entry.
        assert_eq!(
            mailbox.push(critical_signal()),
            PushOutcome::DeliveredWithEviction(1)
        );
        assert_eq!(mailbox.depth(), 3);

        // No low entries remain: the cap is exceeded rather than losing
        // the emergency.
        assert_eq!(mailbox.push(critical_signal()), PushOutcome::Delivered);
        assert_eq!(mailbox.depth(), 4);
    }

    #[test]
    fn normal_dropped_under_backpressure() {
        let mailbox = Mailbox::new(settings(10, 2));
        for _ in 0..3 {
            assert!(mailbox.push(normal_signal()).was_delivered());
        }
        assert_eq!(mailbox.push(normal_signal()), PushOutcome::Dropped);
        assert_eq!(mailbox.push(low_signal()), PushOutcome::Dropped);
        assert!(mailbox.push(critical_signal()).was_delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_cannot_flap_within_window() {
        let mailbox = Mailbox::new(settings(10, 2));
        for _ in 0..3 {
            mailbox.push(normal_signal());
        }
        assert!(mailbox.in_backpressure());

        // Drain below the threshold; the state holds until the window
        // elapses.
        while mailbox.try_recv().is_some() {}
        mailbox.push(normal_signal());
        assert!(mailbox.in_backpressure());
        assert_eq!(mailbox.push(normal_signal()), PushOutcome::Dropped);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(mailbox.push(normal_signal()).was_delivered());
        assert!(!mailbox.in_backpressure());
    }

    #[tokio::test]
    async fn recv_drains_in_fifo_order() {
        let mailbox = Mailbox::new(MailboxSettings::default());
        for n in 0..3 {
            let mut payload = Payload::new();
            payload.insert("n".into(), serde_json::json!(n));
            mailbox.push(Signal::notify(
                Address::locker(),
                Address::gateway(),
                "evidence.new",
                payload,
            ));
        }
        for n in 0..3 {
            let signal = mailbox.recv().await.unwrap();
            assert_eq!(signal.payload["n"], serde_json::json!(n));
        }
    }

    #[tokio::test]
    async fn close_unblocks_receiver() {
        let mailbox = std::sync::Arc::new(Mailbox::new(MailboxSettings::default()));
        let receiver = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.recv().await })
        };
        tokio::task::yield_now().await;
        mailbox.close();
        assert!(receiver.await.unwrap().is_none());
    }
}
