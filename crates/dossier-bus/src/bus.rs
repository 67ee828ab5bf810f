//! The bus task: signal registry, routing, delivery, subscription management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dossier_types::{Address, FaultFamily, FaultRecord, Payload, Severity, Signal, SignalId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::error::{BusError, RequestError};
use crate::mailbox::{Mailbox, MailboxSettings, PushOutcome};
use crate::reporter::FaultReporter;

/// Tuning for the bus.
#[derive(Debug, Clone, Copy)]
pub struct BusSettings {
    pub mailbox: MailboxSettings,
    /// Used when neither the signal nor its radio code supplies a timeout.
    pub default_request_timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            mailbox: MailboxSettings::default(),
            default_request_timeout: Duration::from_secs(30),
        }
    }
}

/// Identifier for one subscription; doubles as the unsubscribe handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription: the receiving end of one mailbox.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    mailbox: Arc<Mailbox>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Receives the next matching signal; `None` after unsubscribe/shutdown
    /// once the mailbox is drained.
    pub async fn recv(&self) -> Option<Signal> {
        self.mailbox.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Signal> {
        self.mailbox.try_recv()
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Tears down the subscription. Already-queued signals are discarded.
    pub fn unsubscribe(self) {
        let _ = self.commands.send(Command::Unsubscribe { id: self.id });
        self.mailbox.close();
    }
}

enum Command {
    Subscribe {
        filter: Address,
        reply: oneshot::Sender<(SubscriptionId, Arc<Mailbox>)>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Emit {
        signal: Signal,
    },
    Request {
        signal: Signal,
        reply: oneshot::Sender<Result<Signal, RequestError>>,
    },
    Respond {
        response: Signal,
    },
    CancelOwned {
        owner: Address,
    },
}

struct SubEntry {
    id: SubscriptionId,
    filter: Address,
    mailbox: Arc<Mailbox>,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Signal, RequestError>>,
    deadline: Instant,
    caller: Address,
}

/// Cheap-to-clone handle used by every component to reach the bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    commands: mpsc::UnboundedSender<Command>,
    fault: FaultReporter,
}

impl BusHandle {
    /// Subscribes to an exact address or an address prefix.
    pub async fn subscribe(&self, filter: Address) -> Result<Subscription, BusError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { filter, reply: tx })
            .map_err(|_| BusError::Closed)?;
        let (id, mailbox) = rx.await.map_err(|_| BusError::Closed)?;
        Ok(Subscription {
            id,
            mailbox,
            commands: self.commands.clone(),
        })
    }

    /// Fans a signal out to all matching subscribers. Non-blocking from the
    /// sender's perspective.
    pub fn emit(&self, signal: Signal) -> Result<(), BusError> {
        self.commands
            .send(Command::Emit { signal })
            .map_err(|_| BusError::Closed)
    }

    /// Decodes a wire-form envelope and emits it. Validation failures raise
    /// `Bus-1-31` and are returned to the caller.
    pub fn emit_wire(&self, raw: &str) -> Result<(), BusError> {
        match Signal::from_wire(raw) {
            Ok(signal) => self.emit(signal),
            Err(err) => {
                self.fault.report(FaultRecord::new(
                    Address::bus(),
                    FaultFamily::Validation,
                    Severity::Medium,
                    format!("rejected wire envelope: {err}"),
                ));
                Err(BusError::InvalidEnvelope(err))
            }
        }
    }

    /// Sends a request and awaits its single response. Resolves with the
    /// response, a timeout fault, or a cancellation.
    pub async fn request(&self, mut signal: Signal) -> Result<Signal, RequestError> {
        signal.response_expected = true;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request { signal, reply: tx })
            .map_err(|_| RequestError::Closed)?;
        rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Completes a pending request with a response built from `request`.
    pub fn respond(
        &self,
        request: &Signal,
        responder: Address,
        payload: Payload,
    ) -> Result<(), BusError> {
        let response = Signal::respond_to(request, responder, payload);
        self.commands
            .send(Command::Respond { response })
            .map_err(|_| BusError::Closed)
    }

    /// Cancels every outstanding request owned by `owner`. Each caller
    /// receives a cancellation outcome; a `request_cancelled` event is
    /// emitted to the owner's address.
    pub fn cancel_owned(&self, owner: Address) -> Result<(), BusError> {
        self.commands
            .send(Command::CancelOwned { owner })
            .map_err(|_| BusError::Closed)
    }
}

/// The bus task. Owns the subscription table and the pending-response map;
/// carries no domain state.
pub struct Bus {
    settings: BusSettings,
    fault: FaultReporter,
    commands: mpsc::UnboundedReceiver<Command>,
    subscriptions: Vec<SubEntry>,
    pending: HashMap<SignalId, PendingRequest>,
    next_subscription: u64,
}

impl Bus {
    /// Spawns the bus task and returns the handle to reach it.
    pub fn spawn(settings: BusSettings, fault: FaultReporter) -> (BusHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BusHandle {
            commands: tx,
            fault: fault.clone(),
        };
        let bus = Self {
            settings,
            fault,
            commands: rx,
            subscriptions: Vec::new(),
            pending: HashMap::new(),
            next_subscription: 0,
        };
        let join = tokio::spawn(bus.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!("bus started");
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let sleep_target =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = sleep_until(sleep_target), if next_deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
        // Shutdown: unblock every receiver and fail every pending request.
        for entry in &self.subscriptions {
            entry.mailbox.close();
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(RequestError::Closed));
        }
        info!("bus stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { filter, reply } => {
                self.next_subscription += 1;
                let id = SubscriptionId(self.next_subscription);
                let mailbox = Arc::new(Mailbox::new(self.settings.mailbox));
                self.subscriptions.push(SubEntry {
                    id,
                    filter: filter.clone(),
                    mailbox: Arc::clone(&mailbox),
                });
                debug!(%filter, ?id, "subscribed");
                let _ = reply.send((id, mailbox));
            }
            Command::Unsubscribe { id } => {
                if let Some(index) = self.subscriptions.iter().position(|e| e.id == id) {
                    let entry = self.subscriptions.swap_remove(index);
                    entry.mailbox.close();
                    debug!(filter = %entry.filter, ?id, "unsubscribed");
                }
            }
            Command::Emit { signal } => {
                self.deliver(&signal);
            }
            Command::Request { signal, reply } => self.handle_request(signal, reply),
            Command::Respond { response } => match self.pending.remove(&response.signal_id) {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(response));
                }
                None => {
                    // Late or unsolicited: dropped silently per protocol.
                    debug!(signal_id = %response.signal_id, "response with no pending request dropped");
                }
            },
            Command::CancelOwned { owner } => self.cancel_owned(&owner),
        }
    }

    fn handle_request(
        &mut self,
        signal: Signal,
        reply: oneshot::Sender<Result<Signal, RequestError>>,
    ) {
        let timeout = signal
            .timeout()
            .unwrap_or(self.settings.default_request_timeout);
        let delivered = self.deliver(&signal);
        if delivered == 0 {
            let target = signal.target_address.clone();
            self.fault.report(FaultRecord::new(
                target.clone(),
                FaultFamily::AddressUnknown,
                Severity::Low,
                format!("request {} found no subscriber", signal.signal_type),
            ));
            let _ = reply.send(Err(RequestError::AddressUnknown { target }));
            return;
        }
        self.pending.insert(
            signal.signal_id,
            PendingRequest {
                reply,
                deadline: Instant::now() + timeout,
                caller: signal.caller_address.clone(),
            },
        );
    }

    /// Fans out to every subscription matching the target address. Returns
    /// the number of mailboxes that accepted the signal.
    fn deliver(&mut self, signal: &Signal) -> usize {
        let mut delivered = 0;
        for entry in &self.subscriptions {
            if !signal.target_address.matches_prefix(&entry.filter) {
                continue;
            }
            match entry.mailbox.push(signal.clone()) {
                PushOutcome::Delivered => delivered += 1,
                PushOutcome::DeliveredWithEviction(evicted) => {
                    delivered += 1;
                    warn!(
                        filter = %entry.filter,
                        evicted,
                        "critical delivery evicted queued low-class signals"
                    );
                }
                PushOutcome::Dropped => {
                    self.fault.report(FaultRecord::new(
                        Address::bus(),
                        FaultFamily::ResourceUnavailable,
                        Severity::Medium,
                        format!(
                            "mailbox {} under backpressure dropped {} from {}",
                            entry.filter, signal.signal_type, signal.caller_address
                        ),
                    ));
                }
            }
        }
        delivered
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<SignalId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for signal_id in expired {
            let Some(pending) = self.pending.remove(&signal_id) else {
                continue;
            };
            let fault = FaultRecord::new(
                Address::bus(),
                FaultFamily::Timeout,
                Severity::Medium,
                format!("request {signal_id} from {} timed out", pending.caller),
            );
            let fault_code = fault.fault_code.clone();
            self.fault.report(fault);
            let _ = pending.reply.send(Err(RequestError::Timeout { fault_code }));
        }
    }

    fn cancel_owned(&mut self, owner: &Address) {
        let cancelled: Vec<SignalId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.caller == *owner)
            .map(|(id, _)| *id)
            .collect();
        if cancelled.is_empty() {
            return;
        }
        for signal_id in cancelled {
            if let Some(pending) = self.pending.remove(&signal_id) {
                let _ = pending.reply.send(Err(RequestError::Cancelled));
            }
            let mut payload = Payload::new();
            payload.insert("signal_id".into(), signal_id.to_string().into());
            let event = Signal::notify(
                Address::bus(),
                owner.clone(),
                "request_cancelled",
                payload,
            );
            self.deliver(&event);
        }
        info!(%owner, "cancelled outstanding requests");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_types::RadioCode;

    fn start() -> (BusHandle, FaultReporter, mpsc::UnboundedReceiver<FaultRecord>) {
        let (fault, faults_rx) = FaultReporter::channel();
        let (handle, _join) = Bus::spawn(BusSettings::default(), fault.clone());
        (handle, fault, faults_rx)
    }

    fn addr(raw: &str) -> Address {
        Address::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn emit_fans_out_to_exact_and_prefix_subscribers() {
        let (bus, _fault, _faults) = start();
        let exact = bus.subscribe(addr("2-2.complete")).await.unwrap();
        let prefix = bus.subscribe(addr("2-2")).await.unwrap();
        let other = bus.subscribe(addr("2-1")).await.unwrap();

        bus.emit(Signal::notify(
            addr("2-1"),
            addr("2-2.complete"),
            "gateway.section.complete",
            Payload::new(),
        ))
        .unwrap();

        assert_eq!(
            exact.recv().await.unwrap().signal_type,
            "gateway.section.complete"
        );
        assert_eq!(
            prefix.recv().await.unwrap().signal_type,
            "gateway.section.complete"
        );
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn per_sender_delivery_preserves_emission_order() {
        let (bus, _fault, _faults) = start();
        let sub = bus.subscribe(addr("1-1")).await.unwrap();
        for n in 0..50 {
            let mut payload = Payload::new();
            payload.insert("n".into(), serde_json::json!(n));
            bus.emit(Signal::notify(addr("2-2"), addr("1-1"), "seq", payload))
                .unwrap();
        }
        for n in 0..50 {
            let signal = sub.recv().await.unwrap();
            assert_eq!(signal.payload["n"], serde_json::json!(n));
        }
    }

    #[tokio::test]
    async fn request_resolves_with_response() {
        let (bus, _fault, _faults) = start();
        let controller = bus.subscribe(addr("2-1")).await.unwrap();

        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let request = controller.recv().await.unwrap();
                let mut payload = Payload::new();
                payload.insert("eligible".into(), serde_json::json!(true));
                bus.respond(&request, addr("2-1"), payload).unwrap();
            })
        };

        let response = bus
            .request(Signal::request(
                addr("2-2"),
                addr("2-1"),
                "controller.can_run",
                RadioCode::TenSix,
                Payload::new(),
            ))
            .await
            .unwrap();
        assert_eq!(response.payload["eligible"], serde_json::json!(true));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_with_bus_fault_and_drops_late_response() {
        let (bus, _fault, mut faults) = start();
        let silent = bus.subscribe(addr("4-5")).await.unwrap();

        let request = Signal::request(
            addr("2-2"),
            addr("4-5"),
            "section.prepare",
            RadioCode::TenSix,
            Payload::new(),
        )
        .with_timeout(Duration::from_secs(30));
        let pending = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request(request).await })
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = pending.await.unwrap();
        match outcome {
            Err(RequestError::Timeout { fault_code }) => {
                assert_eq!(fault_code.to_string(), "Bus-1-20");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.fault_code.to_string(), "Bus-1-20");

        // A late response finds no pending entry and is dropped silently.
        let stale = silent.try_recv().unwrap();
        bus.respond(&stale, addr("4-5"), Payload::new()).unwrap();
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn request_to_unknown_address_fails_with_24() {
        let (bus, _fault, mut faults) = start();
        let outcome = bus
            .request(Signal::request(
                addr("2-2"),
                addr("9-9"),
                "nobody.home",
                RadioCode::TenSix,
                Payload::new(),
            ))
            .await;
        match outcome {
            Err(RequestError::AddressUnknown { target }) => {
                assert_eq!(target.as_str(), "9-9");
            }
            other => panic!("expected address unknown, got {other:?}"),
        }
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.fault_code.to_string(), "9-9-24");
    }

    #[tokio::test]
    async fn cancel_owned_resolves_requests_and_notifies_owner() {
        let (bus, _fault, _faults) = start();
        let _target = bus.subscribe(addr("4-3")).await.unwrap();
        let owner_events = bus.subscribe(addr("2-2")).await.unwrap();

        let pending = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request(Signal::request(
                    addr("2-2"),
                    addr("4-3"),
                    "section.execute",
                    RadioCode::TenTen,
                    Payload::new(),
                ))
                .await
            })
        };
        tokio::task::yield_now().await;

        bus.cancel_owned(addr("2-2")).unwrap();
        match pending.await.unwrap() {
            Err(RequestError::Cancelled) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        let event = owner_events.recv().await.unwrap();
        assert_eq!(event.signal_type, "request_cancelled");
    }

    #[tokio::test]
    async fn malformed_wire_envelope_raises_validation_fault() {
        let (bus, _fault, mut faults) = start();
        let err = bus.emit_wire("{\"signal_id\": 7}");
        assert!(matches!(err, Err(BusError::InvalidEnvelope(_))));
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.fault_code.to_string(), "Bus-1-31");
    }

    #[tokio::test]
    async fn valid_wire_envelope_is_routed() {
        let (bus, _fault, _faults) = start();
        let sub = bus.subscribe(addr("1-1")).await.unwrap();
        let signal = Signal::notify(addr("2-2"), addr("1-1"), "evidence.checkout", Payload::new());
        bus.emit_wire(&signal.to_wire().unwrap()).unwrap();
        assert_eq!(sub.recv().await.unwrap().signal_id, signal.signal_id);
    }
}
