//! The gateway actor.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use dossier_bus::{BusHandle, FaultReporter, RequestError, Subscription};
use dossier_types::{
    Address, ContentHash, EvidenceId, EvidenceKind, FaultFamily, FaultRecord, Payload, RadioCode,
    SectionId, Severity, Signal,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::InputEnvelope;
use crate::routing::RoutingTable;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),

    #[error("bus request failed: {0}")]
    Request(#[from] RequestError),

    /// The controller rejected the operation; carries its fault code.
    #[error("controller refused ({fault_code}): {message}")]
    Controller { fault_code: String, message: String },
}

/// The gateway task. Listens at `2-2`, watches the locker and controller
/// event streams, publishes section completions on `2-2.complete`.
pub struct Gateway {
    bus: BusHandle,
    fault: FaultReporter,
    inbox: Subscription,
    locker_events: Subscription,
    controller_events: Subscription,
    complete_stream: Address,
    routing: RoutingTable,
    /// Evidence delivered per section, in delivery order.
    delivered: BTreeMap<SectionId, Vec<EvidenceId>>,
    /// Latest payload each section published.
    published: BTreeMap<SectionId, Payload>,
    /// Prepare counter per section; becomes the envelope `run`.
    runs: BTreeMap<SectionId, u32>,
    /// Bumped on every accepted mutation; stamps every snapshot.
    version: u64,
}

impl Gateway {
    /// Subscribes and spawns the gateway task.
    pub async fn spawn(
        routing: RoutingTable,
        bus: BusHandle,
        fault: FaultReporter,
    ) -> Result<JoinHandle<()>, GatewayError> {
        let inbox = bus.subscribe(Address::gateway()).await?;
        let locker_events = bus
            .subscribe(Address::locker().component("events").expect("valid address"))
            .await?;
        let controller_events = bus
            .subscribe(Address::controller().component("events").expect("valid address"))
            .await?;
        let complete_stream = Address::gateway().component("complete").expect("valid address");
        let gateway = Self {
            bus,
            fault,
            inbox,
            locker_events,
            controller_events,
            complete_stream,
            routing,
            delivered: BTreeMap::new(),
            published: BTreeMap::new(),
            runs: BTreeMap::new(),
            version: 0,
        };
        Ok(tokio::spawn(gateway.run()))
    }

    async fn run(mut self) {
        info!("gateway started");
        loop {
            tokio::select! {
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.handle_directed(signal).await,
                    None => break,
                },
                signal = self.locker_events.recv() => match signal {
                    Some(signal) => self.handle_locker_event(&signal),
                    None => break,
                },
                signal = self.controller_events.recv() => match signal {
                    Some(signal) => self.handle_controller_event(&signal),
                    None => break,
                },
            }
        }
        info!("gateway stopped");
    }

    async fn handle_directed(&mut self, signal: Signal) {
        if matches!(
            signal.radio_code,
            RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
        ) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("gateway"));
            let _ = self.bus.respond(&signal, Address::gateway(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "gateway.prepare_section" => self.handle_prepare(&signal).await,
            "section.publish" => self.handle_publish(&signal).await,
            "section.request_revision" => self.handle_revision(&signal).await,
            "gateway.snapshot" => self.answer_snapshot(&signal),
            other => debug!(signal_type = other, "gateway ignoring signal"),
        }
    }

    // ------------------------------------------------------------------
    // Evidence routing
    // ------------------------------------------------------------------

    fn handle_locker_event(&mut self, signal: &Signal) {
        if signal.signal_type != "evidence.indexed" {
            return;
        }
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            warn!("evidence.indexed without a parseable evidence_id");
            return;
        };
        let Some(kind) = signal
            .payload
            .get("kind")
            .and_then(Value::as_str)
            .and_then(|k| serde_json::from_value::<EvidenceKind>(json!(k)).ok())
        else {
            warn!(%evidence_id, "evidence.indexed without a parseable kind");
            return;
        };
        let classification = signal
            .payload
            .get("classification")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tags: BTreeSet<String> = signal
            .payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let targets = self
            .routing
            .routes_for(kind, classification.as_deref(), &tags);
        if targets.is_empty() {
            debug!(%evidence_id, "no routing rule matched");
            return;
        }

        let mut routed = false;
        for section_id in &targets {
            let slice = self.delivered.entry(*section_id).or_default();
            if slice.contains(&evidence_id) {
                continue;
            }
            slice.push(evidence_id);
            routed = true;

            let mut payload = Payload::new();
            payload.insert("section_id".into(), json!(section_id.as_str()));
            payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
            let _ = self.bus.emit(Signal::notify(
                Address::gateway(),
                Address::section(*section_id),
                "evidence.deliver",
                payload,
            ));
        }

        if !routed {
            return;
        }
        self.version += 1;

        // The locker tracks dispatch in the item status.
        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
        let _ = self.bus.emit(Signal::notify(
            Address::gateway(),
            Address::locker(),
            "locker.mark_dispatched",
            payload,
        ));
    }

    // ------------------------------------------------------------------
    // Section preparation (order lock)
    // ------------------------------------------------------------------

    async fn handle_prepare(&mut self, signal: &Signal) {
        let Some(section_id) = parse_section(&signal.payload) else {
            self.respond_err(signal, "2-2-31", "section_id is required");
            return;
        };

        // Order lock: every dependency must be COMPLETED before this
        // section may even be prepared.
        match self.controller_query_can_run(section_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.fault.report(FaultRecord::new(
                    Address::gateway(),
                    FaultFamily::Forbidden,
                    Severity::Medium,
                    format!("order lock refused prepare of section {section_id}"),
                ));
                self.respond_err(
                    signal,
                    "2-2-52",
                    &format!("section {section_id} is not eligible to run"),
                );
                return;
            }
            Err(error) => {
                self.respond_err(signal, "2-2-60", &error.to_string());
                return;
            }
        }

        if let Err(error) = self
            .controller_command("controller.prepare", section_id, Payload::new())
            .await
        {
            self.respond_gateway_error(signal, &error);
            return;
        }

        // The section must be EXECUTING before its envelope lands: a fast
        // worker may publish (or check out evidence) the moment it sees
        // `section.data.updated`.
        if let Err(error) = self
            .controller_command("controller.start", section_id, Payload::new())
            .await
        {
            self.respond_gateway_error(signal, &error);
            return;
        }

        let envelope = self.compose_envelope(section_id);
        self.emit_data_updated(&envelope);

        let mut payload = Payload::new();
        payload.insert(
            "envelope".into(),
            serde_json::to_value(&envelope).unwrap_or(Value::Null),
        );
        self.respond_ok(signal, payload);
    }

    // ------------------------------------------------------------------
    // Payload publication
    // ------------------------------------------------------------------

    async fn handle_publish(&mut self, signal: &Signal) {
        let Some(section_id) = parse_section(&signal.payload) else {
            self.respond_err(signal, "2-2-31", "section_id is required");
            return;
        };
        let Some(Value::Object(body)) = signal.payload.get("payload") else {
            self.fault.report(FaultRecord::new(
                Address::gateway(),
                FaultFamily::Validation,
                Severity::Medium,
                format!("section {section_id} published a non-object payload"),
            ));
            self.respond_err(signal, "2-2-31", "payload must be a JSON object");
            return;
        };
        if body.is_empty() {
            self.respond_err(signal, "2-2-31", "payload must not be empty");
            return;
        }
        let body: Payload = body
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let payload_hash = hash_payload(&body);
        let input_evidence: Vec<String> = self
            .delivered
            .get(&section_id)
            .map(|ids| ids.iter().map(ToString::to_string).collect())
            .unwrap_or_default();

        let mut command = Payload::new();
        command.insert("payload_hash".into(), json!(payload_hash.to_string()));
        command.insert("input_evidence".into(), json!(input_evidence));
        match self
            .controller_command("controller.mark_complete", section_id, command)
            .await
        {
            Ok(_) => {
                self.published.insert(section_id, body);
                self.version += 1;
                let mut payload = Payload::new();
                payload.insert("payload_hash".into(), json!(payload_hash.to_string()));
                self.respond_ok(signal, payload);
            }
            Err(error) => self.respond_gateway_error(signal, &error),
        }
    }

    // ------------------------------------------------------------------
    // Revision mediation
    // ------------------------------------------------------------------

    async fn handle_revision(&mut self, signal: &Signal) {
        let Some(section_id) = parse_section(&signal.payload) else {
            self.respond_err(signal, "2-2-31", "section_id is required");
            return;
        };
        let mut command = Payload::new();
        if let Some(reason) = signal.payload.get("reason").and_then(Value::as_str) {
            command.insert("reason".into(), json!(reason));
        }
        match self
            .controller_command("controller.request_revision", section_id, command)
            .await
        {
            Ok(_) => {
                // Acceptance re-opens the section: the envelope the section
                // last saw, plus anything delivered since freeze.
                let envelope = self.compose_envelope(section_id);
                self.emit_data_updated(&envelope);
                let mut payload = Payload::new();
                payload.insert(
                    "envelope".into(),
                    serde_json::to_value(&envelope).unwrap_or(Value::Null),
                );
                self.respond_ok(signal, payload);
            }
            Err(error) => self.respond_gateway_error(signal, &error),
        }
    }

    // ------------------------------------------------------------------
    // Controller event relay
    // ------------------------------------------------------------------

    fn handle_controller_event(&mut self, signal: &Signal) {
        if signal.signal_type != "gateway.section.complete" {
            return;
        }
        let Some(section_id) = parse_section(&signal.payload) else {
            return;
        };
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(section_id.as_str()));
        if let Some(frozen) = signal.payload.get("frozen") {
            payload.insert("frozen".into(), frozen.clone());
        }
        if let Some(published) = self.published.get(&section_id) {
            payload.insert("payload".into(), json!(published));
        }
        let _ = self.bus.emit(
            Signal::notify(
                Address::gateway(),
                self.complete_stream.clone(),
                "gateway.section.complete",
                payload,
            )
            .with_radio_code(RadioCode::TenEight),
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn compose_envelope(&mut self, section_id: SectionId) -> InputEnvelope {
        let run = self.runs.entry(section_id).or_insert(0);
        *run += 1;
        let run = *run;
        self.version += 1;
        InputEnvelope::new(
            section_id,
            self.delivered.get(&section_id).cloned().unwrap_or_default(),
            run,
        )
    }

    fn emit_data_updated(&self, envelope: &InputEnvelope) {
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(envelope.section_id.as_str()));
        payload.insert(
            "envelope".into(),
            serde_json::to_value(envelope).unwrap_or(Value::Null),
        );
        let _ = self.bus.emit(Signal::notify(
            Address::gateway(),
            Address::section(envelope.section_id),
            "section.data.updated",
            payload,
        ));
    }

    /// A version-stamped read-only copy of the routing state.
    fn answer_snapshot(&self, signal: &Signal) {
        let delivered: BTreeMap<&str, Vec<String>> = self
            .delivered
            .iter()
            .map(|(id, ids)| (id.as_str(), ids.iter().map(ToString::to_string).collect()))
            .collect();
        let runs: BTreeMap<&str, u32> = self
            .runs
            .iter()
            .map(|(id, run)| (id.as_str(), *run))
            .collect();
        let published: Vec<&str> = self.published.keys().map(|id| id.as_str()).collect();
        let mut payload = Payload::new();
        payload.insert("version".into(), json!(self.version));
        payload.insert("delivered".into(), json!(delivered));
        payload.insert("runs".into(), json!(runs));
        payload.insert("published".into(), json!(published));
        self.respond_ok(signal, payload);
    }

    async fn controller_query_can_run(&self, section_id: SectionId) -> Result<bool, GatewayError> {
        let payload = self
            .controller_command("controller.can_run", section_id, Payload::new())
            .await?;
        Ok(payload.get("can_run").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Sends one controller request, unwrapping the `{ok, ...}` convention.
    async fn controller_command(
        &self,
        signal_type: &str,
        section_id: SectionId,
        mut payload: Payload,
    ) -> Result<Payload, GatewayError> {
        payload.insert("section_id".into(), json!(section_id.as_str()));
        let response = self
            .bus
            .request(Signal::request(
                Address::gateway(),
                Address::controller(),
                signal_type,
                RadioCode::TenSix,
                payload,
            ))
            .await?;
        let ok = response.payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            Ok(response.payload)
        } else {
            Err(GatewayError::Controller {
                fault_code: response
                    .payload
                    .get("fault_code")
                    .and_then(Value::as_str)
                    .unwrap_or("2-1-51")
                    .to_string(),
                message: response
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("controller refused")
                    .to_string(),
            })
        }
    }

    fn respond_gateway_error(&self, signal: &Signal, error: &GatewayError) {
        match error {
            GatewayError::Controller { fault_code, message } => {
                self.respond_err(signal, fault_code, message);
            }
            other => self.respond_err(signal, "2-2-60", &other.to_string()),
        }
    }

    fn respond_ok(&self, signal: &Signal, mut payload: Payload) {
        if !signal.response_expected {
            return;
        }
        payload.insert("ok".into(), json!(true));
        let _ = self.bus.respond(signal, Address::gateway(), payload);
    }

    fn respond_err(&self, signal: &Signal, fault_code: &str, error: &str) {
        if !signal.response_expected {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("ok".into(), json!(false));
        payload.insert("fault_code".into(), json!(fault_code));
        payload.insert("error".into(), json!(error));
        let _ = self.bus.respond(signal, Address::gateway(), payload);
    }
}

/// Content-addresses a published payload: SHA-256 over its canonical JSON.
/// `Payload` is an ordered map, so the serialization is deterministic.
fn hash_payload(payload: &Payload) -> ContentHash {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    ContentHash::of(&canonical)
}

fn parse_section(payload: &Payload) -> Option<SectionId> {
    payload
        .get("section_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn parse_evidence_id(payload: &Payload) -> Option<EvidenceId> {
    payload
        .get("evidence_id")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(json!(s)).ok())
}
