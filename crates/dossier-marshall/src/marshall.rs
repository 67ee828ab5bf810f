//! The marshall actor.

use std::collections::{BTreeMap, BTreeSet};

use dossier_bus::{BusHandle, FaultReporter, Subscription};
use dossier_types::{
    Address, EvidenceId, FaultFamily, FaultRecord, Payload, RadioCode, SectionId, Severity, Signal,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MarshallError {
    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),
}

/// The marshall task. Listens at `5-2`.
pub struct Marshall {
    bus: BusHandle,
    fault: FaultReporter,
    inbox: Subscription,
    /// Open checkouts per section; cleared on return or forced release.
    outstanding: BTreeMap<SectionId, BTreeSet<EvidenceId>>,
    /// Bumped on every accepted custody mutation; stamps every snapshot.
    version: u64,
}

impl Marshall {
    pub async fn spawn(bus: BusHandle, fault: FaultReporter) -> Result<JoinHandle<()>, MarshallError> {
        let inbox = bus.subscribe(Address::marshall()).await?;
        let marshall = Self {
            bus,
            fault,
            inbox,
            outstanding: BTreeMap::new(),
            version: 0,
        };
        Ok(tokio::spawn(marshall.run()))
    }

    async fn run(mut self) {
        info!("evidence marshall started");
        while let Some(signal) = self.inbox.recv().await {
            self.handle(signal).await;
        }
        info!("evidence marshall stopped");
    }

    async fn handle(&mut self, signal: Signal) {
        if matches!(
            signal.radio_code,
            RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
        ) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("marshall"));
            let _ = self.bus.respond(&signal, Address::marshall(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "evidence.checkout" => self.handle_checkout(&signal).await,
            "evidence.return" => self.handle_return(&signal),
            "marshall.release_all" => self.handle_release_all(&signal),
            "marshall.outstanding" => self.answer_outstanding(&signal),
            "marshall.snapshot" => self.answer_snapshot(&signal),
            other => debug!(signal_type = other, "marshall ignoring signal"),
        }
    }

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    async fn handle_checkout(&mut self, signal: &Signal) {
        let Some((section_id, evidence_id)) = parse_pair(&signal.payload) else {
            self.respond_err(signal, "5-2-31", "section_id and evidence_id are required");
            return;
        };

        // Only EXECUTING sections may hold evidence bytes.
        match self.section_state(section_id).await {
            Ok(state) if state == "EXECUTING" => {}
            Ok(state) => {
                self.fault.report(FaultRecord::new(
                    Address::marshall(),
                    FaultFamily::Forbidden,
                    Severity::Medium,
                    format!("section {section_id} attempted checkout while {state}"),
                ));
                self.respond_err(
                    signal,
                    "5-2-52",
                    &format!("checkout denied: section {section_id} is {state}, not EXECUTING"),
                );
                return;
            }
            Err(error) => {
                self.respond_err(signal, "5-2-60", &error);
                return;
            }
        }

        // Fetch the bytes from the locker; it performs the integrity
        // re-read and may quarantine.
        let mut fetch = Payload::new();
        fetch.insert("evidence_id".into(), json!(evidence_id.to_string()));
        let response = self
            .bus
            .request(Signal::request(
                Address::marshall(),
                Address::locker(),
                "locker.fetch",
                RadioCode::TenSix,
                fetch,
            ))
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.respond_err(signal, "5-2-60", &error.to_string());
                return;
            }
        };
        if response.payload.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = response
                .payload
                .get("fault_code")
                .and_then(Value::as_str)
                .unwrap_or("5-2-60");
            let error = response
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("locker refused fetch");
            self.respond_err(signal, code, error);
            return;
        }

        self.record_custody(section_id, evidence_id, "checkout", None);
        self.outstanding
            .entry(section_id)
            .or_default()
            .insert(evidence_id);
        self.version += 1;

        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
        if let Some(bytes) = response.payload.get("bytes_b64") {
            payload.insert("bytes_b64".into(), bytes.clone());
        }
        if let Some(hash) = response.payload.get("content_hash") {
            payload.insert("content_hash".into(), hash.clone());
        }
        self.respond_ok(signal, payload);
    }

    // ------------------------------------------------------------------
    // Return
    // ------------------------------------------------------------------

    fn handle_return(&mut self, signal: &Signal) {
        let Some((section_id, evidence_id)) = parse_pair(&signal.payload) else {
            self.respond_err(signal, "5-2-31", "section_id and evidence_id are required");
            return;
        };
        let notes = signal
            .payload
            .get("notes")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.record_custody(section_id, evidence_id, "returned", notes);
        if let Some(open) = self.outstanding.get_mut(&section_id) {
            open.remove(&evidence_id);
        }
        self.version += 1;
        self.respond_ok(signal, Payload::new());
    }

    /// Forced release on cancellation or section failure: every open
    /// checkout for the section gains a `returned` custody entry.
    fn handle_release_all(&mut self, signal: &Signal) {
        let Some(section_id) = parse_section(&signal.payload) else {
            self.respond_err(signal, "5-2-31", "section_id is required");
            return;
        };
        let open = self.outstanding.remove(&section_id).unwrap_or_default();
        let released = open.len();
        if released > 0 {
            warn!(%section_id, released, "force-releasing checked-out evidence");
            self.version += 1;
        }
        for evidence_id in open {
            self.record_custody(
                section_id,
                evidence_id,
                "returned",
                Some("released on cancellation".to_string()),
            );
        }
        let mut payload = Payload::new();
        payload.insert("released".into(), json!(released));
        self.respond_ok(signal, payload);
    }

    fn answer_outstanding(&self, signal: &Signal) {
        let Some(section_id) = parse_section(&signal.payload) else {
            self.respond_err(signal, "5-2-31", "section_id is required");
            return;
        };
        let open: Vec<String> = self
            .outstanding
            .get(&section_id)
            .map(|ids| ids.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        let mut payload = Payload::new();
        payload.insert("outstanding".into(), json!(open));
        self.respond_ok(signal, payload);
    }

    /// A version-stamped read-only copy of the custody ledger.
    fn answer_snapshot(&self, signal: &Signal) {
        let outstanding: BTreeMap<&str, Vec<String>> = self
            .outstanding
            .iter()
            .map(|(id, ids)| (id.as_str(), ids.iter().map(ToString::to_string).collect()))
            .collect();
        let mut payload = Payload::new();
        payload.insert("version".into(), json!(self.version));
        payload.insert("outstanding".into(), json!(outstanding));
        self.respond_ok(signal, payload);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn section_state(&self, section_id: SectionId) -> Result<String, String> {
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(section_id.as_str()));
        let response = self
            .bus
            .request(Signal::request(
                Address::marshall(),
                Address::controller(),
                "controller.section_state",
                RadioCode::TenSix,
                payload,
            ))
            .await
            .map_err(|e| e.to_string())?;
        if response.payload.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(response
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("controller refused")
                .to_string());
        }
        Ok(response
            .payload
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn record_custody(
        &self,
        section_id: SectionId,
        evidence_id: EvidenceId,
        action: &str,
        note: Option<String>,
    ) {
        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
        payload.insert("action".into(), json!(action));
        payload.insert(
            "note".into(),
            json!(note.unwrap_or_else(|| format!("section {section_id}"))),
        );
        let _ = self.bus.emit(Signal::notify(
            Address::section(section_id),
            Address::locker(),
            "locker.custody",
            payload,
        ));
    }

    fn respond_ok(&self, signal: &Signal, mut payload: Payload) {
        if !signal.response_expected {
            return;
        }
        payload.insert("ok".into(), json!(true));
        let _ = self.bus.respond(signal, Address::marshall(), payload);
    }

    fn respond_err(&self, signal: &Signal, fault_code: &str, error: &str) {
        if !signal.response_expected {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("ok".into(), json!(false));
        payload.insert("fault_code".into(), json!(fault_code));
        payload.insert("error".into(), json!(error));
        let _ = self.bus.respond(signal, Address::marshall(), payload);
    }
}

fn parse_section(payload: &Payload) -> Option<SectionId> {
    payload
        .get("section_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn parse_pair(payload: &Payload) -> Option<(SectionId, EvidenceId)> {
    let section = parse_section(payload)?;
    let evidence = payload
        .get("evidence_id")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(json!(s)).ok())?;
    Some((section, evidence))
}
