//! The debrief actor.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dossier_bus::{BusHandle, FaultReporter, Subscription};
use dossier_types::{
    Address, ContentHash, Payload, RadioCode, ReportType, SectionId, Severity, Signal,
};
use ed25519_dalek::SigningKey;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assembly::{ReportAssembler, SectionEntry};
use crate::signing::{ReportBundle, sign_document};

#[derive(Debug, Error)]
pub enum DebriefError {
    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),
}

/// The debrief task. Listens at `3-1`, watches the gateway completion
/// stream, publishes `report.ready` on `3-1.events`.
pub struct Debrief {
    bus: BusHandle,
    fault: FaultReporter,
    inbox: Subscription,
    completions: Subscription,
    events: Address,
    assembler: ReportAssembler,
    signing_key: SigningKey,
    /// The packaged bundle once the full graph has completed.
    bundle: Option<ReportBundle>,
    /// Bumped on every collected completion; stamps every snapshot.
    version: u64,
}

impl Debrief {
    pub async fn spawn(
        case_name: impl Into<String>,
        report_type: ReportType,
        signing_key: SigningKey,
        bus: BusHandle,
        fault: FaultReporter,
    ) -> Result<JoinHandle<()>, DebriefError> {
        let inbox = bus.subscribe(Address::debrief()).await?;
        let completions = bus
            .subscribe(Address::gateway().component("complete").expect("valid address"))
            .await?;
        let events = Address::debrief().component("events").expect("valid address");
        let debrief = Self {
            bus,
            fault,
            inbox,
            completions,
            events,
            assembler: ReportAssembler::new(case_name, report_type),
            signing_key,
            bundle: None,
            version: 0,
        };
        Ok(tokio::spawn(debrief.run()))
    }

    async fn run(mut self) {
        info!("mission debrief started");
        loop {
            tokio::select! {
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.handle(&signal),
                    None => break,
                },
                signal = self.completions.recv() => match signal {
                    Some(signal) => self.handle_completion(&signal),
                    None => break,
                },
            }
        }
        info!("mission debrief stopped");
    }

    fn handle(&mut self, signal: &Signal) {
        if matches!(
            signal.radio_code,
            RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
        ) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("debrief"));
            payload.insert("collected".into(), json!(self.assembler.collected_count()));
            let _ = self.bus.respond(signal, Address::debrief(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "debrief.assemble" => {
                // Partial assembly is always available; a case stopped by a
                // HIGH fault still yields what completed.
                let document = self.assembler.assemble();
                let mut payload = Payload::new();
                payload.insert("complete".into(), json!(document.complete));
                payload.insert("collected".into(), json!(document.sections.len()));
                payload.insert(
                    "document".into(),
                    serde_json::to_value(&document).unwrap_or(Value::Null),
                );
                self.respond_ok(signal, payload);
            }
            "debrief.report" => {
                let bundle = match &self.bundle {
                    Some(bundle) => bundle.clone(),
                    // Sign whatever exists right now.
                    None => sign_document(&self.assembler.assemble(), &self.signing_key),
                };
                let mut payload = Payload::new();
                payload.insert(
                    "manifest".into(),
                    serde_json::to_value(&bundle.manifest).unwrap_or(Value::Null),
                );
                payload.insert("blob_b64".into(), json!(BASE64.encode(&bundle.blob)));
                payload.insert("signature_b64".into(), json!(BASE64.encode(&bundle.signature)));
                payload.insert(
                    "verifying_key_b64".into(),
                    json!(BASE64.encode(&bundle.verifying_key)),
                );
                self.respond_ok(signal, payload);
            }
            "debrief.snapshot" => {
                // Version-stamped read-only view of the assembly state.
                let collected: Vec<&str> = self
                    .assembler
                    .collected_sections()
                    .into_iter()
                    .map(SectionId::as_str)
                    .collect();
                let mut payload = Payload::new();
                payload.insert("version".into(), json!(self.version));
                payload.insert("collected".into(), json!(collected));
                payload.insert("complete".into(), json!(self.assembler.is_complete()));
                payload.insert(
                    "digest".into(),
                    json!(self.bundle.as_ref().map(|b| b.manifest.digest.to_string())),
                );
                self.respond_ok(signal, payload);
            }
            other => debug!(signal_type = other, "debrief ignoring signal"),
        }
    }

    fn handle_completion(&mut self, signal: &Signal) {
        if signal.signal_type != "gateway.section.complete" {
            return;
        }
        let Some(entry) = parse_completion(&signal.payload) else {
            warn!("completion event missing section or frozen payload");
            self.fault.report(dossier_types::FaultRecord::new(
                Address::debrief(),
                dossier_types::FaultFamily::Validation,
                Severity::Medium,
                "malformed gateway.section.complete event",
            ));
            return;
        };
        let section_id = entry.section_id;
        self.assembler.record(entry);
        self.version += 1;
        debug!(%section_id, collected = self.assembler.collected_count(), "section collected");

        if self.assembler.is_complete() && self.bundle.is_none() {
            let document = self.assembler.assemble();
            let bundle = sign_document(&document, &self.signing_key);
            info!(digest = %bundle.manifest.digest, "report assembled and signed");

            let mut payload = Payload::new();
            payload.insert("digest".into(), json!(bundle.manifest.digest.to_string()));
            payload.insert("sections".into(), json!(bundle.manifest.sections.len()));
            payload.insert("complete".into(), json!(true));
            let _ = self.bus.emit(
                Signal::notify(
                    Address::debrief(),
                    self.events.clone(),
                    "report.ready",
                    payload,
                )
                .with_radio_code(RadioCode::TenEight),
            );
            self.bundle = Some(bundle);
        }
    }

    fn respond_ok(&self, signal: &Signal, mut payload: Payload) {
        if !signal.response_expected {
            return;
        }
        payload.insert("ok".into(), json!(true));
        let _ = self.bus.respond(signal, Address::debrief(), payload);
    }
}

fn parse_completion(payload: &Payload) -> Option<SectionEntry> {
    let section_id = payload
        .get("section_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<SectionId>().ok())?;
    let frozen = payload.get("frozen")?;
    let payload_hash = frozen
        .get("payload_hash")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<ContentHash>().ok())?;
    let frozen_at = frozen
        .get("frozen_at")
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        .unwrap_or_else(Utc::now);
    let body: Payload = match payload.get("payload") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Payload::new(),
    };
    Some(SectionEntry {
        section_id,
        payload_hash,
        payload: body,
        frozen_at,
    })
}
