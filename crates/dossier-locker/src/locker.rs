//! The locker actor: bus protocol, file IO, and the classification loop.
//!
//! Listens at `1-1`; publishes the evidence stream on `1-1.events`.
//! Manifest appends are serialized through this task, so two ingests of the
//! same bytes can never race into two ids.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dossier_bus::{BusHandle, FaultReporter, Subscription};
use dossier_types::{
    Address, Classification, ContentHash, CustodyAction, CustodyEntry, EvidenceId, EvidenceKind,
    FaultFamily, FaultRecord, Payload, RadioCode, Severity, Signal,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, ClassifierError, ClassifierSettings, classify_with_retry};
use crate::store::{EvidenceStore, IngestMeta, IngestOutcome, StoreError};

#[derive(Debug, Error)]
pub enum LockerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),
}

/// Tuning for the locker.
#[derive(Debug, Clone)]
pub struct LockerSettings {
    pub manifest_path: PathBuf,
    pub classifier: ClassifierSettings,
}

impl Default for LockerSettings {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from(".dossier/manifest.jsonl"),
            classifier: ClassifierSettings::default(),
        }
    }
}

/// Outcome of a background classification, fed back into the actor.
struct ClassificationDone {
    evidence_id: EvidenceId,
    result: Result<Classification, ClassifierError>,
    reclassify: bool,
}

/// The locker task.
pub struct Locker<C: Classifier> {
    settings: LockerSettings,
    bus: BusHandle,
    fault: FaultReporter,
    inbox: Subscription,
    events: Address,
    store: EvidenceStore,
    classifier: Arc<C>,
    done_tx: mpsc::UnboundedSender<ClassificationDone>,
    done_rx: mpsc::UnboundedReceiver<ClassificationDone>,
    in_flight: HashSet<EvidenceId>,
}

impl<C: Classifier> Locker<C> {
    /// Opens the store, subscribes at `1-1`, and spawns the locker task.
    pub async fn spawn(
        settings: LockerSettings,
        classifier: C,
        bus: BusHandle,
        fault: FaultReporter,
    ) -> Result<JoinHandle<()>, LockerError> {
        let store = EvidenceStore::open(&settings.manifest_path)?;
        let inbox = bus.subscribe(Address::locker()).await?;
        let events = Address::locker()
            .component("events")
            .expect("locker event address is valid");
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let locker = Self {
            settings,
            bus,
            fault,
            inbox,
            events,
            store,
            classifier: Arc::new(classifier),
            done_tx,
            done_rx,
            in_flight: HashSet::new(),
        };
        Ok(tokio::spawn(locker.run()))
    }

    async fn run(mut self) {
        info!(manifest = %self.settings.manifest_path.display(), "evidence locker started");
        loop {
            tokio::select! {
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.handle(signal).await,
                    None => break,
                },
                done = self.done_rx.recv() => {
                    if let Some(done) = done {
                        self.finish_classification(done);
                    }
                }
            }
        }
        info!("evidence locker stopped");
    }

    async fn handle(&mut self, signal: Signal) {
        if matches!(
            signal.radio_code,
            RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
        ) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("locker"));
            payload.insert("items".into(), json!(self.store.len()));
            let _ = self.bus.respond(&signal, Address::locker(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "locker.ingest" => self.handle_ingest(&signal).await,
            "locker.reclassify" => self.handle_reclassify(&signal),
            "locker.fetch" => self.handle_fetch(&signal).await,
            "locker.custody" => self.handle_custody(&signal),
            "locker.mark_dispatched" => self.handle_status_mark(&signal, Mark::Dispatched),
            "locker.mark_processed" => self.handle_status_mark(&signal, Mark::Processed),
            "locker.item" => self.answer_item(&signal),
            "locker.custody_export" => self.answer_custody_export(&signal),
            "locker.snapshot" => self.answer_snapshot(&signal),
            other => debug!(signal_type = other, "locker ignoring signal"),
        }
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    async fn handle_ingest(&mut self, signal: &Signal) {
        let Some(path) = string_field(&signal.payload, "path") else {
            self.respond_err(signal, "1-1-31", "path is required");
            return;
        };
        let kind = match string_field(&signal.payload, "kind")
            .map(|k| serde_json::from_value::<EvidenceKind>(json!(k)))
        {
            Some(Ok(kind)) => kind,
            Some(Err(_)) | None => {
                self.respond_err(signal, "1-1-31", "kind must be one of document|image|audio|video|text");
                return;
            }
        };
        let tags = string_set(&signal.payload, "tags");
        let section_hints = signal
            .payload
            .get("section_hints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.fault.report(FaultRecord::new(
                    Address::locker(),
                    FaultFamily::FileMissing,
                    Severity::Medium,
                    format!("ingest could not read {path}: {error}"),
                ));
                self.respond_err(signal, "1-1-70", &format!("cannot read {path}"));
                return;
            }
        };

        let meta = IngestMeta {
            path,
            kind,
            captured_at: None,
            tags,
            section_hints,
            actor: signal.caller_address.clone(),
        };
        match self.store.ingest(meta, &bytes) {
            Ok(outcome) => {
                self.announce_ingest(&outcome);
                if !outcome.duplicate && self.store.needs_classification(outcome.evidence_id) {
                    self.start_classification(outcome.evidence_id, kind, bytes, false);
                }
                let mut payload = Payload::new();
                payload.insert("evidence_id".into(), json!(outcome.evidence_id.to_string()));
                payload.insert("content_hash".into(), json!(outcome.content_hash.to_string()));
                payload.insert("duplicate".into(), json!(outcome.duplicate));
                self.respond_ok(signal, payload);
            }
            Err(error) => self.store_error(signal, &error),
        }
    }

    fn announce_ingest(&self, outcome: &IngestOutcome) {
        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(outcome.evidence_id.to_string()));
        payload.insert("content_hash".into(), json!(outcome.content_hash.to_string()));
        let signal_type = if outcome.duplicate {
            "evidence.duplicate"
        } else {
            "evidence.new"
        };
        let _ = self.bus.emit(Signal::notify(
            Address::locker(),
            self.events.clone(),
            signal_type,
            payload,
        ));
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    fn start_classification(
        &mut self,
        evidence_id: EvidenceId,
        kind: EvidenceKind,
        bytes: Vec<u8>,
        reclassify: bool,
    ) {
        if !self.in_flight.insert(evidence_id) {
            return;
        }
        let classifier = Arc::clone(&self.classifier);
        let settings = self.settings.classifier;
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = classify_with_retry(classifier.as_ref(), settings, kind, bytes).await;
            let _ = done_tx.send(ClassificationDone {
                evidence_id,
                result,
                reclassify,
            });
        });
    }

    fn handle_reclassify(&mut self, signal: &Signal) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        let Some(item) = self.store.item(evidence_id) else {
            self.respond_err(signal, "1-1-51", &format!("unknown evidence {evidence_id}"));
            return;
        };
        let kind = item.kind;
        let path = item.path.clone();
        // Explicit reclassify re-reads the bytes; the spawned read keeps the
        // actor free.
        let fault = self.fault.clone();
        let done_tx = self.done_tx.clone();
        let classifier = Arc::clone(&self.classifier);
        let settings = self.settings.classifier;
        if !self.in_flight.insert(evidence_id) {
            self.respond_err(signal, "1-1-52", "classification already in flight");
            return;
        }
        tokio::spawn(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let result =
                        classify_with_retry(classifier.as_ref(), settings, kind, bytes).await;
                    let _ = done_tx.send(ClassificationDone {
                        evidence_id,
                        result,
                        reclassify: true,
                    });
                }
                Err(error) => {
                    fault.report(FaultRecord::new(
                        Address::locker(),
                        FaultFamily::FileMissing,
                        Severity::Medium,
                        format!("reclassify could not read {path}: {error}"),
                    ));
                    let _ = done_tx.send(ClassificationDone {
                        evidence_id,
                        result: Err(ClassifierError::Failed(error.to_string())),
                        reclassify: true,
                    });
                }
            }
        });
        self.respond_ok(signal, Payload::new());
    }

    fn finish_classification(&mut self, done: ClassificationDone) {
        self.in_flight.remove(&done.evidence_id);
        let classification = match done.result {
            Ok(classification) => classification,
            Err(error) => {
                self.fault.report(FaultRecord::new(
                    Address::locker(),
                    FaultFamily::DataProcessing,
                    Severity::Medium,
                    format!("classification of {} exhausted: {error}", done.evidence_id),
                ));
                Classification::unknown()
            }
        };

        match self
            .store
            .record_classified(done.evidence_id, classification.clone(), done.reclassify)
        {
            Ok(true) => {
                let mut payload = Payload::new();
                payload.insert("evidence_id".into(), json!(done.evidence_id.to_string()));
                payload.insert("classification".into(), json!(classification.as_str()));
                let _ = self.bus.emit(Signal::notify(
                    Address::locker(),
                    self.events.clone(),
                    "evidence.classified",
                    payload,
                ));
                self.index_item(done.evidence_id);
            }
            Ok(false) => debug!(evidence_id = %done.evidence_id, "classification already recorded"),
            Err(error) => warn!(evidence_id = %done.evidence_id, %error, "classification not recorded"),
        }
    }

    /// Adds the item to the routing stream: `evidence.indexed` carries the
    /// attributes the gateway matches rules against.
    fn index_item(&mut self, evidence_id: EvidenceId) {
        if let Err(error) = self.store.record_indexed(evidence_id) {
            warn!(%evidence_id, %error, "index transition failed");
            return;
        }
        let item = self.store.item(evidence_id).expect("indexed item exists");
        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
        payload.insert("kind".into(), json!(item.kind.to_string()));
        payload.insert(
            "classification".into(),
            json!(item.classification.as_ref().map(Classification::as_str)),
        );
        payload.insert("tags".into(), json!(item.tags.iter().collect::<Vec<_>>()));
        let _ = self.bus.emit(
            Signal::notify(
                Address::locker(),
                self.events.clone(),
                "evidence.indexed",
                payload,
            )
            .with_radio_code(RadioCode::TenEight),
        );
    }

    // ------------------------------------------------------------------
    // Fetch (bytes checkout backend)
    // ------------------------------------------------------------------

    async fn handle_fetch(&mut self, signal: &Signal) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        let Some(item) = self.store.item(evidence_id) else {
            self.respond_err(signal, "1-1-51", &format!("unknown evidence {evidence_id}"));
            return;
        };
        if item.status == dossier_types::EvidenceStatus::Quarantined {
            self.respond_err(signal, "1-1-52", "evidence is quarantined");
            return;
        }
        let path = item.path.clone();
        let recorded_hash = item.content_hash;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.fault.report(FaultRecord::new(
                    Address::locker(),
                    FaultFamily::FileMissing,
                    Severity::Medium,
                    format!("fetch could not read {path}: {error}"),
                ));
                self.respond_err(signal, "1-1-70", &format!("cannot read {path}"));
                return;
            }
        };

        // Re-read integrity check: a file mutated after ingest is corruption.
        let rehash = ContentHash::of(&bytes);
        if rehash != recorded_hash {
            self.fault.report(FaultRecord::new(
                Address::locker(),
                FaultFamily::DataCorruption,
                Severity::High,
                format!("{path} hash mismatch: recorded {recorded_hash}, read {rehash}"),
            ));
            if let Err(error) = self.store.quarantine(evidence_id, "re-read hash mismatch") {
                warn!(%evidence_id, %error, "quarantine failed");
            }
            self.respond_err(signal, "1-1-32", "content hash mismatch; row quarantined");
            return;
        }

        let mut payload = Payload::new();
        payload.insert("evidence_id".into(), json!(evidence_id.to_string()));
        payload.insert("bytes_b64".into(), json!(BASE64.encode(&bytes)));
        payload.insert("content_hash".into(), json!(recorded_hash.to_string()));
        self.respond_ok(signal, payload);
    }

    // ------------------------------------------------------------------
    // Custody and status marks
    // ------------------------------------------------------------------

    fn handle_custody(&mut self, signal: &Signal) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        let action = match string_field(&signal.payload, "action").as_deref() {
            Some("checkout") => CustodyAction::Checkout,
            Some("returned") => CustodyAction::Returned,
            _ => {
                self.respond_err(signal, "1-1-31", "action must be checkout|returned");
                return;
            }
        };
        let mut entry = CustodyEntry::now(signal.caller_address.clone(), action);
        if let Some(note) = string_field(&signal.payload, "note") {
            entry = entry.with_note(note);
        }
        match self.store.append_custody(evidence_id, entry) {
            Ok(()) => self.respond_ok(signal, Payload::new()),
            Err(error) => self.store_error(signal, &error),
        }
    }

    fn handle_status_mark(&mut self, signal: &Signal, mark: Mark) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        let outcome = match mark {
            Mark::Dispatched => self.store.record_dispatched(evidence_id),
            Mark::Processed => self.store.record_processed(evidence_id),
        };
        match outcome {
            Ok(()) => self.respond_ok(signal, Payload::new()),
            Err(error) => self.store_error(signal, &error),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn answer_item(&self, signal: &Signal) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        match self.store.item(evidence_id) {
            Some(item) => {
                let mut payload = Payload::new();
                payload.insert("item".into(), serde_json::to_value(item).unwrap_or(Value::Null));
                self.respond_ok(signal, payload);
            }
            None => self.respond_err(signal, "1-1-51", &format!("unknown evidence {evidence_id}")),
        }
    }

    fn answer_snapshot(&self, signal: &Signal) {
        let snapshot = self.store.snapshot();
        let mut payload = Payload::new();
        payload.insert(
            "snapshot".into(),
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
        self.respond_ok(signal, payload);
    }

    fn answer_custody_export(&self, signal: &Signal) {
        let Some(evidence_id) = parse_evidence_id(&signal.payload) else {
            self.respond_err(signal, "1-1-31", "evidence_id is required");
            return;
        };
        match self.store.custody_export(evidence_id) {
            Ok(export) => {
                let mut payload = Payload::new();
                payload.insert("export".into(), export);
                self.respond_ok(signal, payload);
            }
            Err(error) => self.store_error(signal, &error),
        }
    }

    // ------------------------------------------------------------------
    // Response plumbing
    // ------------------------------------------------------------------

    fn respond_ok(&self, signal: &Signal, mut payload: Payload) {
        if !signal.response_expected {
            return;
        }
        payload.insert("ok".into(), json!(true));
        let _ = self.bus.respond(signal, Address::locker(), payload);
    }

    fn respond_err(&self, signal: &Signal, fault_code: &str, error: &str) {
        if !signal.response_expected {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("ok".into(), json!(false));
        payload.insert("fault_code".into(), json!(fault_code));
        payload.insert("error".into(), json!(error));
        let _ = self.bus.respond(signal, Address::locker(), payload);
    }

    fn store_error(&self, signal: &Signal, error: &StoreError) {
        let code = match error {
            StoreError::Manifest(_) => "1-1-80",
            StoreError::UnknownEvidence(_) => "1-1-51",
            StoreError::Quarantined(_) => "1-1-52",
        };
        self.respond_err(signal, code, &error.to_string());
    }
}

enum Mark {
    Dispatched,
    Processed,
}

fn string_field(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_set(payload: &Payload, key: &str) -> std::collections::BTreeSet<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_evidence_id(payload: &Payload) -> Option<EvidenceId> {
    string_field(payload, "evidence_id")
        .and_then(|s| serde_json::from_value(json!(s)).ok())
}
