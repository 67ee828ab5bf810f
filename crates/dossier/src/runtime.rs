//! The case runtime: constructs and wires every subsystem.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dossier_bus::{Bus, BusHandle, BusSettings, FaultReporter, MailboxSettings, Subscription};
use dossier_config::DossierConfig;
use dossier_control::{Controller, ControllerSettings};
use dossier_debrief::{Debrief, ReportBundle};
use dossier_diagnostics::{
    RepairQueueSettings, Supervisor, SupervisorSettings, SurfaceFault, VaultSettings,
};
use dossier_gateway::{Gateway, RoutingTable};
use dossier_locker::{Classifier, ClassifierSettings, Locker, LockerSettings};
use dossier_marshall::Marshall;
use dossier_types::{
    Address, ContentHash, EvidenceId, EvidenceKind, FaultFamily, FaultRecord, Payload, RadioCode,
    ReportType, SectionId, Severity, Signal, canonical_graph,
};
use ed25519_dalek::SigningKey;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::case::{CaseContext, CaseFailure};
use crate::section::{SectionProcessor, SectionWorkers};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),

    #[error("bus request failed: {0}")]
    Request(#[from] dossier_bus::RequestError),

    /// A component answered with `{ok: false}`.
    #[error("operation refused ({fault_code}): {message}")]
    Refused { fault_code: String, message: String },

    #[error("malformed component response: {0}")]
    Decode(String),
}

/// Result of one ingest operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub evidence_id: EvidenceId,
    pub content_hash: ContentHash,
    pub duplicate: bool,
}

/// A running case: every subsystem spawned, canonical sections registered.
pub struct CaseRuntime {
    context: CaseContext,
    bus: BusHandle,
    fault: FaultReporter,
    surface_rx: Mutex<mpsc::UnboundedReceiver<SurfaceFault>>,
    section_budget: Duration,
}

impl CaseRuntime {
    /// Builds the whole platform from configuration: bus, controller,
    /// locker, gateway, marshall, debrief, supervisor, and the section
    /// worker pool, with the canonical dependency graph registered.
    pub async fn start<C, P>(
        config: DossierConfig,
        classifier: C,
        processor: P,
        signing_key: SigningKey,
    ) -> anyhow::Result<Self>
    where
        C: Classifier,
        P: SectionProcessor,
    {
        let report_type = parse_report_type(&config.case.report_type)?;
        let context = CaseContext::new(config.case.name.clone(), report_type);
        info!(case_id = %context.case_id(), name = %context.name(), "starting case runtime");

        let (fault, faults_rx) = FaultReporter::channel();
        let (surface_tx, surface_rx) = mpsc::unbounded_channel();

        let (bus, _bus_task) = Bus::spawn(
            BusSettings {
                mailbox: MailboxSettings {
                    capacity: config.bus.mailbox_capacity,
                    soft_threshold: config.bus.mailbox_soft_threshold,
                    backpressure_window: Duration::from_secs(config.bus.backpressure_window_secs),
                },
                default_request_timeout: Duration::from_secs(config.bus.request_timeout_secs),
            },
            fault.clone(),
        );

        Controller::spawn(
            ControllerSettings {
                default_max_reruns: config.sections.max_reruns,
            },
            bus.clone(),
            fault.clone(),
        )
        .await
        .context("controller failed to start")?;

        Locker::spawn(
            LockerSettings {
                manifest_path: config.locker.manifest_path.clone(),
                classifier: ClassifierSettings {
                    budget: Duration::from_secs(config.locker.classification_budget_secs),
                    attempts: config.locker.classification_attempts,
                    ..ClassifierSettings::default()
                },
            },
            classifier,
            bus.clone(),
            fault.clone(),
        )
        .await
        .context("evidence locker failed to start")?;

        let routing = RoutingTable::from_config(&config.routing.rules)
            .context("routing table rejected the configured rules")?;
        Gateway::spawn(routing, bus.clone(), fault.clone())
            .await
            .context("gateway failed to start")?;

        Marshall::spawn(bus.clone(), fault.clone())
            .await
            .context("marshall failed to start")?;

        Debrief::spawn(
            config.case.name.clone(),
            report_type,
            signing_key,
            bus.clone(),
            fault.clone(),
        )
        .await
        .context("mission debrief failed to start")?;

        Supervisor::spawn(
            SupervisorSettings {
                status_period: Duration::from_secs(config.diagnostics.status_period_secs),
                reply_window: Duration::from_secs(config.diagnostics.status_reply_window_secs),
                miss_limit: config.diagnostics.consecutive_miss_limit,
                rollcall_min_interval: Duration::from_secs(
                    config.diagnostics.rollcall_min_interval_secs,
                ),
                vault_path: config.diagnostics.fault_vault_path.clone(),
                vault: VaultSettings {
                    ceiling: config.diagnostics.fault_ceiling,
                    closed_retention: Duration::from_secs(config.diagnostics.closed_retention_secs),
                },
                repair: RepairQueueSettings {
                    hard_cap: config.diagnostics.repair_queue_hard_cap,
                    soft_cap: config.diagnostics.repair_queue_soft_cap,
                },
                repair_workers: config.diagnostics.repair_workers,
                repair_max_attempts: config.diagnostics.repair_max_attempts,
                release_confirm_window: Duration::from_secs(5),
            },
            bus.clone(),
            faults_rx,
            surface_tx,
        )
        .await
        .context("diagnostic supervisor failed to start")?;

        SectionWorkers::spawn(
            processor,
            config.sections.worker_pool_size,
            config.sections.worker_inbox_capacity,
            bus.clone(),
            fault.clone(),
        )
        .await
        .context("section workers failed to start")?;

        let runtime = Self {
            context,
            bus,
            fault,
            surface_rx: Mutex::new(surface_rx),
            section_budget: Duration::from_secs(config.sections.execution_budget_secs),
        };

        runtime.register_sections(config.sections.max_reruns).await?;
        runtime.register_with_diagnostics().await?;
        Ok(runtime)
    }

    pub fn context(&self) -> &CaseContext {
        &self.context
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Ingests one evidence file through the locker.
    pub async fn ingest(
        &self,
        path: &str,
        kind: EvidenceKind,
        tags: &[&str],
    ) -> Result<IngestReceipt, RuntimeError> {
        let mut payload = Payload::new();
        payload.insert("path".into(), json!(path));
        payload.insert("kind".into(), json!(kind.to_string()));
        payload.insert("tags".into(), json!(tags));
        let response = self
            .request_ok(Address::locker(), "locker.ingest", payload, RadioCode::TenSix)
            .await?;

        let evidence_id = response
            .get("evidence_id")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(json!(s)).ok())
            .ok_or_else(|| RuntimeError::Decode("missing evidence_id".into()))?;
        let content_hash = response
            .get("content_hash")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RuntimeError::Decode("missing content_hash".into()))?;
        Ok(IngestReceipt {
            evidence_id,
            content_hash,
            duplicate: response
                .get("duplicate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Prepares one section through the gateway (order lock enforced).
    pub async fn prepare_section(&self, section_id: SectionId) -> Result<(), RuntimeError> {
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(section_id.as_str()));
        self.request_ok(
            Address::gateway(),
            "gateway.prepare_section",
            payload,
            RadioCode::TenSix,
        )
        .await?;
        Ok(())
    }

    /// Requests a revision of a section through the gateway.
    pub async fn request_revision(
        &self,
        section_id: SectionId,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(section_id.as_str()));
        payload.insert("reason".into(), json!(reason));
        self.request_ok(
            Address::gateway(),
            "section.request_revision",
            payload,
            RadioCode::TenSix,
        )
        .await?;
        Ok(())
    }

    /// Administrative reopen of a FAILED section.
    pub async fn reopen_section(&self, section_id: SectionId) -> Result<(), RuntimeError> {
        let mut payload = Payload::new();
        payload.insert("section_id".into(), json!(section_id.as_str()));
        self.request_ok(
            Address::controller(),
            "controller.reopen",
            payload,
            RadioCode::TenSix,
        )
        .await?;
        Ok(())
    }

    /// Broadcasts a rollcall; returns `(responders, silent)`.
    pub async fn rollcall(&self) -> Result<(Vec<String>, Vec<String>), RuntimeError> {
        let response = self
            .bus
            .request(
                Signal::request(
                    operator_address(),
                    Address::diagnostics(),
                    "diag.rollcall",
                    RadioCode::Rollcall,
                    Payload::new(),
                )
                .with_timeout(Duration::from_secs(120)),
            )
            .await?;
        if response.payload.get("throttled").and_then(Value::as_bool) == Some(true) {
            return Err(RuntimeError::Refused {
                fault_code: "Diag-50".into(),
                message: "rollcall throttled".into(),
            });
        }
        let list = |key: &str| -> Vec<String> {
            response.payload.get(key).and_then(Value::as_array).map_or_else(Vec::new, |items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        };
        Ok((list("responders"), list("silent")))
    }

    /// The outermost operation: drives every section through the pipeline
    /// in dependency order and returns the signed bundle.
    ///
    /// The first HIGH fault observed surfaces as a [`CaseFailure`]; partial
    /// results remain available via [`Self::report`].
    pub async fn generate_report(&self) -> Result<ReportBundle, CaseFailure> {
        let completions = self
            .bus
            .subscribe(
                Address::gateway()
                    .component("complete")
                    .expect("static address"),
            )
            .await
            .map_err(|e| internal_failure(&e.to_string()))?;

        let order = self
            .execution_order()
            .await
            .map_err(|e| internal_failure(&e.to_string()))?;

        for section_id in order {
            if let Some(failure) = self.first_high_fault() {
                return Err(failure);
            }
            self.prepare_section(section_id)
                .await
                .map_err(|error| match error {
                    RuntimeError::Refused { fault_code, message } => CaseFailure {
                        fault_code,
                        message,
                        remediation_hint: "resolve the blocking section and retry".into(),
                    },
                    other => internal_failure(&other.to_string()),
                })?;
            self.await_completion(&completions, section_id).await?;
        }

        if let Some(failure) = self.first_high_fault() {
            return Err(failure);
        }

        // The debrief observes the same completion stream concurrently;
        // poll briefly until its assembly catches up with the last section.
        let mut bundle = self
            .report()
            .await
            .map_err(|e| internal_failure(&e.to_string()))?;
        for _ in 0..200 {
            if bundle.manifest.complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            bundle = self
                .report()
                .await
                .map_err(|e| internal_failure(&e.to_string()))?;
        }
        Ok(bundle)
    }

    /// Fetches the current (possibly partial) signed bundle from debrief.
    pub async fn report(&self) -> Result<ReportBundle, RuntimeError> {
        let response = self
            .request_ok(Address::debrief(), "debrief.report", Payload::new(), RadioCode::TenSix)
            .await?;
        decode_bundle(&response)
    }

    /// Cancels the case: every subsystem's outstanding requests are
    /// cancelled and section checkouts released.
    pub fn cancel_case(&self) {
        self.context.cancel();
        for address in watched_addresses() {
            let mut payload = Payload::new();
            payload.insert("address".into(), json!(address.to_string()));
            let _ = self.bus.emit(Signal::notify(
                operator_address(),
                Address::diagnostics(),
                "diag.cancel",
                payload,
            ));
        }
        warn!(case_id = %self.context.case_id(), "case cancelled");
    }

    /// The first HIGH fault mirrored to the surface, if any.
    pub fn first_high_fault(&self) -> Option<CaseFailure> {
        let mut surface = self.surface_rx.lock().expect("surface lock poisoned");
        surface.try_recv().ok().map(|fault| CaseFailure {
            fault_code: fault.fault_code,
            message: fault.message,
            remediation_hint: fault.remediation_hint,
        })
    }

    /// Dependency-ordered schedule from the controller.
    pub async fn execution_order(&self) -> Result<Vec<SectionId>, RuntimeError> {
        let response = self
            .request_ok(
                Address::controller(),
                "controller.execution_order",
                Payload::new(),
                RadioCode::TenSix,
            )
            .await?;
        response
            .get("order")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .ok_or_else(|| RuntimeError::Decode("missing execution order".into()))
    }

    // ------------------------------------------------------------------
    // Wiring helpers
    // ------------------------------------------------------------------

    async fn register_sections(&self, max_reruns: u32) -> anyhow::Result<()> {
        for (section_id, depends_on, priority) in canonical_graph() {
            let mut payload = Payload::new();
            payload.insert("section_id".into(), json!(section_id.as_str()));
            payload.insert(
                "depends_on".into(),
                json!(depends_on.iter().map(|d| d.as_str()).collect::<Vec<_>>()),
            );
            payload.insert("priority".into(), json!(priority));
            payload.insert("max_reruns".into(), json!(max_reruns));
            self.request_ok(
                Address::controller(),
                "controller.register",
                payload,
                RadioCode::TenSix,
            )
            .await
            .with_context(|| format!("registering section {section_id}"))?;
        }
        Ok(())
    }

    async fn register_with_diagnostics(&self) -> anyhow::Result<()> {
        for address in watched_addresses() {
            let mut payload = Payload::new();
            payload.insert("address".into(), json!(address.to_string()));
            self.request_ok(
                Address::diagnostics(),
                "diag.register",
                payload,
                RadioCode::TenSix,
            )
            .await
            .with_context(|| format!("registering {address} for liveness"))?;
        }
        Ok(())
    }

    async fn await_completion(
        &self,
        completions: &Subscription,
        section_id: SectionId,
    ) -> Result<(), CaseFailure> {
        let wait = async {
            loop {
                match completions.recv().await {
                    Some(signal)
                        if signal.payload.get("section_id").and_then(Value::as_str)
                            == Some(section_id.as_str()) =>
                    {
                        return true;
                    }
                    Some(_) => {}
                    None => return false,
                }
            }
        };
        match tokio::time::timeout(self.section_budget, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(internal_failure("completion stream closed")),
            Err(_) => {
                // Execution budget exceeded: fail the section and surface.
                self.fault.report(FaultRecord::new(
                    Address::section(section_id),
                    FaultFamily::Timeout,
                    Severity::High,
                    format!("section {section_id} exceeded its execution budget"),
                ));
                let mut payload = Payload::new();
                payload.insert("section_id".into(), json!(section_id.as_str()));
                payload.insert("reason".into(), json!("execution budget exceeded"));
                let _ = self
                    .request_ok(
                        Address::controller(),
                        "controller.fail",
                        payload,
                        RadioCode::TenSix,
                    )
                    .await;
                Err(CaseFailure {
                    fault_code: format!("{}-20", Address::section(section_id)),
                    message: format!("section {section_id} exceeded its execution budget"),
                    remediation_hint: "inspect the section worker; reopen after repair".into(),
                })
            }
        }
    }

    /// One `{ok, ...}`-convention request.
    async fn request_ok(
        &self,
        target: Address,
        signal_type: &str,
        payload: Payload,
        radio_code: RadioCode,
    ) -> Result<Payload, RuntimeError> {
        let response = self
            .bus
            .request(Signal::request(
                operator_address(),
                target,
                signal_type,
                radio_code,
                payload,
            ))
            .await?;
        let ok = response.payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            Ok(response.payload)
        } else {
            Err(RuntimeError::Refused {
                fault_code: response
                    .payload
                    .get("fault_code")
                    .and_then(Value::as_str)
                    .unwrap_or("Bus-1-50")
                    .to_string(),
                message: response
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("request refused")
                    .to_string(),
            })
        }
    }
}

/// The operator-facing caller address used by runtime operations.
fn operator_address() -> Address {
    Address::parse("0-1").expect("static address is valid")
}

/// Every address the supervisor sweeps.
fn watched_addresses() -> Vec<Address> {
    let mut addresses = vec![
        Address::locker(),
        Address::controller(),
        Address::gateway(),
        Address::debrief(),
        Address::marshall(),
    ];
    addresses.extend(SectionId::all().into_iter().map(Address::section));
    addresses
}

fn parse_report_type(raw: &str) -> anyhow::Result<ReportType> {
    match raw {
        "Investigative" => Ok(ReportType::Investigative),
        "Surveillance" => Ok(ReportType::Surveillance),
        "Hybrid" => Ok(ReportType::Hybrid),
        other => anyhow::bail!("unknown report type {other:?}"),
    }
}

fn internal_failure(message: &str) -> CaseFailure {
    CaseFailure {
        fault_code: "Bus-1-90".to_string(),
        message: message.to_string(),
        remediation_hint: "internal runtime failure; inspect the logs".to_string(),
    }
}

fn decode_bundle(payload: &Payload) -> Result<ReportBundle, RuntimeError> {
    let manifest = payload
        .get("manifest")
        .cloned()
        .ok_or_else(|| RuntimeError::Decode("missing bundle manifest".into()))?;
    let manifest =
        serde_json::from_value(manifest).map_err(|e| RuntimeError::Decode(e.to_string()))?;
    let decode_b64 = |key: &str| -> Result<Vec<u8>, RuntimeError> {
        payload
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Decode(format!("missing {key}")))
            .and_then(|raw| {
                BASE64
                    .decode(raw)
                    .map_err(|e| RuntimeError::Decode(e.to_string()))
            })
    };
    Ok(ReportBundle {
        manifest,
        blob: decode_b64("blob_b64")?,
        signature: decode_b64("signature_b64")?,
        verifying_key: decode_b64("verifying_key_b64")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::DefaultSectionProcessor;
    use dossier_debrief::verify_bundle;
    use dossier_locker::ClassifierError;
    use dossier_types::Classification;
    use rand::rngs::OsRng;

    struct CannedClassifier;

    impl Classifier for CannedClassifier {
        async fn classify(
            &self,
            _kind: EvidenceKind,
            _bytes: Vec<u8>,
        ) -> Result<Classification, ClassifierError> {
            Ok(Classification::new("field-note"))
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> DossierConfig {
        let mut config = DossierConfig::default();
        config.case.name = "case-0042".to_string();
        config.locker.manifest_path = dir.path().join("manifest.jsonl");
        config.diagnostics.fault_vault_path = dir.path().join("faults.jsonl");
        // Keep liveness quiet during short tests.
        config.diagnostics.status_period_secs = 3600;
        config.routing.rules = vec![dossier_config::RoutingRule {
            kind: Some("text".to_string()),
            classification: None,
            tag: None,
            sections: vec!["1".to_string(), "8".to_string()],
        }];
        config
    }

    async fn start_runtime(dir: &tempfile::TempDir) -> CaseRuntime {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        CaseRuntime::start(
            test_config(dir),
            CannedClassifier,
            DefaultSectionProcessor,
            SigningKey::generate(&mut OsRng),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_ingest_resolves_to_the_same_evidence_id() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_runtime(&dir).await;

        let path_a = dir.path().join("notes-a.txt");
        let path_b = dir.path().join("notes-b.txt");
        std::fs::write(&path_a, b"surveillance notes, night shift").unwrap();
        std::fs::write(&path_b, b"surveillance notes, night shift").unwrap();

        let first = runtime
            .ingest(path_a.to_str().unwrap(), EvidenceKind::Text, &["field"])
            .await
            .unwrap();
        assert!(!first.duplicate);

        let second = runtime
            .ingest(path_b.to_str().unwrap(), EvidenceKind::Text, &["billing"])
            .await
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(second.evidence_id, first.evidence_id);
        assert_eq!(second.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn full_case_produces_a_signed_verified_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_runtime(&dir).await;

        let path = dir.path().join("statement.txt");
        std::fs::write(&path, b"witness statement, corner store").unwrap();
        let receipt = runtime
            .ingest(path.to_str().unwrap(), EvidenceKind::Text, &["witness"])
            .await
            .unwrap();
        assert!(!receipt.duplicate);

        let bundle = runtime.generate_report().await.unwrap();
        assert!(bundle.manifest.complete);
        assert_eq!(bundle.manifest.sections.len(), 12);
        assert_eq!(verify_bundle(&bundle), Ok(()));

        // The schedule follows the canonical chain.
        let order = runtime.execution_order().await.unwrap();
        assert_eq!(order, SectionId::all().to_vec());
    }

    #[tokio::test]
    async fn preparing_out_of_order_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_runtime(&dir).await;

        let error = runtime.prepare_section(SectionId::S3).await.unwrap_err();
        match error {
            RuntimeError::Refused { fault_code, .. } => assert_eq!(fault_code, "2-2-52"),
            other => panic!("expected order-lock refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rollcall_reports_every_registered_component() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_runtime(&dir).await;

        let (responders, silent) = runtime.rollcall().await.unwrap();
        assert!(silent.is_empty(), "all components should answer: {silent:?}");
        // Five subsystems plus twelve section workers.
        assert_eq!(responders.len(), 17);

        // A second rollcall from the same caller is throttled.
        let error = runtime.rollcall().await.unwrap_err();
        assert!(matches!(error, RuntimeError::Refused { .. }));
    }
}
