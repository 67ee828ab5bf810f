//! The controller actor: the shell that executes effects and speaks the bus
//! protocol on behalf of the pure transition core.

use dossier_bus::{BusHandle, FaultReporter, Subscription};
use dossier_types::{
    Address, ContentHash, EvidenceId, FaultRecord, Payload, RadioCode, SectionId, Severity, Signal,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ledger::SectionLedger;
use crate::transition::{ControlCommand, ControlEffect, ControlError, apply};

/// Tuning for the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Default revision bound applied at registration when the caller does
    /// not supply one.
    pub default_max_reruns: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { default_max_reruns: 2 }
    }
}

/// The controller task. Listens at `2-1`; publishes events on `2-1.events`.
pub struct Controller {
    settings: ControllerSettings,
    bus: BusHandle,
    fault: FaultReporter,
    inbox: Subscription,
    events: Address,
    ledger: SectionLedger,
}

impl Controller {
    /// Subscribes at `2-1` and spawns the controller task.
    pub async fn spawn(
        settings: ControllerSettings,
        bus: BusHandle,
        fault: FaultReporter,
    ) -> Result<JoinHandle<()>, dossier_bus::BusError> {
        let inbox = bus.subscribe(Address::controller()).await?;
        let events = Address::controller()
            .component("events")
            .expect("controller event address is valid");
        let controller = Self {
            settings,
            bus,
            fault,
            inbox,
            events,
            ledger: SectionLedger::new(),
        };
        Ok(tokio::spawn(controller.run()))
    }

    async fn run(mut self) {
        info!("ecosystem controller started");
        while let Some(signal) = self.inbox.recv().await {
            self.handle(signal);
        }
        info!("ecosystem controller stopped");
    }

    fn handle(&mut self, signal: Signal) {
        // Liveness probes are answered before any domain dispatch.
        if matches!(
            signal.radio_code,
            RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
        ) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("controller"));
            let _ = self.bus.respond(&signal, Address::controller(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "controller.register" => {
                let default_reruns = self.settings.default_max_reruns;
                self.apply_from_signal(&signal, move |s, p| {
                    Self::parse_register(s, p, default_reruns)
                });
            }
            "controller.prepare" => self.apply_from_signal(&signal, |_, p| {
                Ok(ControlCommand::Prepare { section_id: parse_section(p)? })
            }),
            "controller.start" => self.apply_from_signal(&signal, |_, p| {
                Ok(ControlCommand::Start { section_id: parse_section(p)? })
            }),
            "controller.mark_complete" => self.apply_from_signal(&signal, Self::parse_complete),
            "controller.fail" => self.apply_from_signal(&signal, |_, p| {
                Ok(ControlCommand::Fail {
                    section_id: parse_section(p)?,
                    reason: string_field(p, "reason").unwrap_or_default(),
                })
            }),
            "controller.request_revision" => self.apply_from_signal(&signal, |s, p| {
                Ok(ControlCommand::RequestRevision {
                    section_id: parse_section(p)?,
                    reason: string_field(p, "reason").unwrap_or_default(),
                    requester: s.caller_address.clone(),
                })
            }),
            "controller.reopen" => self.apply_from_signal(&signal, |_, p| {
                Ok(ControlCommand::Reopen { section_id: parse_section(p)? })
            }),
            "controller.can_run" => self.answer_can_run(&signal),
            "controller.section_state" => self.answer_section_state(&signal),
            "controller.execution_order" => self.answer_execution_order(&signal),
            "controller.snapshot" => self.answer_snapshot(&signal),
            other => {
                debug!(signal_type = other, "controller ignoring signal");
            }
        }
    }

    // ------------------------------------------------------------------
    // Command application
    // ------------------------------------------------------------------

    fn apply_from_signal(
        &mut self,
        signal: &Signal,
        parse: impl FnOnce(&Signal, &Payload) -> Result<ControlCommand, String>,
    ) {
        let command = match parse(signal, &signal.payload) {
            Ok(command) => command,
            Err(error) => {
                warn!(signal_type = %signal.signal_type, %error, "malformed controller request");
                self.fault.report(FaultRecord::new(
                    Address::controller(),
                    dossier_types::FaultFamily::Validation,
                    Severity::Medium,
                    format!("malformed {}: {error}", signal.signal_type),
                ));
                self.respond_err(signal, "2-1-31", &error);
                return;
            }
        };

        match apply(self.ledger.clone(), command) {
            Ok((ledger, effects)) => {
                self.ledger = ledger;
                for effect in effects {
                    self.execute(effect);
                }
                self.respond_ok(signal, Payload::new());
            }
            Err(error) => {
                let family = error.fault_family();
                let fault = FaultRecord::new(
                    Address::controller(),
                    family,
                    Severity::Medium,
                    error.to_string(),
                );
                let code = fault.fault_code.to_string();
                self.fault.report(fault);
                self.respond_err(signal, &code, &error.to_string());
            }
        }
    }

    fn execute(&mut self, effect: ControlEffect) {
        match effect {
            ControlEffect::StateChanged { section_id, from, to } => {
                debug!(%section_id, %from, %to, "section transition");
                let mut payload = Payload::new();
                payload.insert("section_id".into(), json!(section_id.as_str()));
                payload.insert("from".into(), json!(from.to_string()));
                payload.insert("to".into(), json!(to.to_string()));
                payload.insert("version".into(), json!(self.ledger.version()));
                let _ = self.bus.emit(Signal::notify(
                    Address::controller(),
                    self.events.clone(),
                    "section.state",
                    payload,
                ));
            }
            ControlEffect::SectionComplete(frozen) => {
                let mut payload = Payload::new();
                payload.insert("section_id".into(), json!(frozen.section_id.as_str()));
                payload.insert(
                    "frozen".into(),
                    serde_json::to_value(&frozen).unwrap_or(Value::Null),
                );
                let _ = self.bus.emit(
                    Signal::notify(
                        Address::controller(),
                        self.events.clone(),
                        "gateway.section.complete",
                        payload,
                    )
                    .with_radio_code(RadioCode::TenEight),
                );
            }
            ControlEffect::RevisionAccepted { section_id, reason } => {
                let mut payload = Payload::new();
                payload.insert("section_id".into(), json!(section_id.as_str()));
                payload.insert("reason".into(), json!(reason));
                let _ = self.bus.emit(Signal::notify(
                    Address::controller(),
                    self.events.clone(),
                    "section.revision.accepted",
                    payload,
                ));
            }
            ControlEffect::RaiseFault {
                family,
                severity,
                context,
            } => {
                self.fault.report(FaultRecord::new(
                    Address::controller(),
                    family,
                    severity,
                    context,
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn answer_can_run(&self, signal: &Signal) {
        match parse_section(&signal.payload).map(|id| self.ledger.can_run(id)) {
            Ok(Ok(can_run)) => {
                let mut payload = Payload::new();
                payload.insert("can_run".into(), json!(can_run));
                self.respond_ok(signal, payload);
            }
            Ok(Err(error)) => self.respond_err(signal, "2-1-51", &error.to_string()),
            Err(error) => self.respond_err(signal, "2-1-31", &error),
        }
    }

    fn answer_section_state(&self, signal: &Signal) {
        match parse_section(&signal.payload) {
            Ok(id) => match self.ledger.get(id) {
                Some(record) => {
                    let mut payload = Payload::new();
                    payload.insert("state".into(), json!(record.state.to_string()));
                    payload.insert("revision_depth".into(), json!(record.revision_depth));
                    payload.insert("version".into(), json!(self.ledger.version()));
                    self.respond_ok(signal, payload);
                }
                None => self.respond_err(signal, "2-1-51", &format!("section {id} not registered")),
            },
            Err(error) => self.respond_err(signal, "2-1-31", &error),
        }
    }

    fn answer_execution_order(&self, signal: &Signal) {
        let order: Vec<&str> = self
            .ledger
            .execution_order()
            .into_iter()
            .map(SectionId::as_str)
            .collect();
        let mut payload = Payload::new();
        payload.insert("order".into(), json!(order));
        self.respond_ok(signal, payload);
    }

    fn answer_snapshot(&self, signal: &Signal) {
        let snapshot = self.ledger.snapshot();
        let mut payload = Payload::new();
        payload.insert(
            "snapshot".into(),
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
        self.respond_ok(signal, payload);
    }

    // ------------------------------------------------------------------
    // Response plumbing
    // ------------------------------------------------------------------

    fn respond_ok(&self, signal: &Signal, mut payload: Payload) {
        if !signal.response_expected {
            return;
        }
        payload.insert("ok".into(), json!(true));
        let _ = self.bus.respond(signal, Address::controller(), payload);
    }

    fn respond_err(&self, signal: &Signal, fault_code: &str, error: &str) {
        if !signal.response_expected {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("ok".into(), json!(false));
        payload.insert("fault_code".into(), json!(fault_code));
        payload.insert("error".into(), json!(error));
        let _ = self.bus.respond(signal, Address::controller(), payload);
    }

    // ------------------------------------------------------------------
    // Payload parsing
    // ------------------------------------------------------------------

    fn parse_register(
        _signal: &Signal,
        payload: &Payload,
        default_max_reruns: u32,
    ) -> Result<ControlCommand, String> {
        let section_id = parse_section(payload)?;
        let depends_on = match payload.get("depends_on") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| "depends_on entries must be strings".to_string())
                        .and_then(|s| s.parse::<SectionId>().map_err(|e| e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
            Some(_) => return Err("depends_on must be an array".to_string()),
        };
        let priority = payload
            .get("priority")
            .and_then(Value::as_u64)
            .ok_or_else(|| "priority is required".to_string())? as u8;
        let max_reruns = payload
            .get("max_reruns")
            .and_then(Value::as_u64)
            .map_or(default_max_reruns, |v| v as u32);
        Ok(ControlCommand::Register {
            section_id,
            depends_on,
            priority,
            max_reruns,
        })
    }

    fn parse_complete(signal: &Signal, payload: &Payload) -> Result<ControlCommand, String> {
        let section_id = parse_section(payload)?;
        let payload_hash = string_field(payload, "payload_hash")
            .ok_or_else(|| "payload_hash is required".to_string())?
            .parse::<ContentHash>()
            .map_err(|e| e.to_string())?;
        let input_evidence = match payload.get("input_evidence") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| serde_json::from_value::<EvidenceId>(json!(s)).ok())
                .collect(),
            _ => Vec::new(),
        };
        Ok(ControlCommand::MarkComplete {
            section_id,
            payload_hash,
            input_evidence,
            by: signal.caller_address.clone(),
        })
    }
}

fn parse_section(payload: &Payload) -> Result<SectionId, String> {
    string_field(payload, "section_id")
        .ok_or_else(|| "section_id is required".to_string())?
        .parse::<SectionId>()
        .map_err(|e| e.to_string())
}

fn string_field(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}
