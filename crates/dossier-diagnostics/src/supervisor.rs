//! The supervisor actor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use dossier_bus::{BusHandle, FaultReporter, Subscription};
use dossier_types::{
    Address, FaultFamily, FaultId, FaultRecord, FaultState, Payload, RadioCode, SectionId,
    Severity, Signal,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::liveness::{HealthEvent, HealthRegistry, RollcallThrottle};
use crate::repair::{RepairEntry, RepairQueue, RepairQueueSettings};
use crate::vault::{FaultVault, VaultError, VaultSettings};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Bus(#[from] dossier_bus::BusError),
}

/// Tuning for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub status_period: Duration,
    pub reply_window: Duration,
    pub miss_limit: u32,
    pub rollcall_min_interval: Duration,
    pub vault_path: PathBuf,
    pub vault: VaultSettings,
    pub repair: RepairQueueSettings,
    pub repair_workers: usize,
    pub repair_max_attempts: u32,
    /// How long a cancelled section has to confirm evidence release.
    pub release_confirm_window: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            status_period: Duration::from_secs(30),
            reply_window: Duration::from_secs(15),
            miss_limit: 3,
            rollcall_min_interval: Duration::from_secs(30),
            vault_path: PathBuf::from(".dossier/faults.jsonl"),
            vault: VaultSettings::default(),
            repair: RepairQueueSettings::default(),
            repair_workers: 4,
            repair_max_attempts: 3,
            release_confirm_window: Duration::from_secs(5),
        }
    }
}

/// A HIGH fault as mirrored to the user-visible surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceFault {
    pub fault_code: String,
    pub message: String,
    pub remediation_hint: String,
}

enum Internal {
    Probe {
        address: Address,
        ok: bool,
    },
    RollcallDone {
        request: Box<Signal>,
        responders: Vec<String>,
        silent: Vec<Address>,
    },
    RepairDone {
        entry: RepairEntry,
        ok: bool,
    },
    ReleaseConfirm {
        section: Address,
        ok: bool,
    },
}

/// The supervisor task. Listens at `Diag`; consumes the out-of-band fault
/// channel; publishes escalations on `Diag.alerts`.
pub struct Supervisor {
    settings: SupervisorSettings,
    bus: BusHandle,
    inbox: Subscription,
    controller_events: Subscription,
    faults_rx: mpsc::UnboundedReceiver<FaultRecord>,
    surface: mpsc::UnboundedSender<SurfaceFault>,
    alerts: Address,
    vault: FaultVault,
    queue: RepairQueue,
    health: HealthRegistry,
    throttle: RollcallThrottle,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    active_repairs: usize,
    /// Last fatal fault per origin, for the restart-then-MAYDAY policy.
    fatal_history: HashMap<Address, Instant>,
}

impl Supervisor {
    /// Opens the vault, subscribes at `Diag`, and spawns the supervisor.
    ///
    /// `faults_rx` is the receiving end of the platform fault channel;
    /// `surface` receives every HIGH fault for the user-visible surface.
    pub async fn spawn(
        settings: SupervisorSettings,
        bus: BusHandle,
        faults_rx: mpsc::UnboundedReceiver<FaultRecord>,
        surface: mpsc::UnboundedSender<SurfaceFault>,
    ) -> Result<JoinHandle<()>, SupervisorError> {
        let vault = FaultVault::open(&settings.vault_path, settings.vault)?;
        let inbox = bus.subscribe(Address::diagnostics()).await?;
        let controller_events = bus
            .subscribe(Address::controller().component("events").expect("valid address"))
            .await?;
        let alerts = Address::diagnostics()
            .component("alerts")
            .expect("valid address");
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            health: HealthRegistry::new(settings.miss_limit),
            throttle: RollcallThrottle::new(settings.rollcall_min_interval),
            queue: RepairQueue::new(settings.repair),
            settings,
            bus,
            inbox,
            controller_events,
            faults_rx,
            surface,
            alerts,
            vault,
            internal_tx,
            internal_rx,
            active_repairs: 0,
            fatal_history: HashMap::new(),
        };
        Ok(tokio::spawn(supervisor.run()))
    }

    async fn run(mut self) {
        info!("diagnostic supervisor started");
        let mut sweep = tokio::time::interval(self.settings.status_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so components have a
        // period to come up before the first probe.
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep(),
                fault = self.faults_rx.recv() => match fault {
                    Some(fault) => self.admit_fault(fault),
                    None => break,
                },
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.handle(signal),
                    None => break,
                },
                event = self.controller_events.recv() => {
                    if let Some(event) = event {
                        self.handle_controller_event(&event);
                    }
                },
                internal = self.internal_rx.recv() => {
                    if let Some(internal) = internal {
                        self.handle_internal(internal);
                    }
                },
            }
        }
        info!("diagnostic supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Fault admission
    // ------------------------------------------------------------------

    fn admit_fault(&mut self, fault: FaultRecord) {
        // HIGH faults hit the user surface immediately, before any vault
        // bookkeeping can slow them down.
        if fault.severity == Severity::High {
            let _ = self.surface.send(SurfaceFault {
                fault_code: fault.fault_code.to_string(),
                message: fault.context.clone(),
                remediation_hint: remediation_hint(fault.fault_code.family),
            });
        }

        let family = fault.fault_code.family;
        let origin = fault.origin_address.clone();
        let entry = RepairEntry {
            fault_id: fault.fault_id,
            fault_code: fault.fault_code.clone(),
            origin: origin.clone(),
            severity: fault.severity,
            attempts: fault.attempts,
        };

        match self.vault.record(fault) {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                warn!(%error, "fault vault rejected a record");
                return;
            }
        }

        if family.is_fatal() {
            self.handle_fatal(&origin);
            return;
        }

        // Retryable families and silent components go to the repair queue;
        // contract errors are report-only.
        if family.is_retryable() || family == FaultFamily::SignalNotReceived {
            self.queue.push(entry);
            self.pump_repairs();
        }
    }

    /// One restart per fatal fault; a re-fault inside 60 s disables the
    /// component and broadcasts MAYDAY.
    fn handle_fatal(&mut self, origin: &Address) {
        let now = Instant::now();
        let refaulted = self
            .fatal_history
            .insert(origin.clone(), now)
            .is_some_and(|last| now.duration_since(last) < Duration::from_secs(60));

        if refaulted {
            warn!(%origin, "fatal re-fault within 60s; disabling component");
            self.health.deregister(origin);
            let mut payload = Payload::new();
            payload.insert("origin".into(), json!(origin.to_string()));
            payload.insert("disabled".into(), json!(true));
            let _ = self.bus.emit(
                Signal::notify(Address::diagnostics(), self.alerts.clone(), "diag.mayday", payload)
                    .with_radio_code(RadioCode::Mayday),
            );
            let _ = self.surface.send(SurfaceFault {
                fault_code: format!("{origin}-90"),
                message: format!("component {origin} disabled after repeated fatal faults"),
                remediation_hint: "operator intervention required; restart the case runtime".into(),
            });
        } else {
            let _ = self.bus.emit(Signal::notify(
                Address::diagnostics(),
                origin.clone(),
                "component.restart",
                Payload::new(),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Liveness sweep
    // ------------------------------------------------------------------

    fn sweep(&mut self) {
        self.vault.evict_expired(chrono::Utc::now());
        for address in self.health.addresses() {
            let bus = self.bus.clone();
            let window = self.settings.reply_window;
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                let probe = Signal::request(
                    Address::diagnostics(),
                    address.clone(),
                    "diag.status",
                    RadioCode::Status,
                    Payload::new(),
                )
                .with_timeout(window);
                let ok = bus.request(probe).await.is_ok();
                let _ = internal.send(Internal::Probe { address, ok });
            });
        }
    }

    fn record_probe(&mut self, address: &Address, ok: bool) {
        let event = if ok {
            self.health.record_response(address)
        } else {
            self.health.record_miss(address)
        };
        match event {
            Some(HealthEvent::BecameUnhealthy { address, misses }) => {
                self.admit_fault(FaultRecord::new(
                    address.clone(),
                    FaultFamily::SignalNotReceived,
                    Severity::High,
                    format!("{address} missed {misses} consecutive liveness probes"),
                ));
            }
            Some(HealthEvent::Recovered { address }) => {
                info!(%address, "component recovered");
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Bus signal handling
    // ------------------------------------------------------------------

    fn handle(&mut self, signal: Signal) {
        if matches!(signal.radio_code, RadioCode::Status | RadioCode::RadioCheck) {
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(true));
            payload.insert("component".into(), json!("diagnostics"));
            let _ = self.bus.respond(&signal, Address::diagnostics(), payload);
            return;
        }

        match signal.signal_type.as_str() {
            "diag.register" => {
                if let Some(address) = parse_address(&signal.payload) {
                    self.health.register(address);
                    self.respond_ok(&signal, Payload::new());
                } else {
                    self.respond_err(&signal, "Diag-31", "address is required");
                }
            }
            "diag.deregister" => {
                if let Some(address) = parse_address(&signal.payload) {
                    self.health.deregister(&address);
                    self.respond_ok(&signal, Payload::new());
                } else {
                    self.respond_err(&signal, "Diag-31", "address is required");
                }
            }
            "diag.rollcall" => self.handle_rollcall(signal),
            "diag.health" => {
                let mut payload = Payload::new();
                payload.insert(
                    "health".into(),
                    serde_json::to_value(self.health.snapshot()).unwrap_or(Value::Null),
                );
                self.respond_ok(&signal, payload);
            }
            "diag.fault_report" => {
                let active: Vec<Value> = self
                    .vault
                    .active()
                    .into_iter()
                    .map(|record| serde_json::to_value(record).unwrap_or(Value::Null))
                    .collect();
                let mut payload = Payload::new();
                payload.insert("active".into(), json!(active));
                payload.insert("total".into(), json!(self.vault.len()));
                payload.insert("repair_queue_depth".into(), json!(self.queue.len()));
                self.respond_ok(&signal, payload);
            }
            "diag.fault" => {
                let record = parse_fault_id(&signal.payload)
                    .and_then(|id| self.vault.get(id))
                    .map(|record| serde_json::to_value(record).unwrap_or(Value::Null));
                match record {
                    Some(record) => {
                        let mut payload = Payload::new();
                        payload.insert("fault".into(), record);
                        self.respond_ok(&signal, payload);
                    }
                    None => self.respond_err(&signal, "Diag-51", "unknown fault"),
                }
            }
            "diag.cancel" => {
                if let Some(address) = parse_address(&signal.payload) {
                    self.cancel_address(&address);
                    self.respond_ok(&signal, Payload::new());
                } else {
                    self.respond_err(&signal, "Diag-31", "address is required");
                }
            }
            other => debug!(signal_type = other, "supervisor ignoring signal"),
        }
    }

    // ------------------------------------------------------------------
    // Rollcall
    // ------------------------------------------------------------------

    fn handle_rollcall(&mut self, signal: Signal) {
        if !self.throttle.allow(&signal.caller_address, Instant::now()) {
            warn!(caller = %signal.caller_address, "rollcall throttled");
            let mut payload = Payload::new();
            payload.insert("ok".into(), json!(false));
            payload.insert("throttled".into(), json!(true));
            let _ = self.bus.respond(&signal, Address::diagnostics(), payload);
            return;
        }

        let addresses = self.health.addresses();
        let bus = self.bus.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut probes = JoinSet::new();
            for address in addresses {
                let bus = bus.clone();
                probes.spawn(async move {
                    let probe = Signal::request(
                        Address::diagnostics(),
                        address.clone(),
                        "diag.rollcall.probe",
                        RadioCode::Rollcall,
                        Payload::new(),
                    );
                    (address, bus.request(probe).await.is_ok())
                });
            }
            let mut responders = Vec::new();
            let mut silent = Vec::new();
            while let Some(result) = probes.join_next().await {
                if let Ok((address, ok)) = result {
                    if ok {
                        responders.push(address.to_string());
                    } else {
                        silent.push(address);
                    }
                }
            }
            let _ = internal.send(Internal::RollcallDone {
                request: Box::new(signal),
                responders,
                silent,
            });
        });
    }

    // ------------------------------------------------------------------
    // Repair loop
    // ------------------------------------------------------------------

    fn pump_repairs(&mut self) {
        while self.active_repairs < self.settings.repair_workers {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            if let Err(error) = self.vault.set_state(entry.fault_id, FaultState::InRepair) {
                debug!(%error, "repair entry for an evicted fault dropped");
                continue;
            }
            self.active_repairs += 1;
            let bus = self.bus.clone();
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                let ok = run_repair(&bus, &entry).await;
                let _ = internal.send(Internal::RepairDone { entry, ok });
            });
        }
    }

    fn finish_repair(&mut self, entry: RepairEntry, ok: bool) {
        self.active_repairs = self.active_repairs.saturating_sub(1);
        if ok {
            info!(fault_code = %entry.fault_code, "repair succeeded");
            let _ = self.vault.set_state(entry.fault_id, FaultState::Closed);
        } else {
            let attempts = self.vault.bump_attempts(entry.fault_id).unwrap_or(u32::MAX);
            if attempts >= self.settings.repair_max_attempts {
                warn!(fault_code = %entry.fault_code, attempts, "repair attempts exhausted");
                let _ = self.vault.set_state(entry.fault_id, FaultState::Unrepaired);
                let mut payload = Payload::new();
                payload.insert("fault_code".into(), json!(entry.fault_code.to_string()));
                payload.insert("attempts".into(), json!(attempts));
                let _ = self.bus.emit(
                    Signal::notify(
                        Address::diagnostics(),
                        self.alerts.clone(),
                        "diag.escalation",
                        payload,
                    )
                    .with_radio_code(RadioCode::Sos),
                );
                let _ = self.surface.send(SurfaceFault {
                    fault_code: entry.fault_code.to_string(),
                    message: format!("repair of {} abandoned after {attempts} attempts", entry.fault_code),
                    remediation_hint: remediation_hint(entry.fault_code.family),
                });
            } else {
                let _ = self.vault.set_state(entry.fault_id, FaultState::Open);
                let mut entry = entry;
                entry.attempts = attempts;
                self.queue.push(entry);
            }
        }
        self.pump_repairs();
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    fn handle_controller_event(&mut self, event: &Signal) {
        if event.signal_type != "section.state" {
            return;
        }
        let failed = event.payload.get("to").and_then(Value::as_str) == Some("FAILED");
        if !failed {
            return;
        }
        let Some(section_id) = event
            .payload
            .get("section_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<SectionId>().ok())
        else {
            return;
        };
        self.cancel_address(&Address::section(section_id));
    }

    /// Cancels every outstanding request the address owns and, for section
    /// addresses, force-releases its evidence checkouts. A release that
    /// does not confirm inside the window raises a network fault.
    fn cancel_address(&mut self, address: &Address) {
        info!(%address, "cancelling outstanding work");
        let _ = self.bus.cancel_owned(address.clone());

        let Some(section_label) = address.as_str().strip_prefix("4-") else {
            return;
        };
        let Some(section_id) = section_ordinal(section_label) else {
            return;
        };
        let bus = self.bus.clone();
        let window = self.settings.release_confirm_window;
        let internal = self.internal_tx.clone();
        let section_address = address.clone();
        tokio::spawn(async move {
            let mut payload = Payload::new();
            payload.insert("section_id".into(), json!(section_id.as_str()));
            let release = Signal::request(
                Address::diagnostics(),
                Address::marshall(),
                "marshall.release_all",
                RadioCode::TenSix,
                payload,
            )
            .with_timeout(window);
            let ok = matches!(
                bus.request(release).await,
                Ok(response) if response.payload.get("ok").and_then(Value::as_bool) == Some(true)
            );
            let _ = internal.send(Internal::ReleaseConfirm {
                section: section_address,
                ok,
            });
        });
    }

    // ------------------------------------------------------------------
    // Internal results
    // ------------------------------------------------------------------

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Probe { address, ok } => self.record_probe(&address, ok),
            Internal::RollcallDone {
                request,
                responders,
                silent,
            } => {
                // A silent rollcall counts as exactly one ordinary miss.
                for address in &silent {
                    self.record_probe(address, false);
                }
                let mut payload = Payload::new();
                payload.insert("responders".into(), json!(responders));
                payload.insert(
                    "silent".into(),
                    json!(silent.iter().map(ToString::to_string).collect::<Vec<_>>()),
                );
                payload.insert("ok".into(), json!(true));
                let _ = self.bus.respond(&request, Address::diagnostics(), payload);
            }
            Internal::RepairDone { entry, ok } => self.finish_repair(entry, ok),
            Internal::ReleaseConfirm { section, ok } => {
                if !ok {
                    self.admit_fault(FaultRecord::new(
                        section.clone(),
                        FaultFamily::Network,
                        Severity::Medium,
                        format!("{section} did not confirm evidence release within the window"),
                    ));
                }
            }
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
        let _ = self.bus.respond(signal, Address::diagnostics(), payload);
    }

    fn respond_err(&self, signal: &Signal, fault_code: &str, error: &str) {
        if !signal.response_expected {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("ok".into(), json!(false));
        payload.insert("fault_code".into(), json!(fault_code));
        payload.insert("error".into(), json!(error));
        let _ = self.bus.respond(signal, Address::diagnostics(), payload);
    }
}

/// One repair attempt, dispatched on the fault family.
///
/// Connectivity-class faults (silent component, flapping link) send a
/// `RADIO_CHECK`: reachability alone proves recovery. Availability-class
/// faults (resource, external service, database) send a `STATUS` request so
/// the origin re-evaluates the degraded dependency before answering. Either
/// way the origin must answer `ok` inside the probe's radio-code window.
async fn run_repair(bus: &BusHandle, entry: &RepairEntry) -> bool {
    let (signal_type, radio_code) = match entry.fault_code.family {
        FaultFamily::SignalNotReceived => ("diag.repair.connectivity", RadioCode::RadioCheck),
        FaultFamily::Network => ("diag.repair.link", RadioCode::RadioCheck),
        FaultFamily::ResourceUnavailable => ("diag.repair.capacity", RadioCode::Status),
        FaultFamily::ExternalService => ("diag.repair.external", RadioCode::Status),
        FaultFamily::Database => ("diag.repair.storage", RadioCode::Status),
        _ => ("diag.radio_check", RadioCode::RadioCheck),
    };
    let mut payload = Payload::new();
    payload.insert("fault_code".into(), json!(entry.fault_code.to_string()));
    payload.insert("attempt".into(), json!(entry.attempts + 1));
    let probe = Signal::request(
        Address::diagnostics(),
        entry.origin.clone(),
        signal_type,
        radio_code,
        payload,
    );
    match bus.request(probe).await {
        Ok(response) => response.payload.get("ok").and_then(Value::as_bool) == Some(true),
        Err(_) => false,
    }
}

fn remediation_hint(family: FaultFamily) -> String {
    let hint = match family {
        FaultFamily::Timeout | FaultFamily::SignalNotReceived => {
            "check that the silent component is running and reachable"
        }
        FaultFamily::AddressUnknown => "verify the target address is registered on the bus",
        FaultFamily::Validation | FaultFamily::InvalidState | FaultFamily::Forbidden => {
            "contract violation; inspect the fault context and the calling code"
        }
        FaultFamily::DataCorruption => "re-ingest the affected evidence from a clean source",
        FaultFamily::RevisionLimit => "reopen the failed section administratively after review",
        FaultFamily::ResourceUnavailable | FaultFamily::ExternalService | FaultFamily::Database
        | FaultFamily::Network => "transient infrastructure fault; repairs are scheduled",
        FaultFamily::FileMissing => "restore the missing file or correct the configured path",
        FaultFamily::Crash | FaultFamily::OutOfMemory => {
            "component restart in progress; persistent re-faults disable it"
        }
        FaultFamily::Syntax | FaultFamily::Init | FaultFamily::DataProcessing
        | FaultFamily::BusinessRule => "inspect the fault context",
    };
    hint.to_string()
}

fn parse_address(payload: &Payload) -> Option<Address> {
    payload
        .get("address")
        .and_then(Value::as_str)
        .and_then(|s| Address::parse(s).ok())
}

fn parse_fault_id(payload: &Payload) -> Option<FaultId> {
    payload
        .get("fault_id")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(json!(s)).ok())
}

fn section_ordinal(label: &str) -> Option<SectionId> {
    let ordinal: u8 = label.parse().ok()?;
    SectionId::all().into_iter().find(|s| s.ordinal() == ordinal)
}
