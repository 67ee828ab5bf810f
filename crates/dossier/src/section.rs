//! Section workers.
//!
//! The twelve report sections share a single contract: consume an input
//! envelope, produce a structured payload. They are modeled as a sum type
//! over section kinds behind one [`SectionProcessor`] interface, executed
//! by a worker pool sized to available CPU.
//!
//! Each section address gets a forwarder that answers liveness probes and
//! turns `section.data.updated` signals into jobs on a bounded, lock-free
//! inbox. When the inbox is full the job is handed back and dropped with a
//! fault rather than accumulating unbounded memory.

use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use dossier_bus::{BusHandle, FaultReporter};
use dossier_gateway::InputEnvelope;
use dossier_types::{
    Address, FaultFamily, FaultRecord, Payload, RadioCode, SectionId, Severity, Signal,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The kinds of report section, as a sum type over the twelve ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Cover page (`CP`).
    Cover,
    /// Table of contents (`TOC`).
    Contents,
    /// Numbered body section (`1`–`8`).
    Body(u8),
    /// Disclosure page (`DP`).
    Disclosure,
    /// Final review (`FR`).
    FinalReview,
}

impl SectionKind {
    pub fn of(id: SectionId) -> Self {
        match id {
            SectionId::Cp => Self::Cover,
            SectionId::Toc => Self::Contents,
            SectionId::S1 => Self::Body(1),
            SectionId::S2 => Self::Body(2),
            SectionId::S3 => Self::Body(3),
            SectionId::S4 => Self::Body(4),
            SectionId::S5 => Self::Body(5),
            SectionId::S6 => Self::Body(6),
            SectionId::S7 => Self::Body(7),
            SectionId::S8 => Self::Body(8),
            SectionId::Dp => Self::Disclosure,
            SectionId::Fr => Self::FinalReview,
        }
    }

    pub fn title(self) -> String {
        match self {
            Self::Cover => "Cover Page".to_string(),
            Self::Contents => "Table of Contents".to_string(),
            Self::Body(n) => format!("Section {n}"),
            Self::Disclosure => "Disclosure Page".to_string(),
            Self::FinalReview => "Final Review".to_string(),
        }
    }
}

/// The section contract: consume an envelope, produce a payload.
///
/// Real renderers are external collaborators; the default implementation
/// produces a minimal structured payload so the pipeline runs end to end.
pub trait SectionProcessor: Send + Sync + 'static {
    /// Plans the work: collect, order, and annotate the inputs.
    fn prepare(&self, kind: SectionKind, envelope: &InputEnvelope) -> Payload;

    /// Produces the publishable payload from the plan.
    fn execute(&self, kind: SectionKind, envelope: &InputEnvelope, prepared: Payload) -> Payload;
}

/// Baseline processor: titles the section and accounts for its evidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSectionProcessor;

impl SectionProcessor for DefaultSectionProcessor {
    fn prepare(&self, kind: SectionKind, envelope: &InputEnvelope) -> Payload {
        let mut plan = Payload::new();
        plan.insert("title".into(), json!(kind.title()));
        plan.insert(
            "evidence".into(),
            json!(envelope.evidence.iter().map(ToString::to_string).collect::<Vec<_>>()),
        );
        plan
    }

    fn execute(&self, _kind: SectionKind, envelope: &InputEnvelope, prepared: Payload) -> Payload {
        let mut payload = prepared;
        payload.insert("evidence_count".into(), json!(envelope.evidence.len()));
        payload.insert("run".into(), json!(envelope.run));
        payload
    }
}

struct Job {
    section_id: SectionId,
    envelope: InputEnvelope,
}

/// The worker pool plus one forwarder per section address.
pub struct SectionWorkers;

impl SectionWorkers {
    /// Subscribes every section address and spawns the pool.
    ///
    /// `pool_size` of zero means available CPU parallelism.
    pub async fn spawn<P: SectionProcessor>(
        processor: P,
        pool_size: usize,
        inbox_capacity: usize,
        bus: BusHandle,
        fault: FaultReporter,
    ) -> Result<(), dossier_bus::BusError> {
        let pool_size = if pool_size == 0 {
            thread::available_parallelism().map_or(4, std::num::NonZero::get)
        } else {
            pool_size
        };
        let queue: Arc<ArrayQueue<Job>> = Arc::new(ArrayQueue::new(inbox_capacity.max(1)));
        let notify = Arc::new(Notify::new());
        let processor = Arc::new(processor);

        for section_id in SectionId::all() {
            let address = Address::section(section_id);
            let inbox = bus.subscribe(address.clone()).await?;
            let bus = bus.clone();
            let fault = fault.clone();
            let queue = Arc::clone(&queue);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                while let Some(signal) = inbox.recv().await {
                    if matches!(
                        signal.radio_code,
                        RadioCode::Status | RadioCode::Rollcall | RadioCode::RadioCheck
                    ) {
                        let mut payload = Payload::new();
                        payload.insert("ok".into(), json!(true));
                        payload.insert("component".into(), json!(format!("section-{section_id}")));
                        let _ = bus.respond(&signal, address.clone(), payload);
                        continue;
                    }
                    match signal.signal_type.as_str() {
                        "section.data.updated" => {
                            let Some(envelope) = parse_envelope(&signal) else {
                                warn!(%section_id, "unparseable input envelope");
                                continue;
                            };
                            let job = Job {
                                section_id,
                                envelope,
                            };
                            if queue.push(job).is_err() {
                                // Inbox full: backpressure, not memory.
                                fault.report(FaultRecord::new(
                                    address.clone(),
                                    FaultFamily::ResourceUnavailable,
                                    Severity::Medium,
                                    format!("section worker inbox full; {section_id} job dropped"),
                                ));
                            } else {
                                notify.notify_one();
                            }
                        }
                        "evidence.deliver" => {
                            debug!(%section_id, "evidence delivery noted");
                        }
                        other => debug!(%section_id, signal_type = other, "section ignoring signal"),
                    }
                }
            });
        }

        for worker in 0..pool_size {
            let bus = bus.clone();
            let fault = fault.clone();
            let queue = Arc::clone(&queue);
            let notify = Arc::clone(&notify);
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                debug!(worker, "section worker ready");
                loop {
                    let notified = notify.notified();
                    if let Some(job) = queue.pop() {
                        run_job(&bus, &fault, processor.as_ref(), job).await;
                        continue;
                    }
                    notified.await;
                }
            });
        }
        info!(pool_size, "section workers started");
        Ok(())
    }
}

async fn run_job<P: SectionProcessor>(
    bus: &BusHandle,
    fault: &FaultReporter,
    processor: &P,
    job: Job,
) {
    let kind = SectionKind::of(job.section_id);
    let prepared = processor.prepare(kind, &job.envelope);
    let produced = processor.execute(kind, &job.envelope, prepared);

    let mut payload = Payload::new();
    payload.insert("section_id".into(), json!(job.section_id.as_str()));
    payload.insert("payload".into(), json!(produced));
    let publish = Signal::request(
        Address::section(job.section_id),
        Address::gateway(),
        "section.publish",
        RadioCode::TenEight,
        payload,
    );
    match bus.request(publish).await {
        Ok(response) if response.payload.get("ok").and_then(Value::as_bool) == Some(true) => {
            debug!(section_id = %job.section_id, "section published");
        }
        Ok(response) => {
            warn!(
                section_id = %job.section_id,
                error = ?response.payload.get("error"),
                "publication refused"
            );
        }
        Err(error) => {
            fault.report(FaultRecord::new(
                Address::section(job.section_id),
                FaultFamily::Timeout,
                Severity::Medium,
                format!("publication of {} failed: {error}", job.section_id),
            ));
        }
    }
}

fn parse_envelope(signal: &Signal) -> Option<InputEnvelope> {
    signal
        .payload
        .get("envelope")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_all_twelve_sections() {
        assert_eq!(SectionKind::of(SectionId::Cp), SectionKind::Cover);
        assert_eq!(SectionKind::of(SectionId::S5), SectionKind::Body(5));
        assert_eq!(SectionKind::of(SectionId::Fr), SectionKind::FinalReview);
    }

    #[test]
    fn default_processor_produces_a_publishable_payload() {
        let envelope = InputEnvelope::new(
            SectionId::S3,
            vec![dossier_types::EvidenceId::generate()],
            2,
        );
        let processor = DefaultSectionProcessor;
        let kind = SectionKind::of(SectionId::S3);
        let payload = processor.execute(kind, &envelope, processor.prepare(kind, &envelope));
        assert_eq!(payload["title"], json!("Section 3"));
        assert_eq!(payload["evidence_count"], json!(1));
        assert_eq!(payload["run"], json!(2));
        assert!(!payload.is_empty());
    }
}
