//! Classification driver.
//!
//! The classifier itself is an external transformation service; the locker
//! only drives it: bounded attempts with exponential backoff and jitter,
//! all inside a per-item budget. Exhausting the budget or the attempts
//! marks the item `unknown` — the system stays operable.

use std::time::Duration;

use dossier_types::{Classification, EvidenceKind};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    /// The service is temporarily unavailable; worth retrying.
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the item.
    #[error("classification failed: {0}")]
    Failed(String),

    /// The per-item budget elapsed before any attempt succeeded.
    #[error("classification budget exhausted")]
    BudgetExhausted,
}

/// An external classification service.
///
/// Implementations run real OCR/media analysis; tests use canned results.
pub trait Classifier: Send + Sync + 'static {
    fn classify(
        &self,
        kind: EvidenceKind,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<Classification, ClassifierError>> + Send;
}

/// Retry tuning for the driver.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierSettings {
    /// Total budget per item, covering every attempt and backoff.
    pub budget: Duration,
    /// Attempts before giving up.
    pub attempts: u32,
    /// First backoff delay; doubles per attempt, plus jitter.
    pub backoff_base: Duration,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(120),
            attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

/// Runs the classifier with retries inside the item budget.
pub async fn classify_with_retry<C: Classifier>(
    classifier: &C,
    settings: ClassifierSettings,
    kind: EvidenceKind,
    bytes: Vec<u8>,
) -> Result<Classification, ClassifierError> {
    let attempt_loop = async {
        let mut last_error = ClassifierError::Failed("no attempts made".to_string());
        for attempt in 0..settings.attempts {
            if attempt > 0 {
                let backoff = settings.backoff_base * 2u32.pow(attempt - 1);
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2));
                tokio::time::sleep(backoff + jitter).await;
            }
            match classifier.classify(kind, bytes.clone()).await {
                Ok(classification) => return Ok(classification),
                Err(error) => {
                    warn!(attempt = attempt + 1, %error, "classification attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    };

    match tokio::time::timeout(settings.budget, attempt_loop).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ClassifierError::BudgetExhausted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClassifier {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl Classifier for FlakyClassifier {
        async fn classify(
            &self,
            _kind: EvidenceKind,
            _bytes: Vec<u8>,
        ) -> Result<Classification, ClassifierError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(ClassifierError::Unavailable("warming up".into()))
            } else {
                Ok(Classification::new("ledger"))
            }
        }
    }

    struct HangingClassifier;

    impl Classifier for HangingClassifier {
        async fn classify(
            &self,
            _kind: EvidenceKind,
            _bytes: Vec<u8>,
        ) -> Result<Classification, ClassifierError> {
            std::future::pending().await
        }
    }

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            budget: Duration::from_secs(120),
            attempts: 3,
            backoff_base: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn recovers_within_attempt_budget() {
        let classifier = FlakyClassifier {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let result =
            classify_with_retry(&classifier, settings(), EvidenceKind::Document, vec![1, 2]).await;
        assert_eq!(result.unwrap(), Classification::new("ledger"));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let classifier = FlakyClassifier {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let result =
            classify_with_retry(&classifier, settings(), EvidenceKind::Document, vec![]).await;
        assert!(matches!(result, Err(ClassifierError::Unavailable(_))));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_caps_a_hanging_service() {
        let result = classify_with_retry(
            &HangingClassifier,
            ClassifierSettings::default(),
            EvidenceKind::Video,
            vec![],
        )
        .await;
        assert_eq!(result, Err(ClassifierError::BudgetExhausted));
    }
}
