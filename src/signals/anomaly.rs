//! Z-score anomaly detection over a bounded recent window
//!
//! Statistics are recomputed from the owner's most recent transactions in the
//! same category on every call. Nothing is cached between calls.

use crate::store::{LedgerStore, StoreError};
use crate::types::{AnomalyResult, Severity, Transaction};
use std::sync::Arc;

/// Most recent same-category transactions considered
pub const HISTORY_WINDOW: usize = 50;

/// Below this many samples a transaction is never flagged
pub const MIN_SAMPLES: usize = 10;

const HIGH_Z: f64 = 3.0;
const MEDIUM_Z: f64 = 2.0;

pub struct AnomalyDetector {
    store: Arc<dyn LedgerStore>,
    window: usize,
    min_samples: usize,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            window: HISTORY_WINDOW,
            min_samples: MIN_SAMPLES,
        }
    }

    /// Score `transaction` against its owner's recent history
    ///
    /// The transaction's own id is excluded from the history, so the result is
    /// the same whether or not it has been persisted yet.
    pub async fn evaluate(&self, transaction: &Transaction) -> Result<AnomalyResult, StoreError> {
        let history = self
            .store
            .recent_transactions(
                &transaction.owner_id,
                transaction.category,
                self.window,
                Some(&transaction.id),
            )
            .await?;

        let amounts: Vec<f64> = history.iter().map(|t| t.amount).collect();
        Ok(score(transaction, &amounts, self.min_samples))
    }
}

/// Population mean and standard deviation
pub fn mean_and_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Classify `transaction` against `history` amounts
pub fn score(transaction: &Transaction, history: &[f64], min_samples: usize) -> AnomalyResult {
    let amount = transaction.amount;

    if history.len() < min_samples {
        return AnomalyResult {
            is_anomaly: false,
            severity: Severity::Low,
            reason: format!(
                "Insufficient data: {} prior {} transactions, need at least {}",
                history.len(),
                transaction.category,
                min_samples
            ),
            z_score: 0.0,
            mean: 0.0,
            transaction: transaction.clone(),
        };
    }

    let (mean, std_dev) = mean_and_std(history);
    let z_score = if std_dev > 0.0 { (amount - mean) / std_dev } else { 0.0 };
    let magnitude = z_score.abs();

    let (is_anomaly, severity) = if magnitude > HIGH_Z {
        (true, Severity::High)
    } else if magnitude > MEDIUM_Z {
        (true, Severity::Medium)
    } else {
        (false, Severity::Low)
    };

    AnomalyResult {
        is_anomaly,
        severity,
        reason: format!(
            "Amount ₹{:.2} is {:.1} standard deviations from the mean ₹{:.2}",
            amount, z_score, mean
        ),
        z_score,
        mean,
        transaction: transaction.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;
    use chrono::NaiveDate;

    fn transaction(amount: f64) -> Transaction {
        Transaction {
            id: "t-new".to_string(),
            owner_id: "u1".to_string(),
            amount,
            category: Category::Transport,
            date: NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
            merchant: None,
            description: None,
            document_id: None,
        }
    }

    /// 12 samples, mean 200, population std-dev 20
    fn history() -> Vec<f64> {
        let mut samples = vec![180.0; 6];
        samples.extend(vec![220.0; 6]);
        samples
    }

    #[test]
    fn test_insufficient_data_floor() {
        let result = score(&transaction(1_000_000.0), &[10.0; 9], MIN_SAMPLES);
        assert!(!result.is_anomaly);
        assert_eq!(result.severity, Severity::Low);
        assert!(result.reason.starts_with("Insufficient data"));
    }

    #[test]
    fn test_high_severity_at_five_sigma() {
        let result = score(&transaction(300.0), &history(), MIN_SAMPLES);
        assert!((result.z_score - 5.0).abs() < 1e-9);
        assert!(result.is_anomaly);
        assert_eq!(result.severity, Severity::High);
        assert_eq!(result.reason, "Amount ₹300.00 is 5.0 standard deviations from the mean ₹200.00");
    }

    #[test]
    fn test_medium_band_is_exclusive_of_two() {
        let at_two = score(&transaction(240.0), &history(), MIN_SAMPLES);
        assert!(!at_two.is_anomaly);

        let at_three = score(&transaction(260.0), &history(), MIN_SAMPLES);
        assert!(at_three.is_anomaly);
        assert_eq!(at_three.severity, Severity::Medium);
    }

    #[test]
    fn test_zero_variance_guard() {
        let result = score(&transaction(999.0), &[50.0; 12], MIN_SAMPLES);
        assert_eq!(result.z_score, 0.0);
        assert!(!result.is_anomaly);
    }

    #[test]
    fn test_z_monotonic_in_amount() {
        let samples = history();
        let mut previous = f64::MIN;
        for amount in (200..=600).step_by(25) {
            let z = score(&transaction(amount as f64), &samples, MIN_SAMPLES).z_score.abs();
            assert!(z >= previous);
            previous = z;
        }
    }
}
