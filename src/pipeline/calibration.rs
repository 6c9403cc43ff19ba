//! Confidence calibration.
//!
//! Compares the classifier's stated confidence with how often reviewers
//! agreed, in five fixed buckets, and nudges new scores toward the observed
//! accuracy.

use std::fmt;
use std::sync::Arc;

use crate::config::CalibrationConfig;
use crate::error::DatabaseError;
use crate::store::{CalibrationSample, TriageStore};

/// Gap between stated confidence and accuracy treated as noise.
const TOLERANCE: f64 = 0.05;

/// Fixed confidence ranges. All half-open except the last, which is closed.
pub const BUCKETS: [(f64, f64, &str); 5] = [
    (0.0, 0.5, "very_low"),
    (0.5, 0.7, "low"),
    (0.7, 0.85, "medium"),
    (0.85, 0.95, "high"),
    (0.95, 1.0, "very_high"),
];

/// Index of the bucket containing `confidence` (clamped to [0, 1]).
pub fn bucket_index(confidence: f64) -> usize {
    let c = confidence.clamp(0.0, 1.0);
    BUCKETS
        .iter()
        .position(|(lo, hi, _)| c >= *lo && c < *hi)
        .unwrap_or(BUCKETS.len() - 1)
}

/// Accuracy statistics for one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketStats {
    pub name: &'static str,
    pub lower: f64,
    pub upper: f64,
    pub total: usize,
    pub correct: usize,
    /// Mean stated confidence; the bucket midpoint when empty.
    pub avg_stated: f64,
}

impl BucketStats {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Stated minus actual. Positive means overconfident.
    pub fn error(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.avg_stated - self.accuracy()
        }
    }
}

/// Per-bucket statistics computed once from a set of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    buckets: Vec<BucketStats>,
}

impl CalibrationTable {
    pub fn from_samples(samples: &[CalibrationSample]) -> Self {
        let mut sums = [(0usize, 0usize, 0.0f64); BUCKETS.len()];
        for s in samples {
            let slot = &mut sums[bucket_index(s.stated_confidence)];
            slot.0 += 1;
            slot.1 += usize::from(s.agreed);
            slot.2 += s.stated_confidence;
        }

        let buckets = BUCKETS
            .iter()
            .zip(sums)
            .map(|(&(lower, upper, name), (total, correct, sum))| BucketStats {
                name,
                lower,
                upper,
                total,
                correct,
                avg_stated: if total == 0 {
                    (lower + upper) / 2.0
                } else {
                    sum / total as f64
                },
            })
            .collect();
        Self { buckets }
    }

    pub fn bucket_for(&self, confidence: f64) -> &BucketStats {
        &self.buckets[bucket_index(confidence)]
    }

    pub fn buckets(&self) -> &[BucketStats] {
        &self.buckets
    }
}

/// Result of calibrating one score.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrated {
    pub confidence: f64,
    pub reasoning: String,
}

/// Damped correction of `stated` using its bucket's history.
pub fn calibrate(stated: f64, bucket: &BucketStats, config: &CalibrationConfig) -> Calibrated {
    if bucket.total < config.min_samples {
        return Calibrated {
            confidence: stated,
            reasoning: format!("Insufficient data for calibration ({} samples)", bucket.total),
        };
    }

    let accuracy = bucket.accuracy();
    let error = bucket.error();
    let confidence = (stated - error * config.damping).clamp(0.0, 1.0);

    let reasoning = if error.abs() < TOLERANCE {
        format!("Well-calibrated (accuracy: {:.1}%)", accuracy * 100.0)
    } else if error > 0.0 {
        format!(
            "Adjusted down (overconfident in this range: {:.1}% actual vs {:.1}% stated)",
            accuracy * 100.0,
            bucket.avg_stated * 100.0
        )
    } else {
        format!(
            "Adjusted up (underconfident in this range: {:.1}% actual vs {:.1}% stated)",
            accuracy * 100.0,
            bucket.avg_stated * 100.0
        )
    };

    Calibrated {
        confidence,
        reasoning,
    }
}

/// Calibration across all reviewed model-tier verdicts.
#[derive(Debug, Clone, PartialEq)]
pub struct OverallCalibration {
    pub total: usize,
    pub accuracy: f64,
    pub avg_confidence: f64,
    pub error: f64,
    pub overconfident: bool,
    pub underconfident: bool,
    pub table: CalibrationTable,
    pub min_samples: usize,
}

impl OverallCalibration {
    pub fn from_samples(samples: &[CalibrationSample], min_samples: usize) -> Self {
        let total = samples.len();
        let (accuracy, avg_confidence) = if total == 0 {
            (0.0, 0.0)
        } else {
            let correct = samples.iter().filter(|s| s.agreed).count();
            let sum: f64 = samples.iter().map(|s| s.stated_confidence).sum();
            (correct as f64 / total as f64, sum / total as f64)
        };
        Self {
            total,
            accuracy,
            avg_confidence,
            error: avg_confidence - accuracy,
            overconfident: avg_confidence > accuracy + TOLERANCE,
            underconfident: avg_confidence < accuracy - TOLERANCE,
            table: CalibrationTable::from_samples(samples),
            min_samples,
        }
    }
}

impl fmt::Display for OverallCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Confidence Calibration Report ===")?;
        writeln!(f)?;
        writeln!(f, "Overall:")?;
        writeln!(f, "  Total decisions: {}", self.total)?;
        writeln!(f, "  Accuracy: {:.1}%", self.accuracy * 100.0)?;
        writeln!(f, "  Avg confidence: {:.1}%", self.avg_confidence * 100.0)?;
        writeln!(f, "  Calibration error: {:+.1}%", self.error * 100.0)?;
        if self.overconfident {
            writeln!(f, "  Classifier tends to be overconfident")?;
        } else if self.underconfident {
            writeln!(f, "  Classifier tends to be underconfident")?;
        } else {
            writeln!(f, "  Classifier is well-calibrated")?;
        }

        writeln!(f)?;
        writeln!(f, "By confidence level:")?;
        for b in self.table.buckets().iter().filter(|b| b.total > 0) {
            writeln!(
                f,
                "  {:.0}%-{:.0}% ({}): {} samples, {:.1}% accurate, {:.1}% stated, error {:+.1}%",
                b.lower * 100.0,
                b.upper * 100.0,
                b.name,
                b.total,
                b.accuracy() * 100.0,
                b.avg_stated * 100.0,
                b.error() * 100.0
            )?;
            let verdict = if b.total < self.min_samples {
                format!("need more data (min {} samples)", self.min_samples)
            } else if b.error().abs() < TOLERANCE {
                "well-calibrated".to_string()
            } else if b.error() > 0.0 {
                "overconfident in this range".to_string()
            } else {
                "underconfident in this range".to_string()
            };
            writeln!(f, "    {verdict}")?;
        }
        Ok(())
    }
}

/// Store-backed calibrator. Calibration is global; the category argument is
/// accepted for interface stability and ignored.
#[derive(Clone)]
pub struct ConfidenceCalibrator {
    store: Arc<dyn TriageStore>,
    config: CalibrationConfig,
}

impl ConfidenceCalibrator {
    pub fn new(store: Arc<dyn TriageStore>, config: CalibrationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Current bucket statistics.
    pub async fn snapshot(&self) -> Result<CalibrationTable, DatabaseError> {
        let samples = self.store.calibration_samples().await?;
        Ok(CalibrationTable::from_samples(&samples))
    }

    /// Calibrate against live statistics.
    pub async fn calibrate(
        &self,
        stated: f64,
        category: &str,
    ) -> Result<Calibrated, DatabaseError> {
        let table = self.snapshot().await?;
        Ok(self.calibrate_with(&table, stated, category))
    }

    /// Calibrate against a previously taken snapshot.
    pub fn calibrate_with(&self, table: &CalibrationTable, stated: f64, _category: &str) -> Calibrated {
        calibrate(stated, table.bucket_for(stated), &self.config)
    }

    pub async fn overall(&self) -> Result<OverallCalibration, DatabaseError> {
        let samples = self.store.calibration_samples().await?;
        Ok(OverallCalibration::from_samples(&samples, self.config.min_samples))
    }
}
