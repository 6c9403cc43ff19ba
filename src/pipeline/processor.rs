//! Decision pipeline: produces exactly one verdict per message.
//!
//! Flow:
//! 1. Rule matcher (fast, no I/O) → may short-circuit
//! 2. Sender history → may bypass the classifier
//! 3. Few-shot examples + classifier → calibrated model verdict
//!
//! The assessment is complete before anything is written; the verdict is
//! then stored with a single upsert keyed by message id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::TriageConfig;
use crate::error::PipelineError;
use crate::llm::{ClassificationRequest, ClassificationService};
use crate::pipeline::calibration::{CalibrationTable, ConfidenceCalibrator};
use crate::pipeline::examples::{EXAMPLE_LIMIT, ExampleSelector};
use crate::pipeline::history::{SenderHistory, SenderProfile};
use crate::pipeline::rules::RuleMatcher;
use crate::pipeline::types::{
    Assessment, Priority, Recommendation, RunReport, RunStats, SourceTier, StoredMessage, Verdict,
};
use crate::store::TriageStore;

/// Slack added on top of the HTTP timeout for the pipeline-level bound.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Category hint for messages never analysed before.
const UNKNOWN_CATEGORY: &str = "unknown";

/// Statistics captured once for a parallel rescan.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    profiles: HashMap<String, SenderProfile>,
    table: CalibrationTable,
}

/// Where tiers 2 and 3 read their statistics from.
enum Stats<'a> {
    Live,
    Snapshot(&'a StatsSnapshot),
}

/// What a full pass over the tiers produced, before it is stored.
struct Outcome {
    assessment: Assessment,
    classifier_failed: bool,
    calibrated: bool,
}

/// Tiered decision pipeline.
pub struct DecisionPipeline {
    store: Arc<dyn TriageStore>,
    rules: RuleMatcher,
    history: SenderHistory,
    examples: ExampleSelector,
    classifier: Arc<dyn ClassificationService>,
    calibrator: ConfidenceCalibrator,
    classifier_timeout: Duration,
    min_calibration_adjustment: f64,
    max_conflict_retries: u32,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DecisionPipeline {
    pub fn new(
        store: Arc<dyn TriageStore>,
        rules: RuleMatcher,
        classifier: Arc<dyn ClassificationService>,
        config: &TriageConfig,
    ) -> Self {
        Self {
            history: SenderHistory::new(Arc::clone(&store)),
            examples: ExampleSelector::new(Arc::clone(&store)),
            calibrator: ConfidenceCalibrator::new(Arc::clone(&store), config.calibration.clone()),
            store,
            rules,
            classifier,
            classifier_timeout: config.classifier.timeout() + TIMEOUT_SLACK,
            min_calibration_adjustment: config.calibration.min_adjustment,
            max_conflict_retries: config.scanner.max_conflict_retries,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the pipeline-level classifier timeout.
    pub fn with_classifier_timeout(mut self, timeout: Duration) -> Self {
        self.classifier_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn TriageStore> {
        &self.store
    }

    pub fn calibrator(&self) -> &ConfidenceCalibrator {
        &self.calibrator
    }

    /// Process one message against live statistics.
    pub async fn process(&self, message: &StoredMessage) -> Result<Verdict, PipelineError> {
        let mut stats = RunStats::default();
        self.process_with_retry(message, &Stats::Live, &mut stats).await
    }

    /// Process messages one after another against live statistics, so each
    /// decision recorded mid-batch is visible to the next message.
    ///
    /// Failures on individual messages are logged and counted, not fatal.
    pub async fn process_batch(&self, messages: &[StoredMessage]) -> RunReport {
        info!(count = messages.len(), "Processing message batch");
        let mut report = RunReport::default();
        for message in messages {
            match self.process_with_retry(message, &Stats::Live, &mut report.stats).await {
                Ok(verdict) => report.verdicts.push(verdict),
                Err(e) => {
                    report.stats.failed += 1;
                    error!(id = %message.id, error = %e, "Failed to process message");
                }
            }
        }
        log_run("Batch", &report.stats);
        report
    }

    /// Re-analyse messages in parallel. Sender profiles and calibration
    /// buckets are captured once up front and shared by every task.
    pub async fn rescan(
        &self,
        messages: Vec<StoredMessage>,
        concurrency: usize,
    ) -> Result<RunReport, PipelineError> {
        let snapshot = self.snapshot(&messages).await?;
        info!(
            count = messages.len(),
            senders = snapshot.profiles.len(),
            concurrency,
            "Rescanning messages"
        );

        let snapshot = &snapshot;
        let results: Vec<(Result<Verdict, PipelineError>, RunStats, String)> =
            stream::iter(messages)
                .map(|message| async move {
                    let mut stats = RunStats::default();
                    let result = self
                        .process_with_retry(&message, &Stats::Snapshot(snapshot), &mut stats)
                        .await;
                    (result, stats, message.id)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        let mut report = RunReport::default();
        for (result, stats, id) in results {
            report.stats.merge(&stats);
            match result {
                Ok(verdict) => report.verdicts.push(verdict),
                Err(e) => {
                    report.stats.failed += 1;
                    error!(id = %id, error = %e, "Failed to rescan message");
                }
            }
        }
        log_run("Rescan", &report.stats);
        Ok(report)
    }

    /// Capture profiles for every distinct sender plus the calibration table.
    pub async fn snapshot(&self, messages: &[StoredMessage]) -> Result<StatsSnapshot, PipelineError> {
        let senders: HashSet<&str> = messages.iter().map(|m| m.message.sender.as_str()).collect();
        let mut profiles = HashMap::with_capacity(senders.len());
        for sender in senders {
            profiles.insert(sender.to_string(), self.history.sender_profile(sender).await?);
        }
        let table = self.calibrator.snapshot().await?;
        Ok(StatsSnapshot { profiles, table })
    }

    /// Run one message, retrying the whole unit on storage conflicts.
    async fn process_with_retry(
        &self,
        message: &StoredMessage,
        stats_source: &Stats<'_>,
        stats: &mut RunStats,
    ) -> Result<Verdict, PipelineError> {
        let mut attempt = 0;
        loop {
            match self.process_locked(message, stats_source, stats).await {
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    warn!(id = %message.id, attempt, error = %e, "Storage conflict, retrying message");
                }
                other => return other,
            }
        }
    }

    async fn process_locked(
        &self,
        message: &StoredMessage,
        stats_source: &Stats<'_>,
        stats: &mut RunStats,
    ) -> Result<Verdict, PipelineError> {
        let lock = self.message_lock(&message.id);
        let result = {
            let _guard = lock.lock().await;
            self.process_once(message, stats_source, stats).await
        };
        drop(lock);
        self.release_lock(&message.id);
        result
    }

    async fn process_once(
        &self,
        message: &StoredMessage,
        stats_source: &Stats<'_>,
        stats: &mut RunStats,
    ) -> Result<Verdict, PipelineError> {
        let now = Utc::now();
        debug!(id = %message.id, sender = %message.message.sender, "Processing message");

        let outcome = self.assess(message, stats_source, now).await?;
        // Counted only once the write has succeeded
        let mut counted = RunStats::default();
        counted.record(&outcome.assessment);
        counted.model_failures = usize::from(outcome.classifier_failed);
        counted.calibrations_applied = usize::from(outcome.calibrated);
        counted.processed = 1;

        let verdict = Verdict::from_assessment(&message.id, outcome.assessment, now);
        self.store.upsert_verdict(&verdict).await?;
        stats.merge(&counted);

        info!(
            id = %message.id,
            tier = %verdict.source_tier,
            recommendation = %verdict.recommendation,
            confidence = verdict.confidence,
            "Verdict recorded"
        );
        Ok(verdict)
    }

    async fn assess(
        &self,
        stored: &StoredMessage,
        stats_source: &Stats<'_>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, PipelineError> {
        let message = &stored.message;

        // Tier 1: rules
        if let Some(assessment) = self.rules.evaluate(message, now) {
            return Ok(Outcome {
                assessment,
                classifier_failed: false,
                calibrated: false,
            });
        }

        // Tier 2: sender history
        let bypass = match stats_source {
            Stats::Live => self.history.should_bypass_classifier(&message.sender).await?,
            Stats::Snapshot(s) => s
                .profiles
                .get(&message.sender)
                .and_then(SenderProfile::bypass_assessment),
        };
        if let Some(assessment) = bypass {
            return Ok(Outcome {
                assessment,
                classifier_failed: false,
                calibrated: false,
            });
        }

        // Tier 3: classifier + calibration
        let category_hint = self
            .store
            .get_verdict(&stored.id)
            .await?
            .map(|v| v.category)
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
        let examples = self
            .examples
            .select_examples(&message.sender, &category_hint, EXAMPLE_LIMIT)
            .await?;
        let request = ClassificationRequest::new(message, examples, now);
        let model_name = self.classifier.model_name().to_string();

        let classified =
            match tokio::time::timeout(self.classifier_timeout, self.classifier.classify(&request))
                .await
            {
                Ok(Ok(c)) => Ok(c),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.classifier_timeout)),
            };

        let classification = match classified {
            Ok(c) => c,
            Err(reason) => {
                warn!(id = %stored.id, sender = %message.sender, error = %reason, "Classifier failed, defaulting to keep");
                return Ok(Outcome {
                    assessment: Assessment {
                        recommendation: Recommendation::Keep,
                        confidence: 0.5,
                        stated_confidence: None,
                        category: UNKNOWN_CATEGORY.to_string(),
                        priority: Priority::Medium,
                        reasoning: format!("analysis failed: {reason}"),
                        source_tier: SourceTier::Model,
                        model_name,
                        rule: None,
                    },
                    classifier_failed: true,
                    calibrated: false,
                });
            }
        };

        let stated = classification.confidence;
        let calibration = match stats_source {
            Stats::Live => {
                self.calibrator
                    .calibrate(stated, &classification.category)
                    .await?
            }
            Stats::Snapshot(s) => {
                self.calibrator
                    .calibrate_with(&s.table, stated, &classification.category)
            }
        };

        let mut confidence = stated;
        let mut reasoning = classification.reasoning;
        let calibrated = (calibration.confidence - stated).abs() > self.min_calibration_adjustment;
        if calibrated {
            debug!(
                id = %stored.id,
                stated,
                calibrated = calibration.confidence,
                "Applying confidence calibration"
            );
            confidence = calibration.confidence;
            reasoning = format!(
                "{reasoning} (Confidence calibrated: {})",
                calibration.reasoning
            );
        }

        Ok(Outcome {
            assessment: Assessment {
                recommendation: classification.recommendation,
                confidence,
                stated_confidence: Some(stated),
                category: classification.category,
                priority: classification.priority,
                reasoning,
                source_tier: SourceTier::Model,
                model_name,
                rule: None,
            },
            classifier_failed: false,
            calibrated,
        })
    }

    fn message_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drop the lock entry once nobody else holds it.
    fn release_lock(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1);
        if idle {
            locks.remove(id);
        }
    }
}

fn log_run(kind: &str, stats: &RunStats) {
    info!(
        kind,
        processed = stats.processed,
        failed = stats.failed,
        rule_matches = stats.rule_match_total(),
        pattern_bypasses = stats.pattern_bypasses,
        model_classified = stats.model_classified,
        model_failures = stats.model_failures,
        calibrations = stats.calibrations_applied,
        "Run complete"
    );
}
