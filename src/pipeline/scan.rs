//! Scanner: pulls messages from a mail source and runs them through the
//! decision pipeline.
//!
//! Per scan:
//! 1. `MailSource::fetch_messages()` (limit, newest first)
//! 2. Skip external ids already registered, unless rescanning
//! 3. `register_message()` → `DecisionPipeline::process_batch()`
//!
//! `spawn_scan_loop` runs scans on a timer with a stop flag that is checked
//! before each run and between messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ScannerConfig;
use crate::error::PipelineError;
use crate::pipeline::processor::DecisionPipeline;
use crate::pipeline::types::{RunReport, StoredMessage};
use crate::source::MailSource;

const STOP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub limit: usize,
    pub newest_first: bool,
    /// Re-analyse messages that are already registered.
    pub rescan: bool,
}

impl From<&ScannerConfig> for ScanOptions {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            limit: config.limit,
            newest_first: config.newest_first,
            rescan: false,
        }
    }
}

pub struct Scanner {
    source: Arc<dyn MailSource>,
    pipeline: Arc<DecisionPipeline>,
    stop: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(source: Arc<dyn MailSource>, pipeline: Arc<DecisionPipeline>) -> Self {
        Self {
            source,
            pipeline,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pipeline(&self) -> &Arc<DecisionPipeline> {
        &self.pipeline
    }

    /// Flag that stops dispatching new messages. In-flight work finishes.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Run one scan.
    pub async fn scan(&self, options: ScanOptions) -> Result<RunReport, PipelineError> {
        let store = self.pipeline.store();
        let fetched = self
            .source
            .fetch_messages(options.limit, options.newest_first)
            .await?;
        info!(
            source = self.source.name(),
            fetched = fetched.len(),
            rescan = options.rescan,
            "Scan started"
        );

        let mut pending: Vec<StoredMessage> = Vec::with_capacity(fetched.len());
        for message in fetched {
            if !options.rescan
                && store
                    .get_message_by_external_id(&message.external_id)
                    .await?
                    .is_some()
            {
                debug!(external_id = %message.external_id, "Already analysed, skipping");
                continue;
            }
            pending.push(store.register_message(&message).await?);
        }

        let mut report = RunReport::default();
        for message in &pending {
            if self.stopped() {
                info!(remaining = pending.len() - report.stats.processed - report.stats.failed, "Scan stopped");
                break;
            }
            let batch = self.pipeline.process_batch(std::slice::from_ref(message)).await;
            report.verdicts.extend(batch.verdicts);
            report.stats.merge(&batch.stats);
        }

        info!(
            processed = report.stats.processed,
            failed = report.stats.failed,
            rule_matches = report.stats.rule_match_total(),
            pattern_bypasses = report.stats.pattern_bypasses,
            model_classified = report.stats.model_classified,
            "Scan complete"
        );
        Ok(report)
    }
}

/// Spawn a background task that scans on a timer.
///
/// Returns a `JoinHandle` and the scanner's stop flag.
pub fn spawn_scan_loop(
    scanner: Arc<Scanner>,
    options: ScanOptions,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let stop = scanner.stop_flag();

    let handle = tokio::spawn(async move {
        info!("Scan loop started, scanning every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        // Run immediately on first tick
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wait_for_stop(&scanner) => {}
            }

            if scanner.stopped() {
                info!("Scan loop shutting down");
                return;
            }

            if let Err(e) = scanner.scan(options).await {
                error!(error = %e, "Scan failed");
            }
        }
    });

    (handle, stop)
}

/// Resolves once the stop flag is raised.
async fn wait_for_stop(scanner: &Scanner) {
    let mut poll = tokio::time::interval(STOP_POLL);
    while !scanner.stopped() {
        poll.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::TriageConfig;
    use crate::error::{ClassifierError, SourceError};
    use crate::llm::{Classification, ClassificationRequest, ClassificationService};
    use crate::pipeline::rules::RuleMatcher;
    use crate::pipeline::test_support::{memory_store, message};
    use crate::pipeline::types::{Message, Priority, Recommendation};
    use crate::store::TriageStore;

    struct VecSource {
        messages: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MailSource for VecSource {
        fn name(&self) -> &str {
            "vec"
        }

        async fn fetch_messages(&self, limit: usize, _newest_first: bool) -> Result<Vec<Message>, SourceError> {
            let messages = self.messages.lock().unwrap();
            Ok(messages.iter().take(limit).cloned().collect())
        }

        async fn delete_message(&self, external_id: &str) -> Result<bool, SourceError> {
            let mut messages = self.messages.lock().unwrap();
            let before = messages.len();
            messages.retain(|m| m.external_id != external_id);
            Ok(messages.len() != before)
        }
    }

    /// Keeps everything and raises the stop flag after the first call.
    struct StoppingClassifier {
        stop: Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl ClassificationService for StoppingClassifier {
        fn model_name(&self) -> &str {
            "stopper"
        }

        async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification, ClassifierError> {
            if let Some(flag) = self.stop.lock().unwrap().as_ref() {
                flag.store(true, Ordering::Relaxed);
            }
            Ok(Classification {
                recommendation: Recommendation::Keep,
                confidence: 0.6,
                category: "work".into(),
                priority: Priority::Medium,
                reasoning: "fine".into(),
            })
        }
    }

    async fn scanner(
        store: Arc<dyn TriageStore>,
        messages: Vec<Message>,
    ) -> (Scanner, Arc<StoppingClassifier>) {
        let config = TriageConfig::default();
        let classifier = Arc::new(StoppingClassifier { stop: Mutex::new(None) });
        let pipeline = DecisionPipeline::new(
            store,
            RuleMatcher::new(&config.rules).unwrap(),
            classifier.clone(),
            &config,
        );
        let source = Arc::new(VecSource { messages: Mutex::new(messages) });
        (Scanner::new(source, Arc::new(pipeline)), classifier)
    }

    fn options(rescan: bool) -> ScanOptions {
        ScanOptions { limit: 50, newest_first: true, rescan }
    }

    #[tokio::test]
    async fn skips_known_messages_unless_rescan() {
        let store = memory_store().await;
        let msgs = vec![
            message("a", "one@vendor.io", "Quarterly figures", 1),
            message("b", "two@vendor.io", "Invoice attached", 1),
        ];
        let (scanner, _) = scanner(store.clone(), msgs).await;

        let first = scanner.scan(options(false)).await.unwrap();
        assert_eq!(first.stats.processed, 2);

        let second = scanner.scan(options(false)).await.unwrap();
        assert_eq!(second.stats.processed, 0);

        let third = scanner.scan(options(true)).await.unwrap();
        assert_eq!(third.stats.processed, 2);
        assert_eq!(store.find_messages(&crate::store::MessageFilter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_flag_halts_dispatch_between_messages() {
        let store = memory_store().await;
        let msgs = vec![
            message("a", "one@vendor.io", "Quarterly figures", 1),
            message("b", "two@vendor.io", "Invoice attached", 1),
            message("c", "three@vendor.io", "Status report", 1),
        ];
        let (scanner, classifier) = scanner(store, msgs).await;
        *classifier.stop.lock().unwrap() = Some(scanner.stop_flag());

        let report = scanner.scan(options(false)).await.unwrap();
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.verdicts.len(), 1);
    }

    #[tokio::test]
    async fn scan_loop_exits_when_stopped() {
        let store = memory_store().await;
        let (scanner, _) = scanner(store, vec![]).await;
        let (handle, stop) = spawn_scan_loop(Arc::new(scanner), options(false), Duration::from_millis(10));
        stop.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
