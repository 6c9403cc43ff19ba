//! End-to-end flow over a temporary Maildir: scan, review, cleanup, and the
//! sender pattern taking over once decisions accumulate.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use mail_triage::config::TriageConfig;
use mail_triage::error::ClassifierError;
use mail_triage::llm::{Classification, ClassificationRequest, ClassificationService};
use mail_triage::pipeline::rules::RuleMatcher;
use mail_triage::pipeline::types::{
    ActionTaken, Priority, Recommendation, RuleKind, SourceTier,
};
use mail_triage::pipeline::{DecisionPipeline, ScanOptions, Scanner};
use mail_triage::review::Review;
use mail_triage::source::{MailSource, MaildirSource};
use mail_triage::store::{LibSqlBackend, TriageStore};

/// Deletes anything from the deals sender, keeps the rest.
struct SenderClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl ClassificationService for SenderClassifier {
    fn model_name(&self) -> &str {
        "sender-mock"
    }

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (recommendation, confidence, category) = if request.sender.starts_with("deals@") {
            (Recommendation::Delete, 0.9, "promotional")
        } else {
            (Recommendation::Keep, 0.7, "work")
        };
        Ok(Classification {
            recommendation,
            confidence,
            category: category.into(),
            priority: Priority::Low,
            reasoning: "mock".into(),
        })
    }
}

fn write_mail(dir: &Path, name: &str, from: &str, subject: &str, age_days: i64) {
    let date = (Utc::now() - Duration::days(age_days)).to_rfc2822();
    let raw = format!(
        "From: {from}\r\nTo: me@home.example\r\nSubject: {subject}\r\nDate: {date}\r\n\r\nBody of {subject}\r\n"
    );
    fs::write(dir.join("new").join(name), raw).unwrap();
}

#[tokio::test]
async fn scan_review_cleanup_and_learn() {
    let mail = TempDir::new().unwrap();
    for sub in ["new", "cur", "tmp"] {
        fs::create_dir(mail.path().join(sub)).unwrap();
    }
    write_mail(mail.path(), "d1", "Deals <deals@shop.example>", "Weekend picks", 3);
    write_mail(mail.path(), "d2", "Deals <deals@shop.example>", "Fresh arrivals", 2);
    write_mail(mail.path(), "d3", "Deals <deals@shop.example>", "Picked for you", 1);
    write_mail(mail.path(), "m1", "team@corp.example", "Planning meeting", 0);
    write_mail(mail.path(), "p1", "Pal <pal@gmail.com>", "Lunch?", 0);

    let data = TempDir::new().unwrap();
    let store: Arc<dyn TriageStore> =
        Arc::new(LibSqlBackend::new_local(&data.path().join("triage.db")).await.unwrap());

    let config = TriageConfig::default();
    let classifier = Arc::new(SenderClassifier { calls: AtomicUsize::new(0) });
    let pipeline = Arc::new(DecisionPipeline::new(
        store.clone(),
        RuleMatcher::new(&config.rules).unwrap(),
        classifier.clone(),
        &config,
    ));
    let source: Arc<dyn MailSource> = Arc::new(MaildirSource::new(mail.path()));
    let scanner = Scanner::new(source.clone(), pipeline.clone());
    let review = Review::new(pipeline.clone(), source, 2);
    let options = ScanOptions::from(&config.scanner);

    // First scan: two rule matches, three classifier calls
    let report = scanner.scan(options).await.unwrap();
    assert_eq!(report.stats.processed, 5);
    assert_eq!(report.stats.rule_matches[&RuleKind::Event], 1);
    assert_eq!(report.stats.rule_matches[&RuleKind::PersonalContact], 1);
    assert_eq!(report.stats.model_classified, 3);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);

    // Nothing new on a second pass
    let report = scanner.scan(options).await.unwrap();
    assert_eq!(report.stats.processed, 0);

    // Reviewer agrees with all the deals deletions
    let decided = review
        .decide_pending_by_sender("deals@shop.example", true, ActionTaken::Deleted)
        .await
        .unwrap();
    assert_eq!(decided, 3);
    let accuracy = review.accuracy().await.unwrap();
    assert_eq!((accuracy.total, accuracy.agreed), (3, 3));

    let dry = review.delete_approved(true).await.unwrap();
    assert_eq!(dry.candidates, 3);
    assert!(mail.path().join("new/d1").exists());

    let cleanup = review.delete_approved(false).await.unwrap();
    assert_eq!(cleanup.deleted, 3);
    assert_eq!(cleanup.failed, 0);
    for name in ["d1", "d2", "d3"] {
        assert!(!mail.path().join("new").join(name).exists());
    }
    assert!(mail.path().join("new/m1").exists());

    // Three consistent decisions: the next deals message skips the classifier
    write_mail(mail.path(), "d4", "Deals <deals@shop.example>", "Last chance picks", 0);
    let report = scanner.scan(options).await.unwrap();
    assert_eq!(report.stats.processed, 1);
    assert_eq!(report.stats.pattern_bypasses, 1);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);

    let verdict = &report.verdicts[0];
    assert_eq!(verdict.source_tier, SourceTier::Pattern);
    assert_eq!(verdict.recommendation, Recommendation::Delete);
    assert_eq!(verdict.reasoning, "Pattern detected: you deleted 3/3 emails from this sender");
}
