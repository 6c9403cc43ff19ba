//! Fixtures shared by the pipeline tests.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::pipeline::types::{
    ActionTaken, HumanDecision, Message, Priority, Recommendation, ReviewStatus, SourceTier,
    StoredMessage, Verdict,
};
use crate::store::{LibSqlBackend, TriageStore};

pub async fn memory_store() -> Arc<dyn TriageStore> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub fn message(external_id: &str, sender: &str, subject: &str, age_days: i64) -> Message {
    Message {
        external_id: external_id.into(),
        sender: sender.into(),
        recipient: "me@home.net".into(),
        subject: subject.into(),
        body_preview: String::new(),
        received_at: Utc::now() - Duration::days(age_days) - Duration::minutes(5),
        size_bytes: 512,
        has_attachments: false,
    }
}

pub fn verdict(message_id: &str, tier: SourceTier, category: &str, confidence: f64) -> Verdict {
    Verdict {
        message_id: message_id.into(),
        recommendation: Recommendation::Delete,
        confidence,
        stated_confidence: (tier == SourceTier::Model).then_some(confidence),
        category: category.into(),
        priority: Priority::Medium,
        reasoning: "seeded".into(),
        source_tier: tier,
        model_name: "seed".into(),
        rule: None,
        analyzed_at: Utc::now(),
        review_status: ReviewStatus::Pending,
    }
}

/// Register a message with a model-tier verdict and record a decision on it.
pub async fn seed_decision(
    store: &Arc<dyn TriageStore>,
    external_id: &str,
    sender: &str,
    category: &str,
    action: ActionTaken,
) -> StoredMessage {
    let stored = store
        .register_message(&message(external_id, sender, &format!("About {external_id}"), 1))
        .await
        .unwrap();
    store
        .upsert_verdict(&verdict(&stored.id, SourceTier::Model, category, 0.8))
        .await
        .unwrap();
    store
        .record_decision(&HumanDecision {
            message_id: stored.id.clone(),
            agreed_with_verdict: action == ActionTaken::Deleted,
            action_taken: action,
            notes: None,
            decided_at: Utc::now(),
        })
        .await
        .unwrap();
    stored
}
