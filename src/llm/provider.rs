//! `ClassificationService` trait and its request/response types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ClassifierError;
use crate::llm::prompt::age_descriptor;
use crate::pipeline::types::{Message, Priority, Recommendation};
use crate::store::PriorDecision;

/// Body characters sent to the classifier.
pub const MAX_BODY_CHARS: usize = 500;

/// Prior decisions sent with a request.
pub const MAX_EXAMPLES: usize = 3;

/// What the classifier sees of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRequest {
    pub sender: String,
    pub subject: String,
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    /// Human-readable age ("Today", "3 weeks old", ...).
    pub age: String,
    pub has_attachments: bool,
    pub examples: Vec<PriorDecision>,
}

impl ClassificationRequest {
    pub fn new(message: &Message, mut examples: Vec<PriorDecision>, now: DateTime<Utc>) -> Self {
        examples.truncate(MAX_EXAMPLES);
        Self {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            body_preview: message.body_preview.chars().take(MAX_BODY_CHARS).collect(),
            received_at: message.received_at,
            age: age_descriptor(message.age_days(now)),
            has_attachments: message.has_attachments,
            examples,
        }
    }
}

/// Validated classifier output. Confidence is the classifier's own number,
/// before calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub category: String,
    pub priority: Priority,
    pub reasoning: String,
}

/// An external service that labels a message.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    /// Model identifier recorded on verdicts.
    fn model_name(&self) -> &str;

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifierError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ActionTaken;
    use chrono::Duration;

    fn prior(n: usize) -> PriorDecision {
        PriorDecision {
            sender: format!("s{n}@x.com"),
            subject: "s".into(),
            category: "c".into(),
            action_taken: ActionTaken::Kept,
        }
    }

    #[test]
    fn request_truncates_body_and_examples() {
        let now = Utc::now();
        let msg = Message {
            external_id: "1".into(),
            sender: "a@b.com".into(),
            recipient: "me@x.com".into(),
            subject: "Hi".into(),
            body_preview: "é".repeat(800),
            received_at: now - Duration::days(10),
            size_bytes: 1,
            has_attachments: true,
        };
        let req = ClassificationRequest::new(&msg, (0..5).map(prior).collect(), now);
        assert_eq!(req.body_preview.chars().count(), MAX_BODY_CHARS);
        assert_eq!(req.examples.len(), MAX_EXAMPLES);
        assert_eq!(req.age, "1 week old");
        assert!(req.has_attachments);
    }
}
