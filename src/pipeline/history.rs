//! Sender history tier.
//!
//! Aggregates past human decisions per sender (and per domain) and detects
//! a dominant pattern strong enough to skip the classifier.

use std::sync::Arc;

use tracing::info;

use crate::error::DatabaseError;
use crate::pipeline::types::{Assessment, Priority, Recommendation, SourceTier, sender_domain};
use crate::store::{DecisionCounts, TriageStore};

/// Model name recorded on pattern-tier verdicts.
pub const PATTERN_MODEL_NAME: &str = "pattern_memory";

/// Decisions needed before a pattern can hold.
pub const MIN_DECISIONS: usize = 3;

/// Share of one action needed for a pattern.
pub const PATTERN_THRESHOLD: f64 = 0.9;

/// Aggregate of human decisions for a sender or a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SenderProfile {
    pub total: usize,
    pub kept: usize,
    pub deleted: usize,
    pub archived: usize,
    pub keep_rate: f64,
    pub delete_rate: f64,
}

impl From<DecisionCounts> for SenderProfile {
    fn from(counts: DecisionCounts) -> Self {
        let total = counts.total();
        let rate = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        Self {
            total,
            kept: counts.kept,
            deleted: counts.deleted,
            archived: counts.archived,
            keep_rate: rate(counts.kept),
            delete_rate: rate(counts.deleted),
        }
    }
}

impl SenderProfile {
    /// Whether the history is consistent enough to act on.
    pub fn has_pattern(&self) -> bool {
        self.total >= MIN_DECISIONS
            && (self.keep_rate >= PATTERN_THRESHOLD || self.delete_rate >= PATTERN_THRESHOLD)
    }

    /// The assessment implied by this history, if a pattern holds. Keep is
    /// checked before delete.
    pub fn bypass_assessment(&self) -> Option<Assessment> {
        if self.total < MIN_DECISIONS {
            return None;
        }

        let (recommendation, confidence, priority, verb, count) =
            if self.keep_rate >= PATTERN_THRESHOLD {
                (Recommendation::Keep, self.keep_rate, Priority::Medium, "kept", self.kept)
            } else if self.delete_rate >= PATTERN_THRESHOLD {
                (Recommendation::Delete, self.delete_rate, Priority::Low, "deleted", self.deleted)
            } else {
                return None;
            };

        Some(Assessment {
            recommendation,
            confidence,
            stated_confidence: None,
            category: "pattern_learned".to_string(),
            priority,
            reasoning: format!(
                "Pattern detected: you {verb} {count}/{} emails from this sender",
                self.total
            ),
            source_tier: SourceTier::Pattern,
            model_name: PATTERN_MODEL_NAME.to_string(),
            rule: None,
        })
    }
}

/// Reads sender and domain profiles from the store.
#[derive(Clone)]
pub struct SenderHistory {
    store: Arc<dyn TriageStore>,
}

impl SenderHistory {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self { store }
    }

    pub async fn sender_profile(&self, sender: &str) -> Result<SenderProfile, DatabaseError> {
        Ok(self.store.sender_decision_counts(sender).await?.into())
    }

    /// Profile of every sender sharing the address's domain. `None` when the
    /// address has no domain part.
    pub async fn domain_profile(
        &self,
        address: &str,
    ) -> Result<Option<SenderProfile>, DatabaseError> {
        let Some(domain) = sender_domain(address) else {
            return Ok(None);
        };
        Ok(Some(self.store.domain_decision_counts(&domain).await?.into()))
    }

    /// Pattern-tier assessment for the sender, if their history is
    /// consistent enough.
    pub async fn should_bypass_classifier(
        &self,
        sender: &str,
    ) -> Result<Option<Assessment>, DatabaseError> {
        let profile = self.sender_profile(sender).await?;
        let assessment = profile.bypass_assessment();
        if let Some(ref a) = assessment {
            info!(
                sender = %sender,
                recommendation = %a.recommendation,
                confidence = a.confidence,
                total = profile.total,
                "Sender pattern bypasses classifier"
            );
        }
        Ok(assessment)
    }
}
