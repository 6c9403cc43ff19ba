//! Shared types for the decision pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

// ── Messages ────────────────────────────────────────────────────────

/// A message as supplied by the mail source. Read-only for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Stable mailbox identifier.
    pub external_id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    /// First part of the body (the source decides how much).
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub has_attachments: bool,
}

impl Message {
    /// Whole days between `received_at` and `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.received_at).num_days()
    }

    /// Lower-cased domain of the sender address, if any.
    pub fn sender_domain(&self) -> Option<String> {
        sender_domain(&self.sender)
    }
}

/// Extract the lower-cased domain (portion after `@`) from an address,
/// tolerating `Name <user@host>` forms.
pub fn sender_domain(address: &str) -> Option<String> {
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').trim().to_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// A message registered in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Internal id; verdicts and decisions are keyed by it.
    pub id: String,
    pub message: Message,
    pub fetched_at: DateTime<Utc>,
    /// When the message was removed from the mailbox.
    pub deleted_at: Option<DateTime<Utc>>,
}

// ── Enumerations ────────────────────────────────────────────────────

/// Error for parsing one of the model's string enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

/// What the system recommends doing with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    Delete,
    Archive,
}

string_enum!(Recommendation, "recommendation", {
    Keep => "keep",
    Delete => "delete",
    Archive => "archive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

string_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Which pipeline stage produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Rule,
    Pattern,
    Model,
}

string_enum!(SourceTier, "source tier", {
    Rule => "rule",
    Pattern => "pattern",
    Model => "model",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(ReviewStatus, "review status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// What the human reviewer actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Kept,
    Deleted,
    Archived,
}

string_enum!(ActionTaken, "action", {
    Kept => "kept",
    Deleted => "deleted",
    Archived => "archived",
});

impl ActionTaken {
    /// The recommendation this action corresponds to.
    pub fn as_recommendation(&self) -> Recommendation {
        match self {
            Self::Kept => Recommendation::Keep,
            Self::Deleted => Recommendation::Delete,
            Self::Archived => Recommendation::Archive,
        }
    }
}

/// Built-in rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    OldEvent,
    VipSender,
    Event,
    PersonalContact,
    OldJobOffer,
    OldNewsletter,
    OldPromotional,
}

string_enum!(RuleKind, "rule", {
    OldEvent => "old_event",
    VipSender => "vip_sender",
    Event => "event",
    PersonalContact => "personal_contact",
    OldJobOffer => "old_job_offer",
    OldNewsletter => "old_newsletter",
    OldPromotional => "old_promotional",
});

// ── Assessment / Verdict ────────────────────────────────────────────

/// What a single tier concluded about a message, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub recommendation: Recommendation,
    pub confidence: f64,
    /// The classifier's own confidence before calibration (model tier only).
    pub stated_confidence: Option<f64>,
    pub category: String,
    pub priority: Priority,
    pub reasoning: String,
    pub source_tier: SourceTier,
    pub model_name: String,
    /// Rule that matched (rule tier only).
    pub rule: Option<RuleKind>,
}

/// The live recommendation for a message. At most one per message.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub message_id: String,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub stated_confidence: Option<f64>,
    pub category: String,
    pub priority: Priority,
    pub reasoning: String,
    pub source_tier: SourceTier,
    pub model_name: String,
    pub rule: Option<RuleKind>,
    pub analyzed_at: DateTime<Utc>,
    pub review_status: ReviewStatus,
}

impl Verdict {
    /// A fresh verdict awaiting review. `analyzed_at` is kept to the
    /// microsecond, the precision the store writes.
    pub fn from_assessment(
        message_id: impl Into<String>,
        assessment: Assessment,
        analyzed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            recommendation: assessment.recommendation,
            confidence: assessment.confidence.clamp(0.0, 1.0),
            stated_confidence: assessment.stated_confidence,
            category: assessment.category,
            priority: assessment.priority,
            reasoning: assessment.reasoning,
            source_tier: assessment.source_tier,
            model_name: assessment.model_name,
            rule: assessment.rule,
            analyzed_at: analyzed_at.trunc_subsecs(6),
            review_status: ReviewStatus::Pending,
        }
    }
}

/// Ground-truth reviewer action on a message. At most one per message.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanDecision {
    pub message_id: String,
    pub agreed_with_verdict: bool,
    pub action_taken: ActionTaken,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// ── Learned rules ───────────────────────────────────────────────────

/// Kind of durable rule mined from human decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    VipSender,
    SenderAutoDelete,
    DomainAutoDelete,
    CategoryAutoDelete,
}

string_enum!(PatternType, "pattern type", {
    VipSender => "vip_sender",
    SenderAutoDelete => "sender_auto_delete",
    DomainAutoDelete => "domain_auto_delete",
    CategoryAutoDelete => "category_auto_delete",
});

/// A candidate rule, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleProposal {
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub action: Recommendation,
    /// Share of decisions agreeing with `action`.
    pub consistency_rate: f64,
    /// Number of decisions behind the proposal.
    pub support: usize,
}

/// A persisted rule. Inactive until a human activates it.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnedRule {
    pub id: String,
    pub proposal: RuleProposal,
    pub times_matched: i64,
    pub is_active: bool,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
}

// ── Per-run statistics ──────────────────────────────────────────────

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub rule_matches: BTreeMap<RuleKind, usize>,
    pub pattern_bypasses: usize,
    pub model_classified: usize,
    pub model_failures: usize,
    pub calibrations_applied: usize,
    pub processed: usize,
    pub failed: usize,
}

impl RunStats {
    /// Count an assessment under the tier that produced it.
    pub fn record(&mut self, assessment: &Assessment) {
        match assessment.source_tier {
            SourceTier::Rule => {
                if let Some(rule) = assessment.rule {
                    *self.rule_matches.entry(rule).or_default() += 1;
                }
            }
            SourceTier::Pattern => self.pattern_bypasses += 1,
            SourceTier::Model => self.model_classified += 1,
        }
    }

    pub fn rule_match_total(&self) -> usize {
        self.rule_matches.values().sum()
    }

    /// Fold another run's counters into this one.
    pub fn merge(&mut self, other: &RunStats) {
        for (rule, count) in &other.rule_matches {
            *self.rule_matches.entry(*rule).or_default() += count;
        }
        self.pattern_bypasses += other.pattern_bypasses;
        self.model_classified += other.model_classified;
        self.model_failures += other.model_failures;
        self.calibrations_applied += other.calibrations_applied;
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// Outcome of a batch: the verdicts written and the run counters.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub verdicts: Vec<Verdict>,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(tier: SourceTier, rule: Option<RuleKind>) -> Assessment {
        Assessment {
            recommendation: Recommendation::Keep,
            confidence: 0.9,
            stated_confidence: None,
            category: "personal".into(),
            priority: Priority::Medium,
            reasoning: "x".into(),
            source_tier: tier,
            model_name: "test".into(),
            rule,
        }
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("DELETE".parse::<Recommendation>().unwrap(), Recommendation::Delete);
        assert_eq!(" archived ".parse::<ActionTaken>().unwrap(), ActionTaken::Archived);
        assert!("maybe".parse::<Recommendation>().is_err());
    }

    #[test]
    fn sender_domain_handles_display_names() {
        assert_eq!(sender_domain("Bob <bob@Example.COM>").as_deref(), Some("example.com"));
        assert_eq!(sender_domain("alice@mail.io").as_deref(), Some("mail.io"));
        assert_eq!(sender_domain("no-at-sign"), None);
        assert_eq!(sender_domain("trailing@"), None);
    }

    #[test]
    fn age_counts_whole_days() {
        let now = Utc::now();
        let msg = Message {
            external_id: "1".into(),
            sender: "a@b.com".into(),
            recipient: "me@x.com".into(),
            subject: "hi".into(),
            body_preview: String::new(),
            received_at: now - chrono::Duration::hours(47),
            size_bytes: 10,
            has_attachments: false,
        };
        assert_eq!(msg.age_days(now), 1);
    }

    #[test]
    fn verdict_from_assessment_starts_pending_and_clamps() {
        let mut a = assessment(SourceTier::Model, None);
        a.confidence = 1.4;
        let verdict = Verdict::from_assessment("m1", a, Utc::now());
        assert_eq!(verdict.review_status, ReviewStatus::Pending);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn verdict_timestamp_keeps_microseconds_only() {
        let at = DateTime::parse_from_rfc3339("2025-01-02T03:04:05.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let verdict = Verdict::from_assessment("m1", assessment(SourceTier::Model, None), at);
        assert_eq!(verdict.analyzed_at.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn run_stats_record_and_merge() {
        let mut stats = RunStats::default();
        stats.record(&assessment(SourceTier::Rule, Some(RuleKind::VipSender)));
        stats.record(&assessment(SourceTier::Rule, Some(RuleKind::VipSender)));
        stats.record(&assessment(SourceTier::Pattern, None));

        let mut other = RunStats::default();
        other.record(&assessment(SourceTier::Model, None));
        other.model_failures = 1;

        stats.merge(&other);
        assert_eq!(stats.rule_matches[&RuleKind::VipSender], 2);
        assert_eq!(stats.rule_match_total(), 2);
        assert_eq!(stats.pattern_bypasses, 1);
        assert_eq!(stats.model_classified, 1);
        assert_eq!(stats.model_failures, 1);
    }
}
