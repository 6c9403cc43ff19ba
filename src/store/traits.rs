//! `TriageStore` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{
    ActionTaken, HumanDecision, LearnedRule, Message, RuleProposal, StoredMessage, Verdict,
};

/// Selects a group of messages for bulk review operations.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageFilter {
    All,
    Sender(String),
    /// Category of the current verdict.
    Category(String),
    /// `received_at` within `[from, to)`.
    ReceivedBetween {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Decision counts by action for one sender or domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionCounts {
    pub kept: usize,
    pub deleted: usize,
    pub archived: usize,
}

impl DecisionCounts {
    pub fn total(&self) -> usize {
        self.kept + self.deleted + self.archived
    }

    pub fn add(&mut self, action: ActionTaken) {
        match action {
            ActionTaken::Kept => self.kept += 1,
            ActionTaken::Deleted => self.deleted += 1,
            ActionTaken::Archived => self.archived += 1,
        }
    }
}

/// One reviewed model-tier verdict: the confidence it stated and whether
/// the reviewer agreed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    pub stated_confidence: f64,
    pub agreed: bool,
}

/// A past human decision shown to the classifier as context.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorDecision {
    pub sender: String,
    pub subject: String,
    pub category: String,
    pub action_taken: ActionTaken,
}

/// A decision joined with its message and verdict, for rule mining.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    pub sender: String,
    pub domain: String,
    pub category: String,
    pub action_taken: ActionTaken,
}

/// Aggregate agreement between verdicts and reviewers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionTotals {
    pub total: usize,
    pub agreed: usize,
}

/// Backend-agnostic persistence for messages, verdicts, decisions and rules.
#[async_trait]
pub trait TriageStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Register a message. Idempotent on `external_id`: an existing row is
    /// returned unchanged.
    async fn register_message(&self, message: &Message) -> Result<StoredMessage, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Look up a message by its mailbox identifier.
    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Messages not yet deleted that match the filter, oldest first.
    async fn find_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Record that a message was removed from the mailbox.
    async fn mark_deleted(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Verdicts ────────────────────────────────────────────────────

    /// Insert or replace the verdict for `verdict.message_id`. Replacing
    /// resets the review status to pending.
    async fn upsert_verdict(&self, verdict: &Verdict) -> Result<(), DatabaseError>;

    async fn get_verdict(&self, message_id: &str) -> Result<Option<Verdict>, DatabaseError>;

    /// Pending verdicts for the filtered messages.
    async fn pending_verdicts(&self, filter: &MessageFilter)
    -> Result<Vec<Verdict>, DatabaseError>;

    // ── Decisions ───────────────────────────────────────────────────

    /// Insert or replace a decision and set the verdict's review status to
    /// approved/rejected. `NotFound` if the message has no verdict.
    async fn record_decision(&self, decision: &HumanDecision) -> Result<(), DatabaseError>;

    async fn get_decision(&self, message_id: &str)
    -> Result<Option<HumanDecision>, DatabaseError>;

    /// Decision counts for an exact sender address.
    async fn sender_decision_counts(&self, sender: &str) -> Result<DecisionCounts, DatabaseError>;

    /// Decision counts across every sender of a domain.
    async fn domain_decision_counts(&self, domain: &str) -> Result<DecisionCounts, DatabaseError>;

    /// Model-tier verdicts reviewed since their last analysis.
    async fn calibration_samples(&self) -> Result<Vec<CalibrationSample>, DatabaseError>;

    /// Decisions on messages from `sender`, most recent first.
    async fn sender_examples(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<PriorDecision>, DatabaseError>;

    /// Decisions on `category` messages from anyone but `exclude_sender`,
    /// most recent first.
    async fn category_examples(
        &self,
        category: &str,
        exclude_sender: &str,
        limit: usize,
    ) -> Result<Vec<PriorDecision>, DatabaseError>;

    /// Every decision joined with its message and verdict.
    async fn decision_records(&self) -> Result<Vec<DecisionRecord>, DatabaseError>;

    async fn decision_totals(&self) -> Result<DecisionTotals, DatabaseError>;

    /// Messages whose current verdict says delete and was approved by the
    /// reviewer, and which are still in the mailbox. A decision left over
    /// from an earlier verdict does not count.
    async fn approved_deletions(&self) -> Result<Vec<StoredMessage>, DatabaseError>;

    // ── Learned rules ───────────────────────────────────────────────

    /// Persist a proposal as an inactive rule. Returns false if the same
    /// (pattern_type, pattern_value) already exists.
    async fn insert_rule(&self, proposal: &RuleProposal) -> Result<bool, DatabaseError>;

    async fn activate_rule(&self, id: &str) -> Result<LearnedRule, DatabaseError>;

    async fn list_rules(&self, active_only: bool) -> Result<Vec<LearnedRule>, DatabaseError>;
}
