//! Review operations: recording human decisions, bulk actions over groups
//! of messages, re-verdicting, accuracy and cleanup of approved deletions.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{error, info};

use crate::error::PipelineError;
use crate::pipeline::processor::DecisionPipeline;
use crate::pipeline::types::{ActionTaken, HumanDecision, RunReport};
use crate::source::MailSource;
use crate::store::{MessageFilter, TriageStore};

/// Agreement between verdicts and reviewers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accuracy {
    pub total: usize,
    pub agreed: usize,
    /// `agreed / total`, 0 when nothing has been reviewed.
    pub rate: f64,
}

/// Outcome of `delete_approved`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    pub dry_run: bool,
}

pub struct Review {
    store: Arc<dyn TriageStore>,
    pipeline: Arc<DecisionPipeline>,
    source: Arc<dyn MailSource>,
    rescan_concurrency: usize,
}

impl Review {
    pub fn new(
        pipeline: Arc<DecisionPipeline>,
        source: Arc<dyn MailSource>,
        rescan_concurrency: usize,
    ) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            pipeline,
            source,
            rescan_concurrency,
        }
    }

    /// Record (or replace) the decision on one message.
    pub async fn record_decision(
        &self,
        message_id: &str,
        agreed: bool,
        action_taken: ActionTaken,
        notes: Option<String>,
    ) -> Result<(), PipelineError> {
        self.store
            .record_decision(&HumanDecision {
                message_id: message_id.to_string(),
                agreed_with_verdict: agreed,
                action_taken,
                notes,
                decided_at: Utc::now().trunc_subsecs(6),
            })
            .await?;
        info!(id = message_id, agreed, action = %action_taken, "Decision recorded");
        Ok(())
    }

    async fn decide_pending(
        &self,
        filter: MessageFilter,
        agreed: bool,
        action_taken: ActionTaken,
    ) -> Result<usize, PipelineError> {
        let pending = self.store.pending_verdicts(&filter).await?;
        let decided_at = Utc::now().trunc_subsecs(6);
        for verdict in &pending {
            self.store
                .record_decision(&HumanDecision {
                    message_id: verdict.message_id.clone(),
                    agreed_with_verdict: agreed,
                    action_taken,
                    notes: None,
                    decided_at,
                })
                .await?;
        }
        info!(?filter, count = pending.len(), action = %action_taken, "Bulk decision applied");
        Ok(pending.len())
    }

    pub async fn decide_pending_by_sender(
        &self,
        sender: &str,
        agreed: bool,
        action_taken: ActionTaken,
    ) -> Result<usize, PipelineError> {
        self.decide_pending(MessageFilter::Sender(sender.to_string()), agreed, action_taken)
            .await
    }

    pub async fn decide_pending_by_category(
        &self,
        category: &str,
        agreed: bool,
        action_taken: ActionTaken,
    ) -> Result<usize, PipelineError> {
        self.decide_pending(MessageFilter::Category(category.to_string()), agreed, action_taken)
            .await
    }

    pub async fn decide_pending_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agreed: bool,
        action_taken: ActionTaken,
    ) -> Result<usize, PipelineError> {
        self.decide_pending(MessageFilter::ReceivedBetween { from, to }, agreed, action_taken)
            .await
    }

    async fn reverdict(&self, filter: MessageFilter) -> Result<RunReport, PipelineError> {
        let messages = self.store.find_messages(&filter).await?;
        info!(?filter, count = messages.len(), "Re-verdicting messages");
        self.pipeline.rescan(messages, self.rescan_concurrency).await
    }

    pub async fn reverdict_by_sender(&self, sender: &str) -> Result<RunReport, PipelineError> {
        self.reverdict(MessageFilter::Sender(sender.to_string())).await
    }

    pub async fn reverdict_by_category(&self, category: &str) -> Result<RunReport, PipelineError> {
        self.reverdict(MessageFilter::Category(category.to_string())).await
    }

    pub async fn reverdict_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        self.reverdict(MessageFilter::ReceivedBetween { from, to }).await
    }

    /// Re-verdict every message still in the mailbox.
    pub async fn reverdict_all(&self) -> Result<RunReport, PipelineError> {
        self.reverdict(MessageFilter::All).await
    }

    pub async fn accuracy(&self) -> Result<Accuracy, PipelineError> {
        let totals = self.store.decision_totals().await?;
        let rate = if totals.total == 0 {
            0.0
        } else {
            totals.agreed as f64 / totals.total as f64
        };
        Ok(Accuracy {
            total: totals.total,
            agreed: totals.agreed,
            rate,
        })
    }

    /// Delete messages whose delete verdict a reviewer agreed with.
    ///
    /// Per-message source failures are logged and counted.
    pub async fn delete_approved(&self, dry_run: bool) -> Result<CleanupReport, PipelineError> {
        let candidates = self.store.approved_deletions().await?;
        let mut report = CleanupReport {
            candidates: candidates.len(),
            dry_run,
            ..CleanupReport::default()
        };

        for stored in &candidates {
            if dry_run {
                info!(
                    id = %stored.id,
                    sender = %stored.message.sender,
                    subject = %stored.message.subject,
                    "Would delete"
                );
                continue;
            }

            match self.source.delete_message(&stored.message.external_id).await {
                Ok(found) => {
                    if !found {
                        info!(id = %stored.id, "Message already gone from mailbox");
                    }
                    self.store.mark_deleted(&stored.id, Utc::now()).await?;
                    report.deleted += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(id = %stored.id, error = %e, "Failed to delete message");
                }
            }
        }

        info!(
            candidates = report.candidates,
            deleted = report.deleted,
            failed = report.failed,
            dry_run,
            "Cleanup complete"
        );
        Ok(report)
    }
}
