//! Pattern mining over human decisions.
//!
//! Proposes durable rules where reviewers have been consistent. Mining is
//! read-only; persisting proposals and activating them are separate steps.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::DatabaseError;
use crate::pipeline::types::{ActionTaken, LearnedRule, PatternType, Recommendation, RuleProposal};
use crate::store::{DecisionCounts, DecisionRecord, TriageStore};

/// Minimum decisions and consistency per grouping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiningThresholds {
    pub sender_min: usize,
    pub sender_rate: f64,
    pub domain_min: usize,
    pub domain_rate: f64,
    pub category_min: usize,
    pub category_rate: f64,
}

impl Default for MiningThresholds {
    fn default() -> Self {
        Self {
            sender_min: 10,
            sender_rate: 0.9,
            domain_min: 8,
            domain_rate: 0.9,
            category_min: 15,
            category_rate: 0.85,
        }
    }
}

impl RuleProposal {
    /// One-line, human-readable description of the proposed rule.
    pub fn suggestion(&self) -> String {
        let pct = self.consistency_rate * 100.0;
        match self.pattern_type {
            PatternType::VipSender => format!(
                "Add '{}' to VIP senders list ({} decisions, {pct:.0}% kept)",
                self.pattern_value, self.support
            ),
            PatternType::SenderAutoDelete => format!(
                "Auto-delete emails from '{}' ({} decisions, {pct:.0}% deleted)",
                self.pattern_value, self.support
            ),
            PatternType::DomainAutoDelete => format!(
                "Auto-delete all emails from domain '@{}' ({} decisions, {pct:.0}% deleted)",
                self.pattern_value, self.support
            ),
            PatternType::CategoryAutoDelete => format!(
                "Auto-delete category '{}' emails ({} decisions, {pct:.0}% deleted)",
                self.pattern_value, self.support
            ),
        }
    }
}

fn group_by<F>(records: &[DecisionRecord], key: F) -> BTreeMap<String, DecisionCounts>
where
    F: Fn(&DecisionRecord) -> &str,
{
    let mut groups: BTreeMap<String, DecisionCounts> = BTreeMap::new();
    for record in records {
        groups
            .entry(key(record).to_string())
            .or_default()
            .add(record.action_taken);
    }
    groups
}

fn rate(counts: &DecisionCounts, action: ActionTaken) -> f64 {
    let n = match action {
        ActionTaken::Kept => counts.kept,
        ActionTaken::Deleted => counts.deleted,
        ActionTaken::Archived => counts.archived,
    };
    n as f64 / counts.total() as f64
}

/// Proposals from a set of decision records.
pub fn mine(records: &[DecisionRecord], t: &MiningThresholds) -> Vec<RuleProposal> {
    let mut proposals = Vec::new();

    for (sender, counts) in group_by(records, |r| &r.sender) {
        if counts.total() < t.sender_min {
            continue;
        }
        let keep = rate(&counts, ActionTaken::Kept);
        let delete = rate(&counts, ActionTaken::Deleted);
        let (pattern_type, action, consistency_rate) = if keep >= t.sender_rate {
            (PatternType::VipSender, Recommendation::Keep, keep)
        } else if delete >= t.sender_rate {
            (PatternType::SenderAutoDelete, Recommendation::Delete, delete)
        } else {
            continue;
        };
        proposals.push(RuleProposal {
            pattern_type,
            pattern_value: sender,
            action,
            consistency_rate,
            support: counts.total(),
        });
    }

    // Domains only ever yield delete proposals
    for (domain, counts) in group_by(records, |r| &r.domain) {
        if domain.is_empty() || counts.total() < t.domain_min {
            continue;
        }
        let delete = rate(&counts, ActionTaken::Deleted);
        if delete >= t.domain_rate {
            proposals.push(RuleProposal {
                pattern_type: PatternType::DomainAutoDelete,
                pattern_value: domain,
                action: Recommendation::Delete,
                consistency_rate: delete,
                support: counts.total(),
            });
        }
    }

    for (category, counts) in group_by(records, |r| &r.category) {
        if counts.total() < t.category_min {
            continue;
        }
        let delete = rate(&counts, ActionTaken::Deleted);
        if delete >= t.category_rate {
            proposals.push(RuleProposal {
                pattern_type: PatternType::CategoryAutoDelete,
                pattern_value: category,
                action: Recommendation::Delete,
                consistency_rate: delete,
                support: counts.total(),
            });
        }
    }

    proposals
}

pub struct PatternMiner {
    store: Arc<dyn TriageStore>,
    thresholds: MiningThresholds,
}

impl PatternMiner {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self {
            store,
            thresholds: MiningThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: MiningThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn propose(&self) -> Result<Vec<RuleProposal>, DatabaseError> {
        let records = self.store.decision_records().await?;
        let proposals = mine(&records, &self.thresholds);
        info!(
            decisions = records.len(),
            proposals = proposals.len(),
            "Pattern mining complete"
        );
        Ok(proposals)
    }

    /// Persist proposals as inactive rules awaiting review. Returns how many
    /// were new.
    pub async fn save_proposals(&self, proposals: &[RuleProposal]) -> Result<usize, DatabaseError> {
        let mut inserted = 0;
        for proposal in proposals {
            if self.store.insert_rule(proposal).await? {
                inserted += 1;
            }
        }
        info!(inserted, total = proposals.len(), "Saved rule proposals");
        Ok(inserted)
    }

    /// Human confirmation of a saved rule.
    pub async fn activate_rule(&self, id: &str) -> Result<LearnedRule, DatabaseError> {
        let rule = self.store.activate_rule(id).await?;
        info!(id, rule = %rule.proposal.suggestion(), "Rule activated");
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{memory_store, seed_decision};

    fn records(sender: &str, domain: &str, category: &str, kept: usize, deleted: usize) -> Vec<DecisionRecord> {
        let record = |action| DecisionRecord {
            sender: sender.into(),
            domain: domain.into(),
            category: category.into(),
            action_taken: action,
        };
        let mut out = vec![record(ActionTaken::Kept); kept];
        out.extend(vec![record(ActionTaken::Deleted); deleted]);
        out
    }

    fn of_type(proposals: &[RuleProposal], t: PatternType) -> Vec<&RuleProposal> {
        proposals.iter().filter(|p| p.pattern_type == t).collect()
    }

    #[test]
    fn consistently_kept_domain_yields_no_domain_rule() {
        let proposals = mine(&records("a@friends.org", "friends.org", "personal", 20, 0), &MiningThresholds::default());
        assert!(of_type(&proposals, PatternType::DomainAutoDelete).is_empty());
        assert!(proposals.iter().all(|p| p.pattern_type == PatternType::VipSender));
    }

    #[test]
    fn sender_thresholds() {
        let t = MiningThresholds::default();
        assert!(mine(&records("a@x.com", "", "c", 9, 0), &t).is_empty());

        let proposals = mine(&records("a@x.com", "", "c", 10, 0), &t);
        let vip = of_type(&proposals, PatternType::VipSender);
        assert_eq!(vip.len(), 1);
        assert_eq!(vip[0].action, Recommendation::Keep);
        assert_eq!(vip[0].support, 10);

        let proposals = mine(&records("b@x.com", "", "c", 1, 9), &t);
        let del = of_type(&proposals, PatternType::SenderAutoDelete);
        assert_eq!(del.len(), 1);
        assert!((del[0].consistency_rate - 0.9).abs() < 1e-9);

        let proposals = mine(&records("c@x.com", "", "c", 2, 8), &t);
        assert!(of_type(&proposals, PatternType::SenderAutoDelete).is_empty());
    }

    #[test]
    fn domain_and_category_delete_rules() {
        let mut recs = records("a@spam.biz", "spam.biz", "promo", 0, 5);
        recs.extend(records("b@spam.biz", "spam.biz", "promo", 0, 4));
        recs.extend(records("c@ok.com", "ok.com", "promo", 2, 4));
        let proposals = mine(&recs, &MiningThresholds::default());

        let domains = of_type(&proposals, PatternType::DomainAutoDelete);
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].pattern_value, "spam.biz");
        assert_eq!(domains[0].support, 9);

        // 13/15 deleted ≈ 0.867
        let categories = of_type(&proposals, PatternType::CategoryAutoDelete);
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].pattern_value, "promo");
    }

    #[test]
    fn suggestions_are_readable() {
        let proposal = RuleProposal {
            pattern_type: PatternType::DomainAutoDelete,
            pattern_value: "spam.biz".into(),
            action: Recommendation::Delete,
            consistency_rate: 0.95,
            support: 20,
        };
        assert_eq!(
            proposal.suggestion(),
            "Auto-delete all emails from domain '@spam.biz' (20 decisions, 95% deleted)"
        );
    }

    #[tokio::test]
    async fn propose_save_and_activate() {
        let store = memory_store().await;
        for i in 0..10 {
            seed_decision(&store, &format!("k{i}"), "mom@family.net", "personal", ActionTaken::Kept).await;
        }

        let miner = PatternMiner::new(store.clone());
        let proposals = miner.propose().await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].pattern_type, PatternType::VipSender);
        assert_eq!(proposals[0].pattern_value, "mom@family.net");

        assert_eq!(miner.save_proposals(&proposals).await.unwrap(), 1);
        assert_eq!(miner.save_proposals(&proposals).await.unwrap(), 0);

        let saved = store.list_rules(false).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert!(!saved[0].is_active);
        assert!(saved[0].requires_review);
        assert!(store.list_rules(true).await.unwrap().is_empty());

        let active = miner.activate_rule(&saved[0].id).await.unwrap();
        assert!(active.is_active);
        assert_eq!(store.list_rules(true).await.unwrap().len(), 1);
    }
}
