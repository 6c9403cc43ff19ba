//! Few-shot example selection from past human decisions.

use std::sync::Arc;

use crate::error::DatabaseError;
use crate::store::{PriorDecision, TriageStore};

/// Examples attached to each classifier request.
pub const EXAMPLE_LIMIT: usize = 3;

#[derive(Clone)]
pub struct ExampleSelector {
    store: Arc<dyn TriageStore>,
}

impl ExampleSelector {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self { store }
    }

    /// Same-sender decisions first, newest first; then same-category
    /// decisions from other senders, newest first.
    pub async fn select_examples(
        &self,
        sender: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<PriorDecision>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut examples = self.store.sender_examples(sender, limit).await?;
        let remaining = limit.saturating_sub(examples.len());
        if remaining > 0 {
            let backfill = self
                .store
                .category_examples(category, sender, remaining)
                .await?;
            examples.extend(backfill);
        }
        Ok(examples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{memory_store, seed_decision};
    use crate::pipeline::types::ActionTaken;

    #[tokio::test]
    async fn sender_first_then_category_backfill() {
        let store = memory_store().await;
        seed_decision(&store, "o1", "other@news.com", "newsletter", ActionTaken::Deleted).await;
        seed_decision(&store, "s1", "me@news.com", "newsletter", ActionTaken::Kept).await;
        seed_decision(&store, "u1", "third@x.com", "job", ActionTaken::Deleted).await;

        let selector = ExampleSelector::new(store);
        let examples = selector
            .select_examples("me@news.com", "newsletter", 3)
            .await
            .unwrap();

        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].sender, "me@news.com");
        assert_eq!(examples[0].action_taken, ActionTaken::Kept);
        assert_eq!(examples[1].sender, "other@news.com");
    }

    #[tokio::test]
    async fn limit_caps_sender_examples() {
        let store = memory_store().await;
        for i in 0..5 {
            seed_decision(&store, &format!("s{i}"), "me@x.com", "personal", ActionTaken::Kept).await;
        }
        seed_decision(&store, "o1", "you@x.com", "personal", ActionTaken::Kept).await;

        let selector = ExampleSelector::new(store);
        let examples = selector.select_examples("me@x.com", "personal", 3).await.unwrap();
        assert_eq!(examples.len(), 3);
        assert!(examples.iter().all(|e| e.sender == "me@x.com"));
    }

    #[tokio::test]
    async fn unknown_sender_and_category_yields_nothing() {
        let store = memory_store().await;
        let selector = ExampleSelector::new(store);
        assert!(selector.select_examples("new@x.com", "unknown", 3).await.unwrap().is_empty());
    }
}
