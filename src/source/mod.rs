//! Mail sources: where messages come from and where deletions go.

pub mod maildir;

pub use maildir::MaildirSource;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::pipeline::types::Message;

/// A mailbox the scanner reads from.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Fetch up to `limit` messages ordered by received time.
    async fn fetch_messages(
        &self,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<Message>, SourceError>;

    /// Remove a message. Returns `false` if it was already gone.
    async fn delete_message(&self, external_id: &str) -> Result<bool, SourceError>;
}
