//! Maildir mail source.
//!
//! Reads `new/` and `cur/` under the root (or the root itself when neither
//! exists) and parses each file with `mail-parser`. The external id is the
//! file name up to the `:` flag separator, so flag changes don't re-register
//! a message.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::llm::MAX_BODY_CHARS;
use crate::pipeline::types::Message;
use crate::source::MailSource;

const SOURCE_NAME: &str = "maildir";

pub struct MaildirSource {
    root: PathBuf,
}

impl MaildirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(reason: impl std::fmt::Display) -> SourceError {
        SourceError::Io {
            name: SOURCE_NAME.into(),
            reason: reason.to_string(),
        }
    }
}

/// File name up to the first `:`.
pub fn external_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.split(':').next().unwrap_or(name);
    (!id.is_empty()).then(|| id.to_string())
}

fn mail_dirs(root: &Path) -> Vec<PathBuf> {
    let sub: Vec<PathBuf> = ["new", "cur"]
        .iter()
        .map(|d| root.join(d))
        .filter(|p| p.is_dir())
        .collect();
    if sub.is_empty() {
        vec![root.to_path_buf()]
    } else {
        sub
    }
}

fn mail_files(root: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let mut files = Vec::new();
    for dir in mail_dirs(root) {
        let entries = fs::read_dir(&dir)
            .map_err(|e| MaildirSource::io_error(format!("{}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(MaildirSource::io_error)?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.'));
            if path.is_file() && !hidden {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Parse one Maildir file into a `Message`.
pub fn parse_file(path: &Path) -> Result<Message, SourceError> {
    let id = external_id(path).ok_or_else(|| SourceError::Parse {
        id: path.display().to_string(),
        reason: "file name is not valid UTF-8".into(),
    })?;
    let raw = fs::read(path).map_err(|e| MaildirSource::io_error(format!("{}: {e}", path.display())))?;
    let parsed = MessageParser::default()
        .parse(&raw)
        .ok_or_else(|| SourceError::Parse {
            id: id.clone(),
            reason: "not an RFC 5322 message".into(),
        })?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let recipient = parsed
        .to()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .or_else(|| modified_at(path))
        .unwrap_or_else(Utc::now);
    let body_preview: String = parsed
        .body_text(0)
        .map(|t| t.trim().chars().take(MAX_BODY_CHARS).collect())
        .unwrap_or_default();

    Ok(Message {
        external_id: id,
        sender,
        recipient,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body_preview,
        received_at,
        size_bytes: i64::try_from(raw.len()).unwrap_or(i64::MAX),
        has_attachments: parsed.attachments().next().is_some(),
    })
}

fn read_messages(root: &Path, limit: usize, newest_first: bool) -> Result<Vec<Message>, SourceError> {
    let mut messages = Vec::new();
    for path in mail_files(root)? {
        match parse_file(&path) {
            Ok(m) => messages.push(m),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable message"),
        }
    }

    messages.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
    if newest_first {
        messages.reverse();
    }
    if limit > 0 {
        messages.truncate(limit);
    }
    Ok(messages)
}

fn remove_message(root: &Path, external_id_wanted: &str) -> Result<bool, SourceError> {
    for path in mail_files(root)? {
        if external_id(&path).as_deref() == Some(external_id_wanted) {
            fs::remove_file(&path)
                .map_err(|e| MaildirSource::io_error(format!("{}: {e}", path.display())))?;
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl MailSource for MaildirSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    /// `limit == 0` means no limit.
    async fn fetch_messages(
        &self,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<Message>, SourceError> {
        let root = self.root.clone();
        let messages = tokio::task::spawn_blocking(move || read_messages(&root, limit, newest_first))
            .await
            .map_err(Self::io_error)??;
        info!(root = %self.root.display(), count = messages.len(), "Fetched messages from maildir");
        Ok(messages)
    }

    async fn delete_message(&self, external_id: &str) -> Result<bool, SourceError> {
        let root = self.root.clone();
        let wanted = external_id.to_string();
        let removed = tokio::task::spawn_blocking(move || remove_message(&root, &wanted))
            .await
            .map_err(Self::io_error)??;
        debug!(external_id, removed, "Maildir delete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw(from: &str, subject: &str, date: &str, body: &str) -> String {
        format!(
            "From: {from}\r\nTo: Me <me@home.net>\r\nSubject: {subject}\r\nDate: {date}\r\nMessage-ID: <{subject}@x>\r\n\r\n{body}\r\n"
        )
    }

    fn maildir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for sub in ["new", "cur", "tmp"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        dir
    }

    #[test]
    fn external_id_strips_flags() {
        assert_eq!(external_id(Path::new("/m/cur/1700.abc.host:2,S")).as_deref(), Some("1700.abc.host"));
        assert_eq!(external_id(Path::new("/m/new/1700.def.host")).as_deref(), Some("1700.def.host"));
    }

    #[test]
    fn parses_headers_and_body() {
        let dir = maildir();
        let path = dir.path().join("new/100.a.host");
        fs::write(
            &path,
            raw("Alice <alice@example.com>", "Hello", "Mon, 06 Jan 2025 10:00:00 +0000", "Hi there"),
        )
        .unwrap();

        let msg = parse_file(&path).unwrap();
        assert_eq!(msg.external_id, "100.a.host");
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.recipient, "me@home.net");
        assert_eq!(msg.subject, "Hello");
        assert_eq!(msg.body_preview, "Hi there");
        assert_eq!(msg.received_at.to_rfc3339(), "2025-01-06T10:00:00+00:00");
        assert!(!msg.has_attachments);
        assert!(msg.size_bytes > 0);
    }

    #[tokio::test]
    async fn fetch_orders_and_limits() {
        let dir = maildir();
        fs::write(
            dir.path().join("new/1.a.host"),
            raw("a@x.com", "old", "Mon, 06 Jan 2025 10:00:00 +0000", "x"),
        )
        .unwrap();
        fs::write(
            dir.path().join("cur/2.b.host:2,S"),
            raw("b@x.com", "newer", "Tue, 07 Jan 2025 10:00:00 +0000", "x"),
        )
        .unwrap();
        fs::write(
            dir.path().join("new/3.c.host"),
            raw("c@x.com", "newest", "Wed, 08 Jan 2025 10:00:00 +0000", "x"),
        )
        .unwrap();
        // Ignored: tmp/ is not read
        fs::write(
            dir.path().join("tmp/4.d.host"),
            raw("d@x.com", "partial", "Thu, 09 Jan 2025 10:00:00 +0000", "x"),
        )
        .unwrap();

        let source = MaildirSource::new(dir.path());
        let newest: Vec<String> = source
            .fetch_messages(2, true)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.subject)
            .collect();
        assert_eq!(newest, ["newest", "newer"]);

        let all = source.fetch_messages(0, false).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].subject, "old");
        assert_eq!(all[1].external_id, "2.b.host");
    }

    #[tokio::test]
    async fn flat_directory_is_read() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("m1"),
            raw("a@x.com", "flat", "Mon, 06 Jan 2025 10:00:00 +0000", "x"),
        )
        .unwrap();
        fs::write(dir.path().join(".hidden"), "junk").unwrap();

        let messages = MaildirSource::new(dir.path()).fetch_messages(10, true).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].external_id, "m1");
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = maildir();
        let path = dir.path().join("cur/9.z.host:2,S");
        fs::write(&path, raw("a@x.com", "bye", "Mon, 06 Jan 2025 10:00:00 +0000", "x")).unwrap();

        let source = MaildirSource::new(dir.path());
        assert!(source.delete_message("9.z.host").await.unwrap());
        assert!(!path.exists());
        assert!(!source.delete_message("9.z.host").await.unwrap());
    }

    #[tokio::test]
    async fn missing_root_is_io_error() {
        let source = MaildirSource::new("/nonexistent/mail-triage-test");
        let err = source.fetch_messages(10, true).await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }
}
