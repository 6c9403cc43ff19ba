//! libSQL backend: async `TriageStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    ActionTaken, HumanDecision, LearnedRule, Message, ParseEnumError, ReviewStatus, RuleKind,
    RuleProposal, StoredMessage, Verdict, sender_domain,
};
use crate::store::migrations;
use crate::store::traits::{
    CalibrationSample, DecisionCounts, DecisionRecord, DecisionTotals, MessageFilter,
    PriorDecision, TriageStore,
};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    // Connections are opened from this handle; it lives as long as `conn`.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            _db: db,
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            _db: db,
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        sql: &str,
        params: Vec<Value>,
        context: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    /// Single-row lookup. Unlike list queries, a row that fails to decode is
    /// an error.
    async fn query_message(
        &self,
        sql: &str,
        key: &str,
        context: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }

    async fn query_counts(
        &self,
        sql: &str,
        key: &str,
        context: &str,
    ) -> Result<DecisionCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut counts = DecisionCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            let action: String = row.get(0).map_err(col_err(0))?;
            let n: i64 = row.get(1).map_err(col_err(1))?;
            let n = usize::try_from(n).unwrap_or(0);
            match parse_enum::<ActionTaken>(&action)? {
                ActionTaken::Kept => counts.kept += n,
                ActionTaken::Deleted => counts.deleted += n,
                ActionTaken::Archived => counts.archived += n,
            }
        }
        Ok(counts)
    }

    async fn query_examples(
        &self,
        sql: &str,
        params: Vec<Value>,
        context: &str,
    ) -> Result<Vec<PriorDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut examples = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            let action: String = row.get(3).map_err(col_err(3))?;
            examples.push(PriorDecision {
                sender: row.get(0).map_err(col_err(0))?,
                subject: row.get(1).map_err(col_err(1))?,
                category: row.get(2).map_err(col_err(2))?,
                action_taken: parse_enum(&action)?,
            });
        }
        Ok(examples)
    }

    async fn get_rule(&self, id: &str) -> Result<Option<LearnedRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM learned_rules WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_rule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_rule: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC, so stored strings
/// sort chronologically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Naive timestamps are read as UTC
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|ndt| ndt.and_utc())
        .map_err(|_| DatabaseError::Serialization(format!("invalid timestamp '{s}'")))
}

fn parse_optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(parse_datetime).transpose()
}

fn parse_enum<T>(s: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = ParseEnumError>,
{
    s.parse()
        .map_err(|e: ParseEnumError| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> Value {
    match v {
        Some(v) => Value::Real(v),
        None => Value::Null,
    }
}

fn col_err(idx: i32) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("row parse (column {idx}): {e}"))
}

/// WHERE fragment and parameters for a message filter. Column aliases:
/// `m` = messages, `v` = verdicts.
fn filter_clause(filter: &MessageFilter) -> (&'static str, Vec<Value>) {
    match filter {
        MessageFilter::All => ("1 = 1", Vec::new()),
        MessageFilter::Sender(sender) => ("m.sender = ?1", vec![Value::Text(sender.clone())]),
        MessageFilter::Category(category) => {
            ("v.category = ?1", vec![Value::Text(category.clone())])
        }
        MessageFilter::ReceivedBetween { from, to } => (
            "m.received_at >= ?1 AND m.received_at < ?2",
            vec![Value::Text(ts(*from)), Value::Text(ts(*to))],
        ),
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.external_id, m.sender, m.recipient, m.subject, m.body_preview, m.received_at, m.size_bytes, m.has_attachments, m.fetched_at, m.deleted_at";

const VERDICT_COLUMNS: &str = "v.message_id, v.recommendation, v.confidence, v.stated_confidence, v.category, v.priority, v.reasoning, v.source_tier, v.model_name, v.rule_name, v.analyzed_at, v.review_status";

const RULE_COLUMNS: &str = "id, pattern_type, pattern_value, action, consistency_rate, support, times_matched, is_active, requires_review, created_at";

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let received_str: String = row.get(6).map_err(col_err(6))?;
    let fetched_str: String = row.get(9).map_err(col_err(9))?;
    let deleted_str: Option<String> = row.get(10).ok();
    let has_attachments: i64 = row.get(8).map_err(col_err(8))?;

    Ok(StoredMessage {
        id: row.get(0).map_err(col_err(0))?,
        message: Message {
            external_id: row.get(1).map_err(col_err(1))?,
            sender: row.get(2).map_err(col_err(2))?,
            recipient: row.get(3).map_err(col_err(3))?,
            subject: row.get(4).map_err(col_err(4))?,
            body_preview: row.get(5).map_err(col_err(5))?,
            received_at: parse_datetime(&received_str)?,
            size_bytes: row.get(7).map_err(col_err(7))?,
            has_attachments: has_attachments != 0,
        },
        fetched_at: parse_datetime(&fetched_str)?,
        deleted_at: parse_optional_datetime(deleted_str.as_deref())?,
    })
}

fn row_to_verdict(row: &libsql::Row) -> Result<Verdict, DatabaseError> {
    let recommendation: String = row.get(1).map_err(col_err(1))?;
    let priority: String = row.get(5).map_err(col_err(5))?;
    let tier: String = row.get(7).map_err(col_err(7))?;
    let rule_name: Option<String> = row.get(9).ok();
    let analyzed_str: String = row.get(10).map_err(col_err(10))?;
    let status: String = row.get(11).map_err(col_err(11))?;

    Ok(Verdict {
        message_id: row.get(0).map_err(col_err(0))?,
        recommendation: parse_enum(&recommendation)?,
        confidence: row.get(2).map_err(col_err(2))?,
        stated_confidence: row.get::<f64>(3).ok(),
        category: row.get(4).map_err(col_err(4))?,
        priority: parse_enum(&priority)?,
        reasoning: row.get(6).map_err(col_err(6))?,
        source_tier: parse_enum(&tier)?,
        model_name: row.get(8).map_err(col_err(8))?,
        rule: rule_name.as_deref().map(parse_enum::<RuleKind>).transpose()?,
        analyzed_at: parse_datetime(&analyzed_str)?,
        review_status: parse_enum(&status)?,
    })
}

fn row_to_decision(row: &libsql::Row) -> Result<HumanDecision, DatabaseError> {
    let agreed: i64 = row.get(1).map_err(col_err(1))?;
    let action: String = row.get(2).map_err(col_err(2))?;
    let decided_str: String = row.get(4).map_err(col_err(4))?;

    Ok(HumanDecision {
        message_id: row.get(0).map_err(col_err(0))?,
        agreed_with_verdict: agreed != 0,
        action_taken: parse_enum(&action)?,
        notes: row.get(3).ok(),
        decided_at: parse_datetime(&decided_str)?,
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<LearnedRule, DatabaseError> {
    let pattern_type: String = row.get(1).map_err(col_err(1))?;
    let action: String = row.get(3).map_err(col_err(3))?;
    let support: i64 = row.get(5).map_err(col_err(5))?;
    let is_active: i64 = row.get(7).map_err(col_err(7))?;
    let requires_review: i64 = row.get(8).map_err(col_err(8))?;
    let created_str: String = row.get(9).map_err(col_err(9))?;

    Ok(LearnedRule {
        id: row.get(0).map_err(col_err(0))?,
        proposal: RuleProposal {
            pattern_type: parse_enum(&pattern_type)?,
            pattern_value: row.get(2).map_err(col_err(2))?,
            action: parse_enum(&action)?,
            consistency_rate: row.get(4).map_err(col_err(4))?,
            support: usize::try_from(support).unwrap_or(0),
        },
        times_matched: row.get(6).map_err(col_err(6))?,
        is_active: is_active != 0,
        requires_review: requires_review != 0,
        created_at: parse_datetime(&created_str)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TriageStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn register_message(&self, message: &Message) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let domain = sender_domain(&message.sender).unwrap_or_default();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (id, external_id, sender, sender_domain, recipient, subject,
                    body_preview, received_at, size_bytes, has_attachments, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (external_id) DO NOTHING",
                params![
                    id.clone(),
                    message.external_id.clone(),
                    message.sender.clone(),
                    domain,
                    message.recipient.clone(),
                    message.subject.clone(),
                    message.body_preview.clone(),
                    ts(message.received_at),
                    message.size_bytes,
                    i64::from(message.has_attachments),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("register_message", e))?;

        if inserted > 0 {
            debug!(id = %id, external_id = %message.external_id, "Message registered");
        }

        self.get_message_by_external_id(&message.external_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: message.external_id.clone(),
            })
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_message(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
            id,
            "get_message",
        )
        .await
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_message(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.external_id = ?1"),
            external_id,
            "get_message_by_external_id",
        )
        .await
    }

    async fn find_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let (clause, params) = filter_clause(filter);
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN verdicts v ON v.message_id = m.id
                 WHERE m.deleted_at IS NULL AND {clause}
                 ORDER BY m.received_at ASC"
            ),
            params,
            "find_messages",
        )
        .await
    }

    async fn mark_deleted(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET deleted_at = ?2 WHERE id = ?1",
                params![id, ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("mark_deleted", e))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Verdicts ────────────────────────────────────────────────────

    async fn upsert_verdict(&self, verdict: &Verdict) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO verdicts (message_id, recommendation, confidence, stated_confidence,
                    category, priority, reasoning, source_tier, model_name, rule_name,
                    analyzed_at, review_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'pending')
                 ON CONFLICT (message_id) DO UPDATE SET
                    recommendation = excluded.recommendation,
                    confidence = excluded.confidence,
                    stated_confidence = excluded.stated_confidence,
                    category = excluded.category,
                    priority = excluded.priority,
                    reasoning = excluded.reasoning,
                    source_tier = excluded.source_tier,
                    model_name = excluded.model_name,
                    rule_name = excluded.rule_name,
                    analyzed_at = excluded.analyzed_at,
                    review_status = 'pending'",
                params![
                    verdict.message_id.clone(),
                    verdict.recommendation.as_str(),
                    verdict.confidence,
                    opt_real(verdict.stated_confidence),
                    verdict.category.clone(),
                    verdict.priority.as_str(),
                    verdict.reasoning.clone(),
                    verdict.source_tier.as_str(),
                    verdict.model_name.clone(),
                    opt_text(verdict.rule.as_ref().map(|r| r.as_str())),
                    ts(verdict.analyzed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_verdict", e))?;

        debug!(
            id = %verdict.message_id,
            tier = %verdict.source_tier,
            recommendation = %verdict.recommendation,
            confidence = verdict.confidence,
            "Verdict stored"
        );
        Ok(())
    }

    async fn get_verdict(&self, message_id: &str) -> Result<Option<Verdict>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {VERDICT_COLUMNS} FROM verdicts v WHERE v.message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_verdict: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_verdict(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_verdict: {e}"))),
        }
    }

    async fn pending_verdicts(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<Verdict>, DatabaseError> {
        let (clause, params) = filter_clause(filter);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {VERDICT_COLUMNS} FROM verdicts v
                     JOIN messages m ON m.id = v.message_id
                     WHERE v.review_status = 'pending' AND m.deleted_at IS NULL AND {clause}
                     ORDER BY m.received_at ASC"
                ),
                params,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_verdicts: {e}")))?;

        let mut verdicts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_verdicts: {e}")))?
        {
            verdicts.push(row_to_verdict(&row)?);
        }
        Ok(verdicts)
    }

    // ── Decisions ───────────────────────────────────────────────────

    async fn record_decision(&self, decision: &HumanDecision) -> Result<(), DatabaseError> {
        let status = if decision.agreed_with_verdict {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::from_libsql("record_decision", e))?;

        let updated = tx
            .execute(
                "UPDATE verdicts SET review_status = ?2 WHERE message_id = ?1",
                params![decision.message_id.clone(), status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("record_decision", e))?;

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::from_libsql("record_decision", e))?;
            return Err(DatabaseError::NotFound {
                entity: "verdict".into(),
                id: decision.message_id.clone(),
            });
        }

        tx.execute(
            "INSERT INTO decisions (message_id, agreed_with_verdict, action_taken, notes, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (message_id) DO UPDATE SET
                agreed_with_verdict = excluded.agreed_with_verdict,
                action_taken = excluded.action_taken,
                notes = excluded.notes,
                decided_at = excluded.decided_at",
            params![
                decision.message_id.clone(),
                i64::from(decision.agreed_with_verdict),
                decision.action_taken.as_str(),
                opt_text(decision.notes.as_deref()),
                ts(decision.decided_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("record_decision", e))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::from_libsql("record_decision", e))?;

        debug!(
            id = %decision.message_id,
            agreed = decision.agreed_with_verdict,
            action = %decision.action_taken,
            "Decision recorded"
        );
        Ok(())
    }

    async fn get_decision(
        &self,
        message_id: &str,
    ) -> Result<Option<HumanDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, agreed_with_verdict, action_taken, notes, decided_at
                 FROM decisions WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_decision: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_decision(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_decision: {e}"))),
        }
    }

    async fn sender_decision_counts(&self, sender: &str) -> Result<DecisionCounts, DatabaseError> {
        self.query_counts(
            "SELECT d.action_taken, COUNT(*) FROM decisions d
             JOIN messages m ON m.id = d.message_id
             WHERE m.sender = ?1
             GROUP BY d.action_taken",
            sender,
            "sender_decision_counts",
        )
        .await
    }

    async fn domain_decision_counts(&self, domain: &str) -> Result<DecisionCounts, DatabaseError> {
        self.query_counts(
            "SELECT d.action_taken, COUNT(*) FROM decisions d
             JOIN messages m ON m.id = d.message_id
             WHERE m.sender_domain = ?1
             GROUP BY d.action_taken",
            &domain.to_lowercase(),
            "domain_decision_counts",
        )
        .await
    }

    async fn calibration_samples(&self) -> Result<Vec<CalibrationSample>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(v.stated_confidence, v.confidence), d.agreed_with_verdict
                 FROM decisions d
                 JOIN verdicts v ON v.message_id = d.message_id
                 WHERE v.source_tier = 'model'
                   AND v.review_status IN ('approved', 'rejected')",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("calibration_samples: {e}")))?;

        let mut samples = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("calibration_samples: {e}")))?
        {
            let agreed: i64 = row.get(1).map_err(col_err(1))?;
            samples.push(CalibrationSample {
                stated_confidence: row.get(0).map_err(col_err(0))?,
                agreed: agreed != 0,
            });
        }
        Ok(samples)
    }

    async fn sender_examples(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<PriorDecision>, DatabaseError> {
        self.query_examples(
            "SELECT m.sender, m.subject, COALESCE(v.category, 'unknown'), d.action_taken
             FROM decisions d
             JOIN messages m ON m.id = d.message_id
             LEFT JOIN verdicts v ON v.message_id = d.message_id
             WHERE m.sender = ?1
             ORDER BY d.decided_at DESC
             LIMIT ?2",
            vec![Value::Text(sender.to_string()), Value::Integer(limit as i64)],
            "sender_examples",
        )
        .await
    }

    async fn category_examples(
        &self,
        category: &str,
        exclude_sender: &str,
        limit: usize,
    ) -> Result<Vec<PriorDecision>, DatabaseError> {
        self.query_examples(
            "SELECT m.sender, m.subject, v.category, d.action_taken
             FROM decisions d
             JOIN messages m ON m.id = d.message_id
             JOIN verdicts v ON v.message_id = d.message_id
             WHERE v.category = ?1 AND m.sender != ?2
             ORDER BY d.decided_at DESC
             LIMIT ?3",
            vec![
                Value::Text(category.to_string()),
                Value::Text(exclude_sender.to_string()),
                Value::Integer(limit as i64),
            ],
            "category_examples",
        )
        .await
    }

    async fn decision_records(&self) -> Result<Vec<DecisionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT m.sender, m.sender_domain, COALESCE(v.category, 'unknown'), d.action_taken
                 FROM decisions d
                 JOIN messages m ON m.id = d.message_id
                 LEFT JOIN verdicts v ON v.message_id = d.message_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("decision_records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("decision_records: {e}")))?
        {
            let action: String = row.get(3).map_err(col_err(3))?;
            records.push(DecisionRecord {
                sender: row.get(0).map_err(col_err(0))?,
                domain: row.get(1).map_err(col_err(1))?,
                category: row.get(2).map_err(col_err(2))?,
                action_taken: parse_enum(&action)?,
            });
        }
        Ok(records)
    }

    async fn decision_totals(&self) -> Result<DecisionTotals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(agreed_with_verdict), 0) FROM decisions",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("decision_totals: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let total: i64 = row.get(0).map_err(col_err(0))?;
                let agreed: i64 = row.get(1).map_err(col_err(1))?;
                Ok(DecisionTotals {
                    total: usize::try_from(total).unwrap_or(0),
                    agreed: usize::try_from(agreed).unwrap_or(0),
                })
            }
            Ok(None) => Ok(DecisionTotals::default()),
            Err(e) => Err(DatabaseError::Query(format!("decision_totals: {e}"))),
        }
    }

    async fn approved_deletions(&self) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 JOIN verdicts v ON v.message_id = m.id
                 JOIN decisions d ON d.message_id = m.id
                 WHERE v.recommendation = 'delete'
                   AND v.review_status = 'approved'
                   AND d.agreed_with_verdict = 1
                   AND m.deleted_at IS NULL
                 ORDER BY m.received_at ASC"
            ),
            Vec::new(),
            "approved_deletions",
        )
        .await
    }

    // ── Learned rules ───────────────────────────────────────────────

    async fn insert_rule(&self, proposal: &RuleProposal) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO learned_rules (id, pattern_type, pattern_value, action,
                    consistency_rate, support, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (pattern_type, pattern_value) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    proposal.pattern_type.as_str(),
                    proposal.pattern_value.clone(),
                    proposal.action.as_str(),
                    proposal.consistency_rate,
                    proposal.support as i64,
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_rule", e))?;
        Ok(inserted > 0)
    }

    async fn activate_rule(&self, id: &str) -> Result<LearnedRule, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE learned_rules SET is_active = 1, requires_review = 0 WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("activate_rule", e))?;

        let not_found = || DatabaseError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        };
        if updated == 0 {
            return Err(not_found());
        }
        self.get_rule(id).await?.ok_or_else(not_found)
    }

    async fn list_rules(&self, active_only: bool) -> Result<Vec<LearnedRule>, DatabaseError> {
        let sql = if active_only {
            format!(
                "SELECT {RULE_COLUMNS} FROM learned_rules WHERE is_active = 1 ORDER BY created_at ASC"
            )
        } else {
            format!("SELECT {RULE_COLUMNS} FROM learned_rules ORDER BY created_at ASC")
        };
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?
        {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }
}
