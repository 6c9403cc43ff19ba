//! Deterministic rule tier.
//!
//! Runs before sender history and the classifier to settle obvious cases:
//! - stale event notifications → delete (even from VIPs)
//! - VIP senders, live events, personal contacts → keep
//! - stale job offers, newsletters and promotions → delete
//!
//! Rules are evaluated in a fixed order and the first match wins. If the
//! matcher returns an `Assessment`, nothing downstream runs.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::RuleConfig;
use crate::error::ConfigError;
use crate::pipeline::types::{Assessment, Message, Priority, Recommendation, RuleKind, SourceTier};

/// Model name recorded on rule-tier verdicts.
pub const RULES_MODEL_NAME: &str = "rules_engine";

/// Lower-cased view of a message that the predicates work on.
struct MatchContext<'a> {
    message: &'a Message,
    sender: String,
    text: String,
    age_days: i64,
}

type Predicate = fn(&RuleMatcher, &MatchContext<'_>) -> bool;

/// Evaluation order. First match wins.
const RULES: [(RuleKind, Predicate); 7] = [
    (RuleKind::OldEvent, RuleMatcher::is_old_event),
    (RuleKind::VipSender, RuleMatcher::is_vip),
    (RuleKind::Event, RuleMatcher::is_event),
    (RuleKind::PersonalContact, RuleMatcher::is_personal_contact),
    (RuleKind::OldJobOffer, RuleMatcher::is_old_job_offer),
    (RuleKind::OldNewsletter, RuleMatcher::is_old_newsletter),
    (RuleKind::OldPromotional, RuleMatcher::is_old_promotional),
];

/// Ordered keyword/sender/age predicates.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    vip_senders: Vec<String>,
    event_keywords: Vec<String>,
    job_keywords: Vec<String>,
    newsletter_senders: Vec<String>,
    promotional_keywords: Vec<String>,
    old_event_days: i64,
    old_job_days: i64,
    old_newsletter_days: i64,
    old_promotional_days: i64,
    automated_senders: Vec<String>,
    promotional_patterns: Vec<Regex>,
    webmail_domains: Vec<String>,
    max_personal_subject_words: usize,
}

fn normalize(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl RuleMatcher {
    /// Build from configuration. Fails if a promotional pattern is not a
    /// valid regex.
    pub fn new(config: &RuleConfig) -> Result<Self, ConfigError> {
        let promotional_patterns = config
            .promotional_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "rules.promotional_patterns".into(),
                        message: format!("{p}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            vip_senders: normalize(&config.vip_senders),
            event_keywords: normalize(&config.event_keywords),
            job_keywords: normalize(&config.job_keywords),
            newsletter_senders: normalize(&config.newsletter_senders),
            promotional_keywords: normalize(&config.promotional_keywords),
            old_event_days: config.old_event_days,
            old_job_days: config.old_job_days,
            old_newsletter_days: config.old_newsletter_days,
            old_promotional_days: config.old_promotional_days,
            automated_senders: normalize(&config.automated_senders),
            promotional_patterns,
            webmail_domains: normalize(&config.webmail_domains),
            max_personal_subject_words: config.max_personal_subject_words,
        })
    }

    /// Add a VIP sender substring. Returns false if empty or already present.
    pub fn add_vip_sender(&mut self, sender: &str) -> bool {
        let sender = sender.trim().to_lowercase();
        if sender.is_empty() || self.vip_senders.contains(&sender) {
            return false;
        }
        self.vip_senders.push(sender);
        true
    }

    /// Remove a VIP sender. Returns whether it was present.
    pub fn remove_vip_sender(&mut self, sender: &str) -> bool {
        let sender = sender.trim().to_lowercase();
        let before = self.vip_senders.len();
        self.vip_senders.retain(|s| *s != sender);
        self.vip_senders.len() != before
    }

    pub fn vip_senders(&self) -> &[String] {
        &self.vip_senders
    }

    /// Evaluate a message against the ordered rules.
    ///
    /// Returns `Some(Assessment)` for the first rule that matches, `None`
    /// to fall through to the next tier.
    pub fn evaluate(&self, message: &Message, now: DateTime<Utc>) -> Option<Assessment> {
        let ctx = MatchContext {
            message,
            sender: message.sender.to_lowercase(),
            text: format!("{} {}", message.subject, message.body_preview).to_lowercase(),
            age_days: message.age_days(now),
        };

        let kind = RULES
            .iter()
            .find(|(_, predicate)| predicate(self, &ctx))
            .map(|(kind, _)| *kind)?;

        debug!(
            sender = %message.sender,
            rule = %kind,
            age_days = ctx.age_days,
            "Message matched rule"
        );
        Some(self.assessment(kind, message))
    }

    fn assessment(&self, kind: RuleKind, message: &Message) -> Assessment {
        let (recommendation, confidence, category, priority, reasoning) = match kind {
            RuleKind::OldEvent => (
                Recommendation::Delete,
                0.93,
                "event",
                Priority::Low,
                format!(
                    "Old event notification (older than {} days) - no longer relevant",
                    self.old_event_days
                ),
            ),
            RuleKind::VipSender => (
                Recommendation::Keep,
                0.99,
                "personal",
                Priority::High,
                format!("VIP sender: {}", message.sender),
            ),
            RuleKind::Event => (
                Recommendation::Keep,
                0.95,
                "event",
                Priority::High,
                "Email appears to be event/calendar related".to_string(),
            ),
            RuleKind::PersonalContact => (
                Recommendation::Keep,
                0.90,
                "personal",
                Priority::Medium,
                "Email appears to be from a personal contact".to_string(),
            ),
            RuleKind::OldJobOffer => (
                Recommendation::Delete,
                0.92,
                "job",
                Priority::Low,
                format!(
                    "Old job offer (older than {} days) - likely no longer relevant",
                    self.old_job_days
                ),
            ),
            RuleKind::OldNewsletter => (
                Recommendation::Delete,
                0.93,
                "newsletter",
                Priority::Low,
                format!(
                    "Old newsletter/news source (older than {} days)",
                    self.old_newsletter_days
                ),
            ),
            RuleKind::OldPromotional => (
                Recommendation::Delete,
                0.94,
                "promotional",
                Priority::Low,
                format!(
                    "Old promotional/sale email (older than {} days)",
                    self.old_promotional_days
                ),
            ),
        };

        Assessment {
            recommendation,
            confidence,
            stated_confidence: None,
            category: category.to_string(),
            priority,
            reasoning,
            source_tier: SourceTier::Rule,
            model_name: RULES_MODEL_NAME.to_string(),
            rule: Some(kind),
        }
    }

    // ── Predicates ──────────────────────────────────────────────────

    fn contains_any(haystack: &str, needles: &[String]) -> bool {
        needles.iter().any(|n| haystack.contains(n.as_str()))
    }

    fn is_old_event(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.age_days > self.old_event_days && Self::contains_any(&ctx.text, &self.event_keywords)
    }

    fn is_vip(&self, ctx: &MatchContext<'_>) -> bool {
        Self::contains_any(&ctx.sender, &self.vip_senders)
    }

    fn is_event(&self, ctx: &MatchContext<'_>) -> bool {
        Self::contains_any(&ctx.text, &self.event_keywords)
    }

    fn is_personal_contact(&self, ctx: &MatchContext<'_>) -> bool {
        if Self::contains_any(&ctx.sender, &self.automated_senders) {
            return false;
        }
        if self.promotional_patterns.iter().any(|re| re.is_match(&ctx.text)) {
            return false;
        }
        if !Self::contains_any(&ctx.sender, &self.webmail_domains) {
            return false;
        }
        ctx.message.subject.split_whitespace().count() <= self.max_personal_subject_words
    }

    fn is_old_job_offer(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.age_days > self.old_job_days && Self::contains_any(&ctx.text, &self.job_keywords)
    }

    fn is_old_newsletter(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.age_days > self.old_newsletter_days
            && Self::contains_any(&ctx.sender, &self.newsletter_senders)
    }

    fn is_old_promotional(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.age_days > self.old_promotional_days
            && Self::contains_any(&ctx.text, &self.promotional_keywords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn matcher() -> RuleMatcher {
        RuleMatcher::new(&RuleConfig::default()).unwrap()
    }

    fn message(sender: &str, subject: &str, body: &str, age_days: i64) -> (Message, DateTime<Utc>) {
        let now = Utc::now();
        let msg = Message {
            external_id: "ext-1".into(),
            sender: sender.into(),
            recipient: "me@home.net".into(),
            subject: subject.into(),
            body_preview: body.into(),
            received_at: now - Duration::days(age_days) - Duration::minutes(1),
            size_bytes: 1024,
            has_attachments: false,
        };
        (msg, now)
    }

    fn rule_of(matcher: &RuleMatcher, msg: &Message, now: DateTime<Utc>) -> Option<RuleKind> {
        matcher.evaluate(msg, now).and_then(|a| a.rule)
    }

    #[test]
    fn vip_stale_event_is_deleted() {
        let mut m = matcher();
        m.add_vip_sender("a@b.com");
        let (msg, now) = message("a@b.com", "Team meeting notes", "", 61);

        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::OldEvent));
        assert_eq!(a.recommendation, Recommendation::Delete);
        assert_eq!(a.confidence, 0.93);
        assert_eq!(a.category, "event");
        assert_eq!(a.priority, Priority::Low);
        assert_eq!(a.source_tier, SourceTier::Rule);
        assert_eq!(a.model_name, RULES_MODEL_NAME);
    }

    #[test]
    fn vip_sender_kept() {
        let mut m = matcher();
        m.add_vip_sender("Boss@Corp.com");
        let (msg, now) = message("The Boss <boss@corp.com>", "Quarterly numbers attached here", "", 400);

        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::VipSender));
        assert_eq!(a.recommendation, Recommendation::Keep);
        assert_eq!(a.confidence, 0.99);
        assert_eq!(a.priority, Priority::High);
        assert_eq!(a.reasoning, "VIP sender: The Boss <boss@corp.com>");
    }

    #[test]
    fn event_boundary_is_strict() {
        let m = matcher();
        let now = Utc::now();
        let (mut msg, _) = message("ops@company.io", "Conference schedule", "", 0);
        msg.received_at = now - Duration::days(60);
        assert_eq!(rule_of(&m, &msg, now), Some(RuleKind::Event));

        msg.received_at = now - Duration::days(61);
        assert_eq!(rule_of(&m, &msg, now), Some(RuleKind::OldEvent));
    }

    #[test]
    fn personal_contact_from_webmail() {
        let m = matcher();
        let (msg, now) = message("friend@gmail.com", "Lunch on Friday?", "Are you free", 3);
        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::PersonalContact));
        assert_eq!(a.confidence, 0.90);
        assert_eq!(a.priority, Priority::Medium);
    }

    #[test]
    fn personal_contact_rejects_promotional_text() {
        let m = matcher();
        let (msg, now) = message("shop@gmail.com", "Hello", "Get 20% off today, click here", 1);
        assert_eq!(rule_of(&m, &msg, now), None);
    }

    #[test]
    fn personal_contact_rejects_long_subject_and_automated_sender() {
        let m = matcher();
        let (msg, now) = message("friend@gmail.com", "one two three four five six seven", "", 1);
        assert_eq!(rule_of(&m, &msg, now), None);

        let (msg, now) = message("noreply@gmail.com", "Hi", "", 1);
        assert_eq!(rule_of(&m, &msg, now), None);
    }

    #[test]
    fn old_job_offer_deleted_after_threshold() {
        let m = matcher();
        let (msg, now) = message("jobs@board.com", "Job alert: Rust developer", "", 181);
        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::OldJobOffer));
        assert_eq!(a.confidence, 0.92);
        assert_eq!(a.category, "job");

        let (msg, now) = message("jobs@board.com", "Job alert: Rust developer", "", 100);
        assert_eq!(rule_of(&m, &msg, now), None);
    }

    #[test]
    fn old_newsletter_matches_sender_pattern() {
        let m = matcher();
        let (msg, now) = message("digest@newsletters.example.com", "Weekly digest", "", 8);
        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::OldNewsletter));
        assert_eq!(a.reasoning, "Old newsletter/news source (older than 7 days)");
    }

    #[test]
    fn old_promotional_deleted() {
        let m = matcher();
        let (msg, now) = message("store@shop.com", "Flash sale ends", "", 91);
        let a = m.evaluate(&msg, now).unwrap();
        assert_eq!(a.rule, Some(RuleKind::OldPromotional));
        assert_eq!(a.confidence, 0.94);
        assert_eq!(a.category, "promotional");
    }

    #[test]
    fn unmatched_message_falls_through() {
        let m = matcher();
        let (msg, now) = message("billing@utility.com", "Your statement is ready for review", "", 2);
        assert!(m.evaluate(&msg, now).is_none());
    }

    #[test]
    fn vip_list_mutation() {
        let mut m = matcher();
        assert!(m.add_vip_sender("x@y.com"));
        assert!(!m.add_vip_sender("X@Y.com"));
        assert!(!m.add_vip_sender("   "));
        assert_eq!(m.vip_senders(), ["x@y.com".to_string()]);
        assert!(m.remove_vip_sender("x@y.com"));
        assert!(!m.remove_vip_sender("x@y.com"));
    }

    #[test]
    fn empty_config_entries_ignored() {
        let config = RuleConfig {
            vip_senders: vec!["".into(), " ".into()],
            ..RuleConfig::default()
        };
        let m = RuleMatcher::new(&config).unwrap();
        assert!(m.vip_senders().is_empty());
    }
}
