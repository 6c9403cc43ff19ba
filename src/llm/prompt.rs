//! Prompt construction for the classification service.

use crate::llm::provider::ClassificationRequest;
use crate::pipeline::types::ActionTaken;

/// Subject characters shown per prior example.
const EXAMPLE_SUBJECT_CHARS: usize = 50;

/// Human-readable message age.
pub fn age_descriptor(age_days: i64) -> String {
    fn plural(n: i64, unit: &str) -> String {
        if n == 1 {
            format!("{n} {unit} old")
        } else {
            format!("{n} {unit}s old")
        }
    }

    match age_days {
        i64::MIN..=0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => format!("{age_days} days old"),
        7..=29 => plural(age_days / 7, "week"),
        30..=364 => plural(age_days / 30, "month"),
        _ => plural(age_days / 365, "year"),
    }
}

fn truncate_subject(subject: &str) -> String {
    if subject.chars().count() > EXAMPLE_SUBJECT_CHARS {
        let head: String = subject.chars().take(EXAMPLE_SUBJECT_CHARS).collect();
        format!("{head}...")
    } else {
        subject.to_string()
    }
}

/// Build the full classification prompt for one message.
pub fn build_classification_prompt(request: &ClassificationRequest) -> String {
    let mut prompt = format!(
        "You are an email classification assistant. Analyze this email and provide a recommendation.

Email Details:
- From: {sender}
- Subject: {subject}
- Date: {date}
- Age: {age}
- Has attachments: {attachments}
- Body preview: {body}",
        sender = request.sender,
        subject = request.subject,
        date = request.received_at.format("%Y-%m-%d %H:%M UTC"),
        age = request.age,
        attachments = request.has_attachments,
        body = request.body_preview,
    );

    if !request.examples.is_empty() {
        prompt.push_str("\n\nPrevious decisions for similar emails:\n");
        for ex in &request.examples {
            let verb = match ex.action_taken {
                ActionTaken::Kept => "kept",
                ActionTaken::Deleted => "deleted",
                ActionTaken::Archived => "archived",
            };
            prompt.push_str(&format!(
                "- From {}: \"{}\" -> {} (Category: {})\n",
                ex.sender,
                truncate_subject(&ex.subject),
                verb,
                ex.category
            ));
        }
    }

    prompt.push_str(
        r#"

Task: Analyze this email and provide:
1. Recommendation: should this email be "delete", "keep", or "archive"?
2. Confidence: your confidence level (0.0 to 1.0)
3. Reasoning: brief explanation for your recommendation
4. Category: email category (e.g. "newsletter", "personal", "promotional", "notification", "spam", "important", "job_offer", "recruiter")
5. Priority: "low", "medium" or "high"

Guidelines:
- Recommend "delete" for:
  * Spam and unsolicited email
  * Newsletters more than a week old, regardless of how reputable the source is
  * Promotional or sale email from companies, especially older than 30-60 days
  * Job offers and recruiter email, especially if old or unsolicited
  * Automated notifications with no lasting value
  * Mass marketing and any bulk/broadcast email more than 7 days old
  * Transactional email (receipts, confirmations) older than 90 days
- Weigh age carefully:
  * Under 7 days: be conservative, it may still be relevant
  * 7-30 days: newsletters and promotions should be deleted
  * 30-60 days: delete promotional and newsletter content aggressively
  * Over 60 days: delete unless personal or important
- Recommend "keep" for:
  * Personal correspondence from real people
  * Important business email or email requiring action
  * Email from family, friends or close contacts
- Recommend "archive" for:
  * Receipts, order, travel and booking confirmations
  * Reference material and records that may be needed later
- Recruiter indicators: staffing agencies, subjects mentioning a position, role, contract or remote opportunity, phrases like "immediate need" or "hiring for". Mark these "delete" with category "job_offer" or "recruiter".

Be conservative: if unsure, prefer "keep" or "archive" over "delete".
Use high confidence (>0.8) for clear spam, newsletters and recruiters, and lower confidence (<0.6) for ambiguous email.

Respond in JSON format:
{
    "recommendation": "delete|keep|archive",
    "confidence_score": 0.85,
    "reasoning": "Brief explanation here",
    "category": "newsletter",
    "priority": "low"
}

Respond ONLY with valid JSON, no other text."#,
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PriorDecision;
    use chrono::Utc;

    #[test]
    fn age_descriptors() {
        assert_eq!(age_descriptor(0), "Today");
        assert_eq!(age_descriptor(-2), "Today");
        assert_eq!(age_descriptor(1), "Yesterday");
        assert_eq!(age_descriptor(6), "6 days old");
        assert_eq!(age_descriptor(7), "1 week old");
        assert_eq!(age_descriptor(20), "2 weeks old");
        assert_eq!(age_descriptor(30), "1 month old");
        assert_eq!(age_descriptor(200), "6 months old");
        assert_eq!(age_descriptor(364), "12 months old");
        assert_eq!(age_descriptor(365), "1 year old");
        assert_eq!(age_descriptor(800), "2 years old");
    }

    #[test]
    fn prompt_includes_message_and_examples() {
        let request = ClassificationRequest {
            sender: "deals@shop.com".into(),
            subject: "Big savings".into(),
            body_preview: "Everything must go".into(),
            received_at: Utc::now(),
            age: "Today".into(),
            has_attachments: false,
            examples: vec![PriorDecision {
                sender: "deals@shop.com".into(),
                subject: "x".repeat(60),
                category: "promotional".into(),
                action_taken: ActionTaken::Deleted,
            }],
        };
        let prompt = build_classification_prompt(&request);
        assert!(prompt.contains("- From: deals@shop.com"));
        assert!(prompt.contains("- Age: Today"));
        assert!(prompt.contains("Previous decisions"));
        assert!(prompt.contains(&format!("\"{}...\" -> deleted", "x".repeat(50))));
        assert!(prompt.contains("\"confidence_score\""));
    }

    #[test]
    fn prompt_omits_empty_examples_section() {
        let request = ClassificationRequest {
            sender: "a@b.com".into(),
            subject: "s".into(),
            body_preview: String::new(),
            received_at: Utc::now(),
            age: "Today".into(),
            has_attachments: true,
            examples: vec![],
        };
        let prompt = build_classification_prompt(&request);
        assert!(!prompt.contains("Previous decisions"));
        assert!(prompt.contains("Has attachments: true"));
    }
}
