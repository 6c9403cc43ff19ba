//! Configuration types.
//!
//! Loaded once at startup: an optional YAML file, then environment
//! overrides, then validation. Nothing here is re-read while running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "MAIL_TRIAGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub database: DatabaseConfig,
    pub classifier: ClassifierConfig,
    pub scanner: ScannerConfig,
    pub rules: RuleConfig,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/mail-triage.db"),
        }
    }
}

/// Classification service connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: 120,
            api_key: None,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Maildir to read from. Required for the scanning commands.
    pub maildir: Option<PathBuf>,
    /// Maximum messages fetched per scan.
    pub limit: usize,
    pub newest_first: bool,
    pub max_conflict_retries: u32,
    /// Seconds between runs in watch mode.
    pub interval_secs: u64,
    /// Parallelism for rescans.
    pub rescan_concurrency: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            maildir: None,
            limit: 50,
            newest_first: true,
            max_conflict_retries: 3,
            interval_secs: 300,
            rescan_concurrency: 4,
        }
    }
}

/// Rule matcher lists and age thresholds.
///
/// The section may be left out entirely, but a section that is present must
/// state every threshold. Lists fall back to the built-in sets.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub vip_senders: Vec<String>,
    #[serde(default = "default_event_keywords")]
    pub event_keywords: Vec<String>,
    #[serde(default = "default_job_keywords")]
    pub job_keywords: Vec<String>,
    #[serde(default = "default_newsletter_senders")]
    pub newsletter_senders: Vec<String>,
    #[serde(default = "default_promotional_keywords")]
    pub promotional_keywords: Vec<String>,
    pub old_event_days: i64,
    pub old_job_days: i64,
    pub old_newsletter_days: i64,
    pub old_promotional_days: i64,
    /// Sender substrings that mark an address as automated.
    #[serde(default = "default_automated_senders")]
    pub automated_senders: Vec<String>,
    /// Case-insensitive regexes that mark text as promotional.
    #[serde(default = "default_promotional_patterns")]
    pub promotional_patterns: Vec<String>,
    #[serde(default = "default_webmail_domains")]
    pub webmail_domains: Vec<String>,
    pub max_personal_subject_words: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_event_keywords() -> Vec<String> {
    strings(&[
        "calendar",
        "meeting",
        "appointment",
        "rsvp",
        "invite",
        "invitation",
        "event",
        "reminder",
        "scheduled",
        "webinar",
        "conference",
    ])
}

fn default_job_keywords() -> Vec<String> {
    strings(&[
        "job opportunity",
        "job alert",
        "career opportunity",
        "now hiring",
        "we're hiring",
        "position available",
        "job opening",
        "apply now",
        "recruitment",
        "recruiter",
    ])
}

fn default_newsletter_senders() -> Vec<String> {
    strings(&["@newsletters.", "noreply@", "news@"])
}

fn default_promotional_keywords() -> Vec<String> {
    strings(&[
        "sale",
        "discount",
        "% off",
        "limited time",
        "deal",
        "offer",
        "promotion",
        "exclusive",
        "flash sale",
        "clearance",
        "save now",
        "shop now",
        "buy now",
        "order now",
    ])
}

fn default_automated_senders() -> Vec<String> {
    strings(&[
        "noreply",
        "no-reply",
        "donotreply",
        "notifications",
        "alerts",
        "info@",
        "support@",
        "news@",
        "marketing@",
    ])
}

fn default_promotional_patterns() -> Vec<String> {
    strings(&[
        r"unsubscribe",
        r"click here",
        r"\d+% off",
        r"limited time",
        r"don't miss",
        r"exclusive offer",
    ])
}

fn default_webmail_domains() -> Vec<String> {
    strings(&["@gmail.com", "@yahoo.com", "@hotmail.com"])
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            vip_senders: Vec::new(),
            event_keywords: default_event_keywords(),
            job_keywords: default_job_keywords(),
            newsletter_senders: default_newsletter_senders(),
            promotional_keywords: default_promotional_keywords(),
            old_event_days: 60,
            old_job_days: 180,
            old_newsletter_days: 7,
            old_promotional_days: 90,
            automated_senders: default_automated_senders(),
            promotional_patterns: default_promotional_patterns(),
            webmail_domains: default_webmail_domains(),
            max_personal_subject_words: 6,
        }
    }
}

/// Calibration thresholds. Like `rules`, a present section must be complete.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Bucket sample size below which confidence is left alone.
    pub min_samples: usize,
    /// Fraction of the measured error that is corrected.
    pub damping: f64,
    /// Smallest adjustment the pipeline bothers to apply.
    pub min_adjustment: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            damping: 0.5,
            min_adjustment: 0.05,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl TriageConfig {
    /// Load from `MAIL_TRIAGE_CONFIG` (or `config/config.yaml` when present),
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file. Missing sections take their defaults; a threshold
    /// missing from a section that is present is a parse error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MAIL_TRIAGE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("MAIL_TRIAGE_MAILDIR") {
            self.scanner.maildir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup("MAIL_TRIAGE_CLASSIFIER_URL") {
            self.classifier.base_url = url;
        }
        if let Some(model) = lookup("MAIL_TRIAGE_MODEL") {
            self.classifier.model = model;
        }
        if let Some(raw) = lookup("MAIL_TRIAGE_CLASSIFIER_TIMEOUT_SECS") {
            self.classifier.timeout_secs = parse_number("MAIL_TRIAGE_CLASSIFIER_TIMEOUT_SECS", &raw)?;
        }
        if let Some(key) = lookup("MAIL_TRIAGE_CLASSIFIER_API_KEY")
            && !key.is_empty()
        {
            self.classifier.api_key = Some(SecretString::from(key));
        }
        if let Some(raw) = lookup("MAIL_TRIAGE_SCAN_LIMIT") {
            self.scanner.limit = parse_number("MAIL_TRIAGE_SCAN_LIMIT", &raw)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("rules.old_event_days", self.rules.old_event_days),
            ("rules.old_job_days", self.rules.old_job_days),
            ("rules.old_newsletter_days", self.rules.old_newsletter_days),
            ("rules.old_promotional_days", self.rules.old_promotional_days),
        ];
        for (key, days) in thresholds {
            if days < 0 {
                return Err(invalid(key, format!("must be non-negative, got {days}")));
            }
        }

        for pattern in &self.rules.promotional_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| invalid("rules.promotional_patterns", format!("{pattern}: {e}")))?;
        }

        if self.classifier.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "classifier.base_url".into(),
                hint: "Set MAIL_TRIAGE_CLASSIFIER_URL or classifier.base_url".into(),
            });
        }
        if self.classifier.model.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "classifier.model".into(),
                hint: "Set MAIL_TRIAGE_MODEL or classifier.model".into(),
            });
        }
        if self.classifier.timeout_secs == 0 {
            return Err(invalid("classifier.timeout_secs", "must be greater than zero"));
        }

        let cal = &self.calibration;
        if !(0.0..=1.0).contains(&cal.damping) {
            return Err(invalid("calibration.damping", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&cal.min_adjustment) {
            return Err(invalid("calibration.min_adjustment", "must be within [0, 1]"));
        }
        if self.scanner.rescan_concurrency == 0 {
            return Err(invalid("scanner.rescan_concurrency", "must be at least 1"));
        }
        if self.scanner.interval_secs == 0 {
            return Err(invalid("scanner.interval_secs", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a non-negative integer, got '{raw}'")))
}
