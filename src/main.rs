use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mail_triage::config::TriageConfig;
use mail_triage::error::ConfigError;
use mail_triage::llm::{ClassificationService, OllamaClassifier, create_classifier};
use mail_triage::pipeline::miner::PatternMiner;
use mail_triage::pipeline::rules::RuleMatcher;
use mail_triage::pipeline::types::{PatternType, RunStats};
use mail_triage::pipeline::{DecisionPipeline, ScanOptions, Scanner, spawn_scan_loop};
use mail_triage::review::Review;
use mail_triage::source::{MailSource, MaildirSource};
use mail_triage::store::{LibSqlBackend, MessageFilter, TriageStore};

/// Tiered keep/delete recommendations for a Maildir mailbox.
#[derive(Parser, Debug)]
#[command(name = "mail-triage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Analyse new messages from the maildir
    Scan {
        /// Also re-analyse messages already in the database
        #[arg(long)]
        rescan: bool,
    },
    /// Scan on an interval until interrupted
    Watch,
    /// Re-analyse every stored message
    Rescan,
    /// Propose rules from past decisions
    Learn {
        /// Store the proposals as inactive rules
        #[arg(long, conflicts_with = "activate")]
        save: bool,
        /// Activate a saved rule by id
        #[arg(long, value_name = "ID")]
        activate: Option<String>,
    },
    /// Print the confidence calibration report
    Calibration,
    /// Delete messages with approved delete verdicts
    Cleanup {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn print_stats(stats: &RunStats) {
    eprintln!("   Processed: {} ({} failed)", stats.processed, stats.failed);
    for (rule, count) in &stats.rule_matches {
        eprintln!("   Rule {rule}: {count}");
    }
    eprintln!("   Pattern bypasses: {}", stats.pattern_bypasses);
    eprintln!(
        "   Classified: {} ({} failed, {} calibrated)",
        stats.model_classified, stats.model_failures, stats.calibrations_applied
    );
}

fn maildir(config: &TriageConfig) -> Result<Arc<dyn MailSource>, ConfigError> {
    let root = config
        .scanner
        .maildir
        .clone()
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "scanner.maildir".into(),
            hint: "Set MAIL_TRIAGE_MAILDIR or scanner.maildir in the config file".into(),
        })?;
    Ok(Arc::new(MaildirSource::new(root)))
}

/// Rule matcher from config plus every activated VIP rule.
async fn rule_matcher(config: &TriageConfig, store: &Arc<dyn TriageStore>) -> anyhow::Result<RuleMatcher> {
    let mut matcher = RuleMatcher::new(&config.rules)?;
    let mut added = 0;
    for rule in store.list_rules(true).await? {
        if rule.proposal.pattern_type == PatternType::VipSender
            && matcher.add_vip_sender(&rule.proposal.pattern_value)
        {
            added += 1;
        }
    }
    if added > 0 {
        tracing::info!(added, "Merged learned VIP senders");
    }
    Ok(matcher)
}

/// Build the pipeline. `verify` probes the classifier before returning.
async fn pipeline(
    config: &TriageConfig,
    store: &Arc<dyn TriageStore>,
    verify: bool,
) -> anyhow::Result<Arc<DecisionPipeline>> {
    let classifier: Arc<dyn ClassificationService> = if verify {
        create_classifier(&config.classifier)
            .await
            .with_context(|| format!("Classifier unavailable at {}", config.classifier.base_url))?
    } else {
        Arc::new(OllamaClassifier::new(&config.classifier)?)
    };
    let rules = rule_matcher(config, store).await?;
    Ok(Arc::new(DecisionPipeline::new(
        Arc::clone(store),
        rules,
        classifier,
        config,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = TriageConfig::load().context("Failed to load configuration")?;

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.classifier.model);
    eprintln!("   Database: {}", config.database.path.display());

    let store: Arc<dyn TriageStore> = Arc::new(
        LibSqlBackend::new_local(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?,
    );

    match cli.command {
        Command::Scan { rescan } => {
            let source = maildir(&config)?;
            let scanner = Scanner::new(source, pipeline(&config, &store, true).await?);
            let options = ScanOptions {
                rescan,
                ..ScanOptions::from(&config.scanner)
            };
            let report = scanner.scan(options).await?;
            eprintln!("\n✅ Scan complete");
            print_stats(&report.stats);
        }
        Command::Watch => {
            let source = maildir(&config)?;
            let scanner = Arc::new(Scanner::new(source, pipeline(&config, &store, true).await?));
            let (handle, stop) = spawn_scan_loop(
                scanner,
                ScanOptions::from(&config.scanner),
                Duration::from_secs(config.scanner.interval_secs),
            );
            tokio::signal::ctrl_c().await?;
            eprintln!("\nStopping after in-flight messages...");
            stop.store(true, Ordering::Relaxed);
            handle.await?;
        }
        Command::Rescan => {
            let pipeline = pipeline(&config, &store, true).await?;
            let messages = store.find_messages(&MessageFilter::All).await?;
            let report = pipeline
                .rescan(messages, config.scanner.rescan_concurrency)
                .await?;
            eprintln!("\n✅ Rescan complete");
            print_stats(&report.stats);
        }
        Command::Learn {
            activate: Some(id), ..
        } => {
            let rule = PatternMiner::new(Arc::clone(&store)).activate_rule(&id).await?;
            eprintln!("\n✅ Activated: {}", rule.proposal.suggestion());
        }
        Command::Learn { save, activate: None } => {
            let miner = PatternMiner::new(Arc::clone(&store));
            let proposals = miner.propose().await?;
            if proposals.is_empty() {
                eprintln!("\nNo consistent patterns found yet.");
            } else {
                eprintln!("\nSuggested rules:");
                for (i, proposal) in proposals.iter().enumerate() {
                    eprintln!("  {}. {}", i + 1, proposal.suggestion());
                }
            }
            if save {
                let inserted = miner.save_proposals(&proposals).await?;
                eprintln!("\nSaved {inserted} new rule(s) for review.");
                for rule in store.list_rules(false).await?.iter().filter(|r| !r.is_active) {
                    eprintln!("  {} {}", rule.id, rule.proposal.suggestion());
                }
            }
        }
        Command::Calibration => {
            let pipeline = pipeline(&config, &store, false).await?;
            let overall = pipeline.calibrator().overall().await?;
            eprintln!("\n{overall}");
            let totals = store.decision_totals().await?;
            if totals.total > 0 {
                eprintln!(
                    "Reviewer agreement: {}/{} ({:.1}%)",
                    totals.agreed,
                    totals.total,
                    totals.agreed as f64 / totals.total as f64 * 100.0
                );
            }
        }
        Command::Cleanup { dry_run } => {
            let review = Review::new(
                pipeline(&config, &store, false).await?,
                maildir(&config)?,
                config.scanner.rescan_concurrency,
            );
            let report = review.delete_approved(dry_run).await?;
            if dry_run {
                eprintln!("\n{} message(s) would be deleted", report.candidates);
            } else {
                eprintln!(
                    "\n✅ Deleted {} of {} message(s) ({} failed)",
                    report.deleted, report.candidates, report.failed
                );
            }
        }
    }

    Ok(())
}
