use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use amews::alerts::{AlertFilter, AlertStatus, Feedback, FeedbackInput, Page};
use amews::config::EngineConfig;
use amews::detect::{AnalysisOutcome, Severity};
use amews::model::{EntityType, TimeWindow};
use amews::services::Services;

#[derive(Parser)]
#[command(
    name = "amews",
    about = "Aadhaar misuse early-warning risk engine",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $AMEWS_CONFIG, then /etc/amews/amews.toml)
    #[arg(long, global = true, env = "AMEWS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduled learning, retraining and sweeps)
    Serve {
        /// Bind address, overriding `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Score one entity over a window
    Analyze {
        /// DEVICE, REGION or SERVICE_PROVIDER
        #[arg(long)]
        entity_type: String,

        /// Anonymized entity id
        #[arg(long)]
        entity_id: String,

        /// Window start (RFC 3339); defaults to `alerts.default_window_hours` before the end
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Window end (RFC 3339); defaults to now
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Show the system mode and per-context learning progress
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Query and manage alerts
    Alerts {
        #[command(subcommand)]
        action: AlertsAction,
    },

    /// Load anonymized authentication events from a JSON-lines file
    Ingest {
        /// Input file, one event per line
        path: PathBuf,
    },

    /// Rebuild baselines from the event store
    Learn,

    /// Retrain the anomaly model now
    Train,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum AlertsAction {
    /// List alerts, newest first
    List {
        #[arg(long)]
        status: Option<AlertStatus>,
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long, default_value = "50")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one alert as JSON
    Show { id: String },

    /// Acknowledge an active alert
    Ack {
        id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Resolve an alert
    Resolve {
        id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Attach analyst feedback to an open alert
    Feedback {
        id: String,
        /// FALSE_POSITIVE, CONFIRMED_THREAT or PARTIALLY_RELEVANT
        #[arg(long)]
        verdict: Feedback,
        #[arg(long)]
        confidence: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    // Logs go to stderr so command output stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting AMEWS daemon");
            amews::serve(config).await?;
        }
        Commands::Analyze {
            entity_type,
            entity_id,
            from,
            to,
        } => {
            let entity_type: EntityType = entity_type.parse()?;
            let window = match (from, to) {
                (None, None) => None,
                (from, to) => {
                    let end = to.unwrap_or_else(Utc::now);
                    let start = from.unwrap_or(end - Duration::hours(config.alerts.default_window_hours));
                    Some(TimeWindow::new(start, end)?)
                }
            };
            let services = Services::open(config).await?;
            services.warm_up(Utc::now()).await?;
            let outcome = services.engine.analyze(entity_type, &entity_id, window).await?;
            if let AnalysisOutcome::InsufficientBaseline(p) = &outcome {
                tracing::info!(completion = p.completion, "baseline still learning for this context");
            }
            print_json(&outcome)?;
        }
        Commands::Status { json } => {
            let services = Services::open(config).await?;
            let (_, status) = services.warm_up(Utc::now()).await?;
            let progress = services.store.progress_all(Utc::now());
            if json {
                print_json(&serde_json::json!({ "mode": status, "contexts": progress }))?;
            } else {
                println!("\nAMEWS System Status");
                println!("Mode:       {}", status.mode.as_str());
                println!("Completion: {:.1}%", status.completion_percentage);
                println!("Contexts:   {}/{} ready", status.contexts_ready, status.contexts_tracked);
                if !progress.is_empty() {
                    println!("\n{:<40} | {:>8} | {:>9}", "Context", "Samples", "Complete");
                    println!("{:-<40}-|-{:->8}-|-{:->9}", "", "", "");
                    for p in &progress {
                        let key = p.context_key.as_ref().map(|k| k.to_string()).unwrap_or_default();
                        println!("{:<40} | {:>8} | {:>8.1}%", key, p.sample_count, p.completion);
                    }
                }
                println!();
            }
        }
        Commands::Alerts { action } => {
            let services = Services::open(config).await?;
            let alerts = &services.alerts;
            let now = Utc::now();
            match action {
                AlertsAction::List {
                    status,
                    severity,
                    limit,
                    offset,
                } => {
                    let filter = AlertFilter {
                        status,
                        severity,
                        alert_type: None,
                    };
                    let page = alerts.list(filter, Page::new(limit, offset)).await?;
                    if page.alerts.is_empty() {
                        println!("No alerts found.");
                    } else {
                        println!(
                            "{:<12} | {:<8} | {:<12} | {:<26} | {:>6} | Entity",
                            "ID", "Severity", "Status", "Type", "Score"
                        );
                        println!("{:-<12}-|-{:-<8}-|-{:-<12}-|-{:-<26}-|-{:->6}-|-{:-<20}", "", "", "", "", "", "");
                        for a in &page.alerts {
                            println!(
                                "{:<12} | {:<8} | {:<12} | {:<26} | {:>6.2} | {}",
                                a.id,
                                a.score.severity.as_str(),
                                a.status.as_str(),
                                a.alert_type.as_str(),
                                a.score.composite,
                                a.entity_id
                            );
                        }
                        println!("({} of {} shown)", page.alerts.len(), page.total);
                    }
                }
                AlertsAction::Show { id } => {
                    print_json(&alerts.get(&id).await?)?;
                }
                AlertsAction::Ack { id, actor } => {
                    let alert = alerts.transition(&id, AlertStatus::Acknowledged, &actor, now).await?;
                    println!("Alert {} acknowledged.", alert.id);
                }
                AlertsAction::Resolve { id, actor } => {
                    let alert = alerts.transition(&id, AlertStatus::Resolved, &actor, now).await?;
                    println!("Alert {} resolved.", alert.id);
                }
                AlertsAction::Feedback {
                    id,
                    verdict,
                    confidence,
                    notes,
                    actor,
                } => {
                    let input = FeedbackInput {
                        feedback: verdict,
                        analyst_confidence: confidence,
                        notes,
                        analyst: actor,
                    };
                    let alert = alerts.record_feedback(&id, input, now).await?;
                    println!("Feedback {} recorded for alert {}.", verdict.as_str(), alert.id);
                }
            }
        }
        Commands::Ingest { path } => {
            let services = Services::open(config).await?;
            let report = services
                .source
                .ingest_jsonl(&path)
                .with_context(|| format!("failed to ingest {}", path.display()))?;
            println!("Ingested {} events ({} rejected).", report.inserted, report.rejected);
        }
        Commands::Learn => {
            let services = Services::open(config).await?;
            let (report, status) = services.warm_up(Utc::now()).await?;
            println!(
                "Folded {} samples into {} contexts ({} tracked). Mode: {} ({:.1}%).",
                report.samples_folded,
                report.contexts_updated,
                report.contexts_tracked,
                status.mode.as_str(),
                status.completion_percentage
            );
        }
        Commands::Train => {
            let services = Services::open(config).await?;
            services.warm_up(Utc::now()).await?;
            let report = services.trainer.train(Utc::now()).await?;
            print_json(&report)?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
