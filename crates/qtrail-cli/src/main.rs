use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use qtrail_core::{OutputFormat, PartitionKey, ProcessingWindow, WindowOutcome};
use qtrail_sync::{AuditConfig, AuditPipeline};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "qtrail")]
#[command(about = "Hourly Athena query-execution audit from CloudTrail")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan the configured days and dispatch or run every hour.
    Trigger {
        /// Pretend today is this UTC date (YYYY-MM-DD).
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Print the windows the trigger would process.
    Plan {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Process one hour window, e.g. `2025-08-28T13`.
    Window {
        key: PartitionKey,
        #[arg(long)]
        format: Option<OutputFormat>,
    },
    /// Run a fan-out payload, passed inline or on stdin.
    Invoke { payload: Option<String> },
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

fn check_outcomes(outcomes: &[WindowOutcome]) -> Result<()> {
    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
    if failed > 0 {
        bail!("{failed} of {} window(s) failed", outcomes.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = AuditConfig::resolve_from_env().await?;

    match cli.command.unwrap_or(Commands::Trigger { today: None }) {
        Commands::Trigger { today } => {
            let pipeline = AuditPipeline::new(config)?;
            let summary = pipeline
                .run_trigger(today.unwrap_or_else(|| Utc::now().date_naive()))
                .await?;
            print_json(&summary)?;
            check_outcomes(&summary.outcomes)?;
        }
        Commands::Plan { today } => {
            let pipeline = AuditPipeline::new(config)?;
            let windows = pipeline.plan(today.unwrap_or_else(|| Utc::now().date_naive()))?;
            for window in &windows {
                println!("{}", window.artifact_key(&pipeline.config().report_prefix));
            }
        }
        Commands::Window { key, format } => {
            let window = ProcessingWindow::new(key, format.unwrap_or(config.output_format));
            let pipeline = AuditPipeline::new(config)?;
            let outcome = pipeline.run_window(window).await;
            print_json(&outcome)?;
            check_outcomes(std::slice::from_ref(&outcome))?;
        }
        Commands::Invoke { payload } => {
            let raw = match payload {
                Some(inline) => inline,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut buf)
                        .await
                        .context("reading payload from stdin")?;
                    buf
                }
            };
            let payload: serde_json::Value = serde_json::from_str(&raw).context("payload is not JSON")?;
            let pipeline = AuditPipeline::new(config)?;
            let outcomes = pipeline.invoke(&payload).await?;
            print_json(&outcomes)?;
            check_outcomes(&outcomes)?;
        }
    }

    Ok(())
}
