use std::path::PathBuf;

use anyhow::Result;
use chemfill_sync::{checkpoint_status, export_from_config, run_from_config, ConfigOverrides, PipelineConfig};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "chemfill")]
#[command(about = "Fill in chemical catalogue rows from external sources")]
struct Cli {
    /// Pipeline configuration (YAML).
    #[arg(short, long, global = true, env = "CHEMFILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct OverrideArgs {
    /// Input CSV.
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    /// JSONL record log.
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,
    /// Rendered catalogue CSV.
    #[arg(long, global = true)]
    export: Option<PathBuf>,
    #[arg(long, global = true)]
    parquet_dir: Option<PathBuf>,
    /// Leave rows below this index untouched.
    #[arg(long, global = true)]
    start_index: Option<usize>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[arg(long, global = true)]
    max_attempts: Option<u32>,
    #[arg(long, global = true)]
    base_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    max_delay_ms: Option<u64>,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            input_path: args.input,
            output_path: args.output,
            checkpoint_path: args.checkpoint,
            export_path: args.export,
            parquet_dir: args.parquet_dir,
            start_index: args.start_index,
            concurrency: args.concurrency,
            max_attempts: args.max_attempts,
            base_delay_ms: args.base_delay_ms,
            max_delay_ms: args.max_delay_ms,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process every pending row (default).
    Run,
    /// Render the record log to CSV and/or Parquet.
    Export,
    /// Show checkpoint progress.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let overrides = ConfigOverrides::from(cli.overrides);
    let config = PipelineConfig::load(cli.config.as_deref(), &overrides)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight rows");
                    on_interrupt.cancel();
                }
            });

            let summary = run_from_config(&config, cancel).await?;
            println!(
                "run complete: run_id={} rows={} completed={} failed={} skipped={} rejected={}",
                summary.run_id,
                summary.total_rows,
                summary.completed,
                summary.failed,
                summary.skipped(),
                summary.rejected
            );
            if summary.failed > 0 {
                eprintln!(
                    "warning: {} row(s) permanently failed; they are recorded with status failed in {}",
                    summary.failed,
                    config.output_path.display()
                );
            }
            if summary.rejected > 0 {
                eprintln!("warning: {} input row(s) rejected before dispatch", summary.rejected);
            }
            if summary.cancelled {
                eprintln!(
                    "interrupted: {} row(s) not dispatched; run again to resume",
                    summary.not_dispatched
                );
            }
        }
        Commands::Export => {
            let summary = export_from_config(&config).await?;
            println!(
                "export complete: rows={} done={} failed={}",
                summary.rows, summary.done, summary.failed
            );
            if let Some(path) = summary.csv_path {
                println!("csv: {}", path.display());
            }
            if let Some(path) = summary.manifest_path {
                println!("parquet manifest: {}", path.display());
            }
        }
        Commands::Status => {
            let state = checkpoint_status(&config).await?;
            println!("checkpoint: {}", config.checkpoint_path.display());
            println!("completed rows: {}", state.len());
            match state.last_contiguous {
                Some(last) => println!("last contiguous index: {last}"),
                None => println!("last contiguous index: none"),
            }
            println!("updated at: {}", state.updated_at.to_rfc3339());
        }
    }

    Ok(())
}
