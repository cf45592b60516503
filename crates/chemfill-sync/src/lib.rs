//! Enrichment pipeline: resolve rows against sources, merge, classify, and
//! record results durably so interrupted runs resume where they stopped.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chemfill_adapters::client_for_source;
use chemfill_core::CheckpointState;
use chemfill_storage::{reconcile_record_log, CheckpointStore, HttpFetcher, JsonlRecordLog};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod classify;
pub mod config;
pub mod error;
pub mod export;
pub mod input;
pub mod merge;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod writer;

pub use classify::{parse_formula, ClassifierInput, Predicate, Rule, RuleSet, UNCATEGORIZED};
pub use config::{ConfigOverrides, InputColumns, OutputDefaults, PipelineConfig, SourceConfig};
pub use error::PipelineError;
pub use export::{export_record_log, render_rows, ExportRow, ExportSummary, EXPORT_COLUMNS};
pub use input::{read_input, read_input_csv, InputTable};
pub use merge::{merge, PrecedenceTable};
pub use resolver::{FallbackResolver, ResolveMode};
pub use retry::{BackoffPolicy, RetryConfig, RetryController, RetryState, Sleeper, TokioSleeper};
pub use scheduler::{Pipeline, RunSummary};
pub use writer::{FlushPolicy, ResultWriter, WriteOutcome};

pub const CRATE_NAME: &str = "chemfill-sync";

/// Source clients, retry policy and rules as described by `config`.
pub fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let clients = config
        .enabled_sources()
        .map(|source| {
            client_for_source(&source.client_spec(), http.clone())
                .with_context(|| format!("building client for source {}", source.source_id))
        })
        .collect::<Result<Vec<_>>>()?;

    let retry = RetryController::new(BackoffPolicy::from(&config.retry));
    let resolver = FallbackResolver::new(clients, retry, config.resolve_mode);
    info!(
        sources = ?resolver.source_ids().collect::<Vec<_>>(),
        mode = ?config.resolve_mode,
        "source order resolved"
    );
    let rules = match &config.rules_path {
        Some(path) => RuleSet::from_path(path)?,
        None => RuleSet::builtin(),
    };

    Ok(Pipeline::new(resolver, config.active_precedence(), rules)
        .with_concurrency(config.effective_concurrency())
        .with_start_index(config.start_index))
}

/// One full run: read input, reconcile durable state, process pending rows,
/// then export if an export path is configured.
pub async fn run_from_config(config: &PipelineConfig, cancel: CancellationToken) -> Result<RunSummary> {
    config.validate()?;
    let input = read_input_csv(&config.input_path, &config.input_columns)?;
    info!(
        input = %config.input_path.display(),
        rows = input.rows.len(),
        rejected = input.rejected.len(),
        "input loaded"
    );

    let checkpoint = CheckpointStore::open_file(config.checkpoint_path.as_path())
        .await
        .with_context(|| format!("loading checkpoint {}", config.checkpoint_path.display()))?;
    reconcile_record_log(&config.output_path, checkpoint.state())
        .await
        .with_context(|| format!("reconciling {}", config.output_path.display()))?;
    let sink = JsonlRecordLog::open(config.output_path.as_path())
        .await
        .with_context(|| format!("opening {}", config.output_path.display()))?;
    let writer = ResultWriter::new(Box::new(sink), checkpoint, config.flush_policy());

    let pipeline = build_pipeline(config)?;
    let mut summary = pipeline.run(&input.rows, writer, cancel).await?;
    summary.total_rows = input.total_rows;
    summary.rejected = input.rejected.len();

    if config.export_path.is_some() || config.parquet_dir.is_some() {
        export_from_config(config).await?;
    }
    Ok(summary)
}

pub async fn export_from_config(config: &PipelineConfig) -> Result<ExportSummary> {
    if config.export_path.is_none() && config.parquet_dir.is_none() {
        bail!("nothing to export: set export_path or parquet_dir");
    }
    export_record_log(
        &config.output_path,
        config.export_path.as_deref(),
        config.parquet_dir.as_deref(),
        &config.output_defaults,
    )
    .await
}

pub async fn checkpoint_status(config: &PipelineConfig) -> Result<CheckpointState> {
    let store = CheckpointStore::open_file(config.checkpoint_path.as_path())
        .await
        .with_context(|| format!("loading checkpoint {}", config.checkpoint_path.display()))?;
    Ok(store.snapshot())
}
