//! Bounded worker pool feeding a single result writer.

use std::sync::Arc;

use chemfill_core::{CanonicalRecord, InputRow, RecordStatus};
use chemfill_storage::StorageError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::RuleSet;
use crate::config::MAX_CONCURRENCY;
use crate::error::PipelineError;
use crate::merge::{merge, PrecedenceTable};
use crate::resolver::FallbackResolver;
use crate::writer::{ResultWriter, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_rows: usize,
    pub rejected: usize,
    pub already_complete: usize,
    pub skipped_by_start_index: usize,
    pub not_dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, total_rows: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            total_rows,
            rejected: 0,
            already_complete: 0,
            skipped_by_start_index: 0,
            not_dispatched: 0,
            completed: 0,
            failed: 0,
            cancelled: false,
        }
    }

    pub fn skipped(&self) -> usize {
        self.already_complete + self.skipped_by_start_index + self.not_dispatched
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WriterTally {
    done: usize,
    failed: usize,
}

/// Everything a worker needs, shared read-only across workers.
#[derive(Clone)]
pub struct Pipeline {
    resolver: Arc<FallbackResolver>,
    precedence: Arc<PrecedenceTable>,
    rules: Arc<RuleSet>,
    concurrency: usize,
    start_index: Option<usize>,
}

impl Pipeline {
    pub fn new(resolver: FallbackResolver, precedence: PrecedenceTable, rules: RuleSet) -> Self {
        Self {
            resolver: Arc::new(resolver),
            precedence: Arc::new(precedence),
            rules: Arc::new(rules),
            concurrency: 5,
            start_index: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Rows below `start_index` are left alone for this run.
    pub fn with_start_index(mut self, start_index: Option<usize>) -> Self {
        self.start_index = start_index;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Resolve, merge and classify one row. Never fails; a row no ranked
    /// source found comes back `Failed` without a category.
    pub async fn process_row(&self, row: &InputRow) -> CanonicalRecord {
        let span = info_span!("row", row_index = row.index, key = %row.key);
        async {
            info!("row started");
            let results = self.resolver.resolve(row).await;
            let mut record = merge(row, &results, &self.precedence);
            if record.status == RecordStatus::Done {
                let category = self.rules.classify_record(&record);
                info!(status = "done", category = %category, fields = record.fields.len(), "row completed");
                record.category = Some(category);
            } else {
                warn!(status = "failed", sources = results.len(), "row permanently failed");
            }
            record
        }
        .instrument(span)
        .await
    }

    /// Process every row that is neither checkpointed nor below the start
    /// index. Returns once all dispatched rows are written and flushed, or
    /// with `PipelineError::Fatal` if the writer could not persist.
    pub async fn run(
        &self,
        rows: &[InputRow],
        writer: ResultWriter,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new(Uuid::new_v4(), rows.len());
        let span = info_span!("pipeline_run", run_id = %summary.run_id);
        let stop = cancel.child_token();

        let mut pending = Vec::new();
        for row in rows {
            if writer.checkpoint().is_complete(row.index) {
                summary.already_complete += 1;
            } else if self.start_index.is_some_and(|start| row.index < start) {
                summary.skipped_by_start_index += 1;
            } else {
                pending.push(row.clone());
            }
        }
        info!(
            parent: &span,
            pending = pending.len(),
            already_complete = summary.already_complete,
            skipped_by_start_index = summary.skipped_by_start_index,
            concurrency = self.concurrency,
            "dispatching rows"
        );

        let (tx, rx) = mpsc::channel::<CanonicalRecord>(self.concurrency * 2);
        let writer_task = tokio::spawn(drain_results(writer, rx, stop.clone()).instrument(span.clone()));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut queue = pending.into_iter();
        while let Some(row) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.not_dispatched = 1 + queue.len();
                info!(parent: &span, not_dispatched = summary.not_dispatched, "cancellation observed, dispatch stopped");
                break;
            };

            let worker = self.clone();
            let tx = tx.clone();
            workers.spawn(
                async move {
                    let _permit = permit;
                    let record = worker.process_row(&row).await;
                    if tx.send(record).await.is_err() {
                        debug!(row_index = row.index, "writer closed, record discarded");
                    }
                }
                .instrument(span.clone()),
            );
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(parent: &span, error = %err, "worker task panicked");
            }
        }

        let (tally, outcome) = writer_task
            .await
            .map_err(|err| PipelineError::Writer(err.to_string()))?;
        outcome?;

        summary.completed = tally.done;
        summary.failed = tally.failed;
        summary.cancelled = cancel.is_cancelled();
        summary.finished_at = Utc::now();
        info!(
            parent: &span,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped(),
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }
}

/// Writer loop: the only place records are appended or rows marked complete.
async fn drain_results(
    mut writer: ResultWriter,
    mut rx: mpsc::Receiver<CanonicalRecord>,
    stop: CancellationToken,
) -> (WriterTally, Result<(), StorageError>) {
    let mut tally = WriterTally::default();
    let mut ticker = tokio::time::interval(writer.policy().interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let outcome = loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    let status = record.status;
                    match writer.write(record).await {
                        Ok(WriteOutcome::Written) => match status {
                            RecordStatus::Done => tally.done += 1,
                            _ => tally.failed += 1,
                        },
                        Ok(WriteOutcome::Duplicate) => {}
                        Err(err) => break Err(err),
                    }
                }
                None => break writer.flush().await,
            },
            _ = ticker.tick() => {
                if let Err(err) = writer.flush_if_due().await {
                    break Err(err);
                }
            }
        }
    };

    if let Err(err) = &outcome {
        error!(error = %err, "result writer failed, stopping dispatch");
        stop.cancel();
    }
    (tally, outcome)
}
