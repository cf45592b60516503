//! Single owner of the output sink and the checkpoint.

use std::time::{Duration, Instant};

use chemfill_core::CanonicalRecord;
use chemfill_storage::{CheckpointStore, RecordSink, StorageError};
use tracing::{info, warn};

/// Lower bound on the time-based flush interval.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub every_rows: usize,
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_rows: 5,
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The row was already recorded complete; nothing was appended.
    Duplicate,
}

pub struct ResultWriter {
    sink: Box<dyn RecordSink>,
    checkpoint: CheckpointStore,
    policy: FlushPolicy,
    unflushed: usize,
    last_flush: Instant,
}

impl ResultWriter {
    pub fn new(sink: Box<dyn RecordSink>, checkpoint: CheckpointStore, policy: FlushPolicy) -> Self {
        Self {
            sink,
            checkpoint,
            policy: FlushPolicy {
                every_rows: policy.every_rows.max(1),
                interval: policy.interval.max(MIN_FLUSH_INTERVAL),
            },
            unflushed: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Append `record`, mark its row complete, and flush if a batch boundary
    /// was reached. Any error is fatal for the run.
    pub async fn write(&mut self, record: CanonicalRecord) -> Result<WriteOutcome, StorageError> {
        if self.checkpoint.is_complete(record.index) {
            warn!(row_index = record.index, key = %record.key, "row already recorded, dropping duplicate");
            return Ok(WriteOutcome::Duplicate);
        }
        self.sink.append(&record).await?;
        self.checkpoint.mark_complete(record.index);
        self.unflushed += 1;

        if self.unflushed >= self.policy.every_rows {
            self.flush().await?;
        } else {
            self.flush_if_due().await?;
        }
        Ok(WriteOutcome::Written)
    }

    /// Flush when the interval has elapsed and something is pending.
    pub async fn flush_if_due(&mut self) -> Result<(), StorageError> {
        if self.unflushed > 0 && self.last_flush.elapsed() >= self.policy.interval {
            self.flush().await?;
        }
        Ok(())
    }

    /// Make the output durable first, then the checkpoint, so the checkpoint
    /// never lists a row whose record could be lost.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        self.sink.flush().await?;
        self.checkpoint.persist().await?;
        if self.unflushed > 0 {
            info!(
                rows = self.unflushed,
                completed = self.checkpoint.state().len(),
                last_contiguous = ?self.checkpoint.state().last_contiguous,
                location = %self.checkpoint.location(),
                "checkpoint flushed"
            );
        }
        self.unflushed = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chemfill_core::{CheckpointState, InputRow, RecordStatus};
    use chemfill_storage::CheckpointBackend;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemorySink {
        appended: Arc<Mutex<Vec<usize>>>,
        flushes: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn append(&mut self, record: &CanonicalRecord) -> Result<(), StorageError> {
            self.appended.lock().unwrap().push(record.index);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), StorageError> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemoryBackend {
        saved: Arc<Mutex<Option<CheckpointState>>>,
    }

    #[async_trait]
    impl CheckpointBackend for MemoryBackend {
        async fn load(&self) -> Result<Option<CheckpointState>, StorageError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save(&self, state: &CheckpointState) -> Result<(), StorageError> {
            *self.saved.lock().unwrap() = Some(state.clone());
            Ok(())
        }

        fn location(&self) -> String {
            "memory".into()
        }
    }

    fn record(index: usize) -> CanonicalRecord {
        let row = InputRow::new(index, format!("key-{index}"), None).unwrap();
        let mut record = CanonicalRecord::pending(&row);
        record.status = RecordStatus::Done;
        record
    }

    async fn writer(every_rows: usize) -> (ResultWriter, MemorySink, MemoryBackend) {
        let sink = MemorySink::default();
        let backend = MemoryBackend::default();
        let store = CheckpointStore::load(Box::new(backend.clone())).await.unwrap();
        let policy = FlushPolicy {
            every_rows,
            interval: Duration::from_secs(3600),
        };
        (ResultWriter::new(Box::new(sink.clone()), store, policy), sink, backend)
    }

    #[tokio::test]
    async fn flushes_every_k_rows() {
        let (mut writer, sink, backend) = writer(2).await;
        writer.write(record(0)).await.unwrap();
        assert!(backend.saved.lock().unwrap().is_none());
        writer.write(record(1)).await.unwrap();
        let saved = backend.saved.lock().unwrap().clone().unwrap();
        assert_eq!(saved.completed.len(), 2);
        assert_eq!(saved.last_contiguous, Some(1));
        assert_eq!(*sink.flushes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_not_appended_twice() {
        let (mut writer, sink, _backend) = writer(10).await;
        assert_eq!(writer.write(record(4)).await.unwrap(), WriteOutcome::Written);
        assert_eq!(writer.write(record(4)).await.unwrap(), WriteOutcome::Duplicate);
        assert_eq!(*sink.appended.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_minimum() {
        let backend = MemoryBackend::default();
        let store = CheckpointStore::load(Box::new(backend)).await.unwrap();
        let policy = FlushPolicy {
            every_rows: 0,
            interval: Duration::ZERO,
        };
        let writer = ResultWriter::new(Box::new(MemorySink::default()), store, policy);
        assert_eq!(writer.policy().every_rows, 1);
        assert_eq!(writer.policy().interval, MIN_FLUSH_INTERVAL);
    }

    #[tokio::test]
    async fn final_flush_persists_partial_batch() {
        let (mut writer, _sink, backend) = writer(10).await;
        writer.write(record(2)).await.unwrap();
        writer.flush().await.unwrap();
        let saved = backend.saved.lock().unwrap().clone().unwrap();
        assert!(saved.completed.contains(&2));
        assert_eq!(saved.last_contiguous, None);
    }
}
