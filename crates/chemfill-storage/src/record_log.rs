//! Append-only JSONL log of canonical records.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chemfill_core::{CanonicalRecord, CheckpointState};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use crate::{write_atomically, StorageError};

/// Durable output sink for finished records.
#[async_trait]
pub trait RecordSink: Send {
    async fn append(&mut self, record: &CanonicalRecord) -> Result<(), StorageError>;

    /// Force everything appended so far onto stable storage.
    async fn flush(&mut self) -> Result<(), StorageError>;
}

pub struct JsonlRecordLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlRecordLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io("creating directory", parent, e))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io("opening record log", &path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonlRecordLog {
    async fn append(&mut self, record: &CanonicalRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record).map_err(|source| StorageError::Encode {
            what: "canonical record",
            source,
        })?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| StorageError::io("appending to record log", &self.path, e))
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        self.writer
            .flush()
            .await
            .map_err(|e| StorageError::io("flushing record log", &self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .await
            .map_err(|e| StorageError::io("syncing record log", &self.path, e))
    }
}

#[derive(Debug, Default)]
pub struct LogContents {
    pub records: Vec<CanonicalRecord>,
    /// Lines that failed to decode, typically a tail cut short by a crash.
    pub corrupt_lines: usize,
}

pub async fn read_record_log(path: impl AsRef<Path>) -> Result<LogContents, StorageError> {
    let path = path.as_ref();
    let exists = fs::try_exists(path)
        .await
        .map_err(|e| StorageError::io("checking record log", path, e))?;
    if !exists {
        return Ok(LogContents::default());
    }
    let bytes = fs::read(path)
        .await
        .map_err(|e| StorageError::io("reading record log", path, e))?;

    // Split on raw bytes: a crash can cut the tail inside a multi-byte character.
    let mut contents = LogContents::default();
    for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CanonicalRecord>(line) {
            Ok(record) => contents.records.push(record),
            Err(err) => {
                warn!(path = %path.display(), line = line_no + 1, error = %err, "skipping undecodable record log line");
                contents.corrupt_lines += 1;
            }
        }
    }
    Ok(contents)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub dropped_uncheckpointed: usize,
    pub dropped_duplicates: usize,
    pub dropped_corrupt: usize,
    /// Checkpointed indices with no surviving line in the log.
    pub missing_from_log: usize,
}

impl ReconcileReport {
    pub fn rewrote(&self) -> bool {
        self.dropped_uncheckpointed + self.dropped_duplicates + self.dropped_corrupt > 0
    }
}

/// Make the log agree with the checkpoint before new appends: keep the first
/// line per checkpointed index and drop everything else.
pub async fn reconcile_record_log(
    path: impl AsRef<Path>,
    state: &CheckpointState,
) -> Result<ReconcileReport, StorageError> {
    let path = path.as_ref();
    let contents = read_record_log(path).await?;
    let mut report = ReconcileReport {
        dropped_corrupt: contents.corrupt_lines,
        ..Default::default()
    };

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(contents.records.len());
    for record in contents.records {
        if !state.is_complete(record.index) {
            report.dropped_uncheckpointed += 1;
        } else if !seen.insert(record.index) {
            report.dropped_duplicates += 1;
        } else {
            kept.push(record);
        }
    }
    report.kept = kept.len();
    report.missing_from_log = state
        .completed
        .iter()
        .filter(|index| !seen.contains(*index))
        .count();

    if report.rewrote() {
        let mut bytes = Vec::new();
        for record in &kept {
            serde_json::to_writer(&mut bytes, record).map_err(|source| StorageError::Encode {
                what: "canonical record",
                source,
            })?;
            bytes.push(b'\n');
        }
        write_atomically(path, &bytes).await?;
        info!(
            path = %path.display(),
            kept = report.kept,
            dropped_uncheckpointed = report.dropped_uncheckpointed,
            dropped_duplicates = report.dropped_duplicates,
            dropped_corrupt = report.dropped_corrupt,
            "record log reconciled with checkpoint"
        );
    }
    if report.missing_from_log > 0 {
        warn!(
            path = %path.display(),
            missing = report.missing_from_log,
            "checkpoint lists rows that have no record in the output log"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemfill_core::{InputRow, RecordStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(index: usize) -> CanonicalRecord {
        let row = InputRow::new(index, format!("key-{index}"), None).unwrap();
        let mut record = CanonicalRecord::pending(&row);
        record.status = RecordStatus::Done;
        record
    }

    #[tokio::test]
    async fn appended_records_read_back_in_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let mut log = JsonlRecordLog::open(&path).await.expect("open");
        log.append(&record(1)).await.unwrap();
        log.append(&record(0)).await.unwrap();
        log.flush().await.unwrap();

        let contents = read_record_log(&path).await.expect("read");
        let indices: Vec<usize> = contents.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 0]);
        assert_eq!(contents.corrupt_lines, 0);
    }

    #[tokio::test]
    async fn reopen_appends_instead_of_truncating() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        {
            let mut log = JsonlRecordLog::open(&path).await.expect("open");
            log.append(&record(0)).await.unwrap();
            log.flush().await.unwrap();
        }
        let mut log = JsonlRecordLog::open(&path).await.expect("reopen");
        log.append(&record(1)).await.unwrap();
        log.flush().await.unwrap();

        assert_eq!(read_record_log(&path).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_drops_uncheckpointed_duplicate_and_truncated_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let mut text = String::new();
        for index in [0usize, 1, 0, 2] {
            text.push_str(&serde_json::to_string(&record(index)).unwrap());
            text.push('\n');
        }
        text.push_str("{\"index\":3,\"ke");
        std::fs::write(&path, text).unwrap();

        let state = CheckpointState::from_completed([0, 1, 5].into_iter().collect(), Utc::now());
        let report = reconcile_record_log(&path, &state).await.expect("reconcile");

        assert_eq!(
            report,
            ReconcileReport {
                kept: 2,
                dropped_uncheckpointed: 1,
                dropped_duplicates: 1,
                dropped_corrupt: 1,
                missing_from_log: 1,
            }
        );
        let contents = read_record_log(&path).await.unwrap();
        let indices: Vec<usize> = contents.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(contents.corrupt_lines, 0);
    }

    #[tokio::test]
    async fn tail_cut_inside_a_multibyte_character_is_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let mut stored = record(1);
        stored.hint_name = Some("Kept at 2-8°C".into());
        let mut bytes = serde_json::to_vec(&record(0)).unwrap();
        bytes.push(b'\n');
        let tail = serde_json::to_vec(&stored).unwrap();
        let degree = tail
            .windows(2)
            .position(|w| w == "°".as_bytes())
            .expect("degree sign");
        bytes.extend_from_slice(&tail[..=degree]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(std::str::from_utf8(&bytes).is_err());

        let state = CheckpointState::from_completed([0].into_iter().collect(), Utc::now());
        let report = reconcile_record_log(&path, &state).await.expect("reconcile");
        assert_eq!(report.kept, 1);
        assert_eq!(report.dropped_corrupt, 1);

        let contents = read_record_log(&path).await.unwrap();
        assert_eq!(contents.records.len(), 1);
        assert_eq!(contents.corrupt_lines, 0);
    }

    #[tokio::test]
    async fn reconcile_of_missing_log_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("absent.jsonl");
        let state = CheckpointState::empty(Utc::now());
        let report = reconcile_record_log(&path, &state).await.expect("reconcile");
        assert_eq!(report, ReconcileReport::default());
        assert!(!path.exists());
    }
}
