//! Durable state (checkpoint + record log) and rate-limited HTTP fetching for chemfill.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod checkpoint;
pub mod http;
pub mod record_log;

pub use checkpoint::{CheckpointBackend, CheckpointStore, FileCheckpoint};
pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use record_log::{
    read_record_log, reconcile_record_log, JsonlRecordLog, LogContents, ReconcileReport,
    RecordSink,
};

pub const CRATE_NAME: &str = "chemfill-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Replace `path` with `bytes` via a synced temp file in the same directory and
/// a rename, so readers observe either the old or the new content.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StorageError::io("creating directory", &parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io("atomically replacing", path, err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        write_atomically(&path, b"first").await.expect("first write");
        write_atomically(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_atomically(&path, b"good").await.expect("write");

        // A directory in place of the target makes the rename fail.
        let blocked = dir.path().join("blocked");
        std::fs::create_dir_all(blocked.join("child")).unwrap();
        let err = write_atomically(&blocked, b"bad").await;
        assert!(err.is_err());

        assert_eq!(std::fs::read(&path).unwrap(), b"good");
    }
}
