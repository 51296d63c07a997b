//! Local JSON-file attendance backend.
//!
//! The whole ledger is one JSON array of [`AttendanceRecord`]s. Every insert
//! rewrites it through a uniquely named temp file and a rename, so a crash
//! mid-write leaves either the old or the new array on disk.
//!
//! Each read-modify-write runs as one blocking task under a process-wide
//! lock. A deadline stops the caller waiting, not the task: a timed-out
//! insert may still land, and re-inserting the same `record_id` is a no-op.

use crate::backend::{with_deadline, BackendError, StorageBackend};
use crate::record::{sort_newest_first, AttendanceQuery, AttendanceRecord};
use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

const BACKEND_NAME: &str = "fallback";

pub struct FallbackBackend {
    file: Arc<RecordFile>,
    timeout: Duration,
}

impl FallbackBackend {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            file: Arc::new(RecordFile {
                path: path.into(),
                lock: Mutex::new(()),
            }),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Run `op` on the blocking pool under the backend deadline.
    async fn run<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&RecordFile) -> Result<T, BackendError> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        with_deadline(BACKEND_NAME, self.timeout, async move {
            tokio::task::spawn_blocking(move || op(&file))
                .await
                .map_err(|e| BackendError::Io(std::io::Error::other(e)))?
        })
        .await
    }
}

struct RecordFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RecordFile {
    fn read_all(&self) -> Result<Vec<AttendanceRecord>, BackendError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        // A corrupt file is reported, never silently replaced.
        serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    fn write_all(&self, records: &[AttendanceRecord]) -> Result<(), BackendError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let bytes = serde_json::to_vec_pretty(records)?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| {
                BackendError::Io(std::io::Error::other("fallback path has no file name"))
            })?
            .to_string_lossy();
        let tmp = dir.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4()));

        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| std::fs::rename(&tmp, &self.path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read_all()?;
        if records.iter().any(|r| r.record_id == record.record_id) {
            tracing::debug!(record_id = %record.record_id, "record already stored");
            return Ok(());
        }
        records.push(record.clone());
        self.write_all(&records)
    }

    fn query(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AttendanceRecord> = self
            .read_all()?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        // Later appends come first among equal timestamps.
        out.reverse();
        sort_newest_first(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl StorageBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
        let record = record.clone();
        self.run(move |file| file.insert(&record)).await
    }

    async fn query(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError> {
        let query = query.clone();
        self.run(move |file| file.query(&query)).await
    }
}
