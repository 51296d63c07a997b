//! Primary attendance backend: a document store behind hard deadlines.
//!
//! The driver is abstracted as [`DocumentStore`] (insert one document, find
//! with filter sorted newest first, ping). [`PrimaryBackend`] adds the
//! reachability probe and per-call timeouts. [`SqliteDocumentStore`] is the
//! bundled driver: one JSON document per row, with the filterable fields
//! broken out into indexed columns.

use crate::backend::{with_deadline, BackendError, StorageBackend};
use crate::record::{AttendanceQuery, AttendanceRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_rusqlite::Connection;

const BACKEND_NAME: &str = "primary";

/// Minimal document-database driver surface the ledger needs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), BackendError>;

    /// Insert one document; a duplicate `record_id` is ignored.
    async fn insert_one(&self, record: &AttendanceRecord) -> Result<(), BackendError>;

    /// Server-side filter, sorted by `created_at` descending.
    async fn find(&self, filter: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError>;
}

/// Deadline-bounded wrapper around the primary document store.
///
/// Reachability is probed with a short timeout on first use and again after
/// any failed call, so an outage is detected quickly and a recovery is
/// picked up on the next call.
pub struct PrimaryBackend {
    store: Box<dyn DocumentStore>,
    op_timeout: Duration,
    probe_timeout: Duration,
    reachable: AtomicBool,
}

impl PrimaryBackend {
    pub fn new(store: impl DocumentStore + 'static, op_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            store: Box::new(store),
            op_timeout,
            probe_timeout,
            reachable: AtomicBool::new(false),
        }
    }

    /// Ping the store under the probe deadline and remember the outcome.
    pub async fn probe(&self) -> Result<(), BackendError> {
        let result = with_deadline(BACKEND_NAME, self.probe_timeout, self.store.ping()).await;
        let was = self.reachable.swap(result.is_ok(), Ordering::AcqRel);
        match (&result, was) {
            (Ok(()), false) => tracing::info!("primary attendance store reachable"),
            (Err(e), true) => tracing::warn!(error = %e, "primary attendance store lost"),
            _ => {}
        }
        result
    }

    async fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.reachable.load(Ordering::Acquire) {
            return Ok(());
        }
        self.probe().await
    }

    fn note<T>(&self, result: Result<T, BackendError>) -> Result<T, BackendError> {
        if result.is_err() {
            self.reachable.store(false, Ordering::Release);
        }
        result
    }
}

#[async_trait]
impl StorageBackend for PrimaryBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
        self.ensure_reachable().await?;
        let result = with_deadline(BACKEND_NAME, self.op_timeout, self.store.insert_one(record)).await;
        self.note(result)
    }

    async fn query(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError> {
        self.ensure_reachable().await?;
        let result = with_deadline(BACKEND_NAME, self.op_timeout, self.store.find(query)).await;
        self.note(result)
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.probe().await
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance_records (
    record_id   TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    group_id    TEXT,
    created_at  TEXT NOT NULL,
    document    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_created_at ON attendance_records (created_at);
CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance_records (identity_id, created_at);
";

/// SQLite-backed document collection. The connection is opened lazily on
/// first use so an unavailable database surfaces as a probe failure.
pub struct SqliteDocumentStore {
    path: PathBuf,
    conn: OnceCell<Connection>,
}

impl SqliteDocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<&Connection, BackendError> {
        self.conn
            .get_or_try_init(|| async {
                let conn = Connection::open(&self.path).await.map_err(sqlite_err)?;
                conn.call(|c| {
                    c.execute_batch(SCHEMA)?;
                    Ok(())
                })
                .await
                .map_err(sqlite_err)?;
                tracing::info!(path = %self.path.display(), "opened primary attendance database");
                Ok::<_, BackendError>(conn)
            })
            .await
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ping(&self) -> Result<(), BackendError> {
        self.connection()
            .await?
            .call(|c| {
                c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await
            .map_err(sqlite_err)
    }

    async fn insert_one(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
        let document = serde_json::to_string(record)?;
        let record_id = record.record_id.to_string();
        let identity_id = record.identity_id.clone();
        let group_id = record.group_id.clone();
        let created_at = sort_key(&record.created_at);

        self.connection()
            .await?
            .call(move |c| {
                c.execute(
                    "INSERT OR IGNORE INTO attendance_records
                         (record_id, identity_id, group_id, created_at, document)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![record_id, identity_id, group_id, created_at, document],
                )?;
                Ok(())
            })
            .await
            .map_err(sqlite_err)
    }

    async fn find(&self, filter: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError> {
        let mut sql = String::from("SELECT document FROM attendance_records WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();

        let mut push = |clause: &str, value: String| {
            args.push(value);
            sql.push_str(&format!(" AND {clause} ?{}", args.len()));
        };
        if let Some(id) = &filter.identity_id {
            push("identity_id =", id.clone());
        }
        if let Some(group) = &filter.group_id {
            push("group_id =", group.clone());
        }
        if let Some(from) = &filter.from {
            push("created_at >=", sort_key(from));
        }
        if let Some(to) = &filter.to {
            push("created_at <=", sort_key(to));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let documents: Vec<String> = self
            .connection()
            .await?
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let docs = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(docs)
            })
            .await
            .map_err(sqlite_err)?;

        documents
            .iter()
            .map(|d| serde_json::from_str(d).map_err(BackendError::from))
            .collect()
    }
}

/// Fixed-width RFC 3339 (UTC, nanoseconds) so text order equals time order.
fn sort_key(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn sqlite_err(e: tokio_rusqlite::Error) -> BackendError {
    BackendError::Sqlite(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AttendanceEvent;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn record(id: &str, group: &str, created: DateTime<Utc>) -> AttendanceRecord {
        AttendanceEvent::new(id, 90.0)
            .with_group(Some(group.into()))
            .at(Some(created))
            .stamp(created)
    }

    /// Store whose availability can be flipped from the test.
    #[derive(Clone, Default)]
    struct Switchable {
        up: Arc<AtomicBool>,
        hang: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DocumentStore for Switchable {
        async fn ping(&self) -> Result<(), BackendError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::Unreachable("connection refused".into()))
            }
        }

        async fn insert_one(&self, _record: &AttendanceRecord) -> Result<(), BackendError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.ping().await
        }

        async fn find(&self, _filter: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError> {
            self.ping().await.map(|_| Vec::new())
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = SqliteDocumentStore::new(dir.path().join("primary.db"));

        store.insert_one(&record("S1", "CS101", at(8, 0))).await.unwrap();
        store.insert_one(&record("S2", "CS101", at(9, 0))).await.unwrap();
        store.insert_one(&record("S1", "MA201", at(10, 0))).await.unwrap();

        let all = store.find(&AttendanceQuery::all()).await.unwrap();
        let times: Vec<_> = all.iter().map(|r| r.created_at).collect();
        assert_eq!(times, vec![at(10, 0), at(9, 0), at(8, 0)]);

        let s1 = store.find(&AttendanceQuery::all().identity("S1")).await.unwrap();
        assert_eq!(s1.len(), 2);

        let cs = store
            .find(&AttendanceQuery::all().group("CS101").between(Some(at(8, 30)), Some(at(9, 0))))
            .await
            .unwrap();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].identity_id, "S2");
    }

    #[tokio::test]
    async fn test_sqlite_store_ignores_duplicate_record_id() {
        let dir = TempDir::new().unwrap();
        let store = SqliteDocumentStore::new(dir.path().join("primary.db"));
        let r = record("S1", "CS101", at(8, 0));

        store.insert_one(&r).await.unwrap();
        store.insert_one(&r).await.unwrap();
        assert_eq!(store.find(&AttendanceQuery::all()).await.unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn test_primary_unreachable_fails_fast() {
        let store = Switchable::default();
        let primary = PrimaryBackend::new(store, Duration::from_secs(2), Duration::from_millis(100));

        let err = primary.insert(&record("S1", "CS101", at(8, 0))).await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_primary_recovers_after_outage() {
        let store = Switchable::default();
        let primary = PrimaryBackend::new(store.clone(), Duration::from_secs(2), Duration::from_millis(100));

        assert!(primary.query(&AttendanceQuery::all()).await.is_err());
        store.up.store(true, Ordering::SeqCst);
        assert!(primary.query(&AttendanceQuery::all()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_hung_insert_hits_deadline() {
        let store = Switchable::default();
        store.up.store(true, Ordering::SeqCst);
        store.hang.store(true, Ordering::SeqCst);
        let primary = PrimaryBackend::new(store.clone(), Duration::from_secs(2), Duration::from_millis(100));

        let err = primary.insert(&record("S1", "CS101", at(8, 0))).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { backend: "primary", .. }));

        // The failure forces a fresh probe on the next call.
        store.up.store(false, Ordering::SeqCst);
        assert!(matches!(
            primary.query(&AttendanceQuery::all()).await,
            Err(BackendError::Unreachable(_))
        ));
    }
}
