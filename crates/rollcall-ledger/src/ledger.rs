//! Failover attendance ledger.
//!
//! Every call tries the primary backend first and falls back to the local
//! file on any primary error. Availability is re-evaluated per call, so a
//! recovered primary is used again immediately. Records written to the
//! fallback during an outage stay there.

use crate::backend::{BackendError, StorageBackend};
use crate::fallback::FallbackBackend;
use crate::primary::{PrimaryBackend, SqliteDocumentStore};
use crate::record::{AttendanceEvent, AttendanceQuery, AttendanceRecord};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no attendance backend available (primary: {primary}; fallback: {fallback})")]
    BackendUnavailable { primary: String, fallback: String },
    #[error("invalid attendance record: {0}")]
    InvalidRecord(String),
}

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Primary,
    Fallback,
}

/// Outcome of a successful insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    pub record: AttendanceRecord,
    pub backend: BackendKind,
}

/// Filtered records plus a per-identity count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub total_records: usize,
    pub records: Vec<AttendanceRecord>,
    pub by_identity: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Primary database. `None` = fallback only.
    pub primary_db_path: Option<PathBuf>,
    pub fallback_path: PathBuf,
    pub backend_timeout: Duration,
    pub probe_timeout: Duration,
}

pub struct FailoverLedger {
    primary: Option<Box<dyn StorageBackend>>,
    fallback: Box<dyn StorageBackend>,
}

impl FailoverLedger {
    pub fn new(primary: Option<Box<dyn StorageBackend>>, fallback: Box<dyn StorageBackend>) -> Self {
        Self { primary, fallback }
    }

    /// Build the standard ledger: SQLite primary (if configured) over a
    /// JSON fallback file.
    pub fn open(options: LedgerOptions) -> Self {
        let primary = options.primary_db_path.map(|path| {
            Box::new(PrimaryBackend::new(
                SqliteDocumentStore::new(path),
                options.backend_timeout,
                options.probe_timeout,
            )) as Box<dyn StorageBackend>
        });
        let fallback = Box::new(FallbackBackend::new(options.fallback_path, options.backend_timeout));
        Self::new(primary, fallback)
    }

    /// Log which backend is currently usable. Never fails.
    pub async fn probe(&self) {
        match &self.primary {
            Some(primary) => match primary.health_check().await {
                Ok(()) => tracing::info!(backend = primary.name(), "attendance store ready"),
                Err(e) => tracing::warn!(
                    backend = primary.name(),
                    error = %e,
                    "primary attendance store unavailable; writes go to fallback"
                ),
            },
            None => tracing::info!(
                backend = self.fallback.name(),
                "no primary attendance store configured"
            ),
        }
    }

    /// Stamp and store one attendance event.
    ///
    /// Confidence must be a finite percentage; anything else is rejected
    /// before either backend is touched.
    pub async fn insert(&self, event: AttendanceEvent) -> Result<Stored, LedgerError> {
        if !event.confidence.is_finite() || !(0.0..=100.0).contains(&event.confidence) {
            return Err(LedgerError::InvalidRecord(format!(
                "confidence {} is outside 0..=100",
                event.confidence
            )));
        }
        let record = event.stamp(Utc::now());

        let primary_err = match &self.primary {
            Some(primary) => match primary.insert(&record).await {
                Ok(()) => {
                    tracing::debug!(
                        record_id = %record.record_id,
                        identity = %record.identity_id,
                        "attendance stored"
                    );
                    return Ok(Stored {
                        record,
                        backend: BackendKind::Primary,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "primary insert failed; using fallback");
                    e.to_string()
                }
            },
            None => "not configured".to_string(),
        };

        match self.fallback.insert(&record).await {
            Ok(()) => {
                tracing::debug!(
                    record_id = %record.record_id,
                    identity = %record.identity_id,
                    "attendance stored in fallback"
                );
                Ok(Stored {
                    record,
                    backend: BackendKind::Fallback,
                })
            }
            Err(e) => Err(unavailable(primary_err, e)),
        }
    }

    /// Records matching `query`, newest first.
    pub async fn query(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let primary_err = match &self.primary {
            Some(primary) => match primary.query(query).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    tracing::warn!(error = %e, "primary query failed; using fallback");
                    e.to_string()
                }
            },
            None => "not configured".to_string(),
        };

        self.fallback
            .query(query)
            .await
            .map_err(|e| unavailable(primary_err, e))
    }

    pub async fn stats(&self, query: &AttendanceQuery) -> Result<AttendanceStats, LedgerError> {
        let records = self.query(query).await?;
        Ok(AttendanceStats {
            total_records: records.len(),
            by_identity: aggregate_by_identity(&records),
            records,
        })
    }
}

fn unavailable(primary: String, fallback: BackendError) -> LedgerError {
    tracing::error!(primary = %primary, fallback = %fallback, "attendance write path down");
    LedgerError::BackendUnavailable {
        primary,
        fallback: fallback.to_string(),
    }
}

/// Count records per identity.
pub fn aggregate_by_identity(records: &[AttendanceRecord]) -> BTreeMap<String, usize> {
    records.iter().fold(BTreeMap::new(), |mut acc, r| {
        *acc.entry(r.identity_id.clone()).or_insert(0) += 1;
        acc
    })
}
