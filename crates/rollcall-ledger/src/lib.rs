pub mod backend;
pub mod fallback;
pub mod ledger;
pub mod primary;
pub mod record;

pub use backend::{with_deadline, BackendError, StorageBackend};
pub use fallback::FallbackBackend;
pub use ledger::{
    aggregate_by_identity, AttendanceStats, BackendKind, FailoverLedger, LedgerError, LedgerOptions, Stored,
};
pub use primary::{DocumentStore, PrimaryBackend, SqliteDocumentStore};
pub use record::{sort_newest_first, AttendanceEvent, AttendanceQuery, AttendanceRecord, Metadata};
