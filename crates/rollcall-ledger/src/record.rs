use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value metadata attached to a record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// An attendance observation about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    /// Stable id; re-inserting the same event is a no-op.
    pub record_id: Uuid,
    pub identity_id: String,
    pub group_id: Option<String>,
    pub confidence: f32,
    pub metadata: Metadata,
    /// When the face was seen. `None` = time of insertion.
    pub created_at: Option<DateTime<Utc>>,
}

impl AttendanceEvent {
    pub fn new(identity_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            identity_id: identity_id.into(),
            group_id: None,
            confidence,
            metadata: Metadata::new(),
            created_at: None,
        }
    }

    pub fn with_group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Fix timestamps: `created_at` defaults to `now`, `stored_at` is always `now`.
    pub fn stamp(self, now: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            record_id: self.record_id,
            identity_id: self.identity_id,
            group_id: self.group_id,
            confidence: self.confidence,
            extra_metadata: self.metadata,
            created_at: self.created_at.unwrap_or(now),
            stored_at: now,
        }
    }
}

/// A stored attendance record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: Uuid,
    pub identity_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub extra_metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

/// Record filter. Every set field must match; time bounds are inclusive
/// and apply to `created_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceQuery {
    pub identity_id: Option<String>,
    pub group_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AttendanceQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(id) = &self.identity_id {
            if &record.identity_id != id {
                return false;
            }
        }
        if let Some(group) = &self.group_id {
            if record.group_id.as_ref() != Some(group) {
                return false;
            }
        }
        if self.from.is_some_and(|from| record.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.created_at > to) {
            return false;
        }
        true
    }
}

/// Order newest `created_at` first. Stable, so equal timestamps keep
/// their incoming order.
pub fn sort_newest_first(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
