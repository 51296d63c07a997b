//! Per-identity cool-down so a face that stays in view is marked once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cool-down used by the live camera loop unless configured otherwise.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Last accepted mark per identity.
///
/// Not synchronized: owned by the single live loop that feeds it.
/// Entries are overwritten on every accepted mark and never removed.
#[derive(Debug, Default)]
pub struct DebounceTracker {
    last_marked: HashMap<String, Instant>,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a mark iff at least `cooldown` has passed since the last
    /// accepted mark for `identity_id` (or there was none). Accepting
    /// records `now` as the new last mark.
    pub fn should_mark(&mut self, identity_id: &str, now: Instant, cooldown: Duration) -> bool {
        if let Some(&last) = self.last_marked.get(identity_id) {
            // `now` earlier than `last` saturates to zero and is suppressed.
            if now.saturating_duration_since(last) < cooldown {
                return false;
            }
        }
        self.last_marked.insert(identity_id.to_string(), now);
        true
    }

    pub fn last_marked(&self, identity_id: &str) -> Option<Instant> {
        self.last_marked.get(identity_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_marked.is_empty()
    }
}
