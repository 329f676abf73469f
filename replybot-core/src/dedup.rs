use crate::types::{CandidateItem, Outcome, ReplyRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerState {
    /// Written ahead of a post whose result is not known yet.
    InFlight,
    Replied,
}

impl MarkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerState::InFlight => "in_flight",
            MarkerState::Replied => "replied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEntry {
    pub item_created: i64,
    pub marked_at: i64,
    pub account: Option<String>,
    pub state: MarkerState,
}

/// Serializable view of the replied set, keyed by item id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyWindow {
    pub entries: BTreeMap<String, ReplyEntry>,
}

impl ReplyWindow {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEffect {
    /// A success was stored for the first time.
    Inserted,
    /// A success already existed for this id; nothing changed.
    Conflict,
    /// A failure released the in-flight marker.
    Cleared,
    Unchanged,
}

/// Tracks which items were replied to, including in-flight posts.
#[derive(Debug, Clone, Default)]
pub struct DedupStore {
    window: ReplyWindow,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_replied(&self, item_id: &str) -> bool {
        self.window.entries.contains_key(item_id)
    }

    pub fn state_of(&self, item_id: &str) -> Option<MarkerState> {
        self.window.entries.get(item_id).map(|e| e.state)
    }

    /// Marks `item` as in flight. Returns false if it is already known.
    pub fn begin(&mut self, item: &CandidateItem, account: &str, now: i64) -> bool {
        if self.has_replied(&item.id) {
            return false;
        }
        self.window.entries.insert(
            item.id.clone(),
            ReplyEntry {
                item_created: item.created_utc,
                marked_at: now,
                account: Some(account.to_string()),
                state: MarkerState::InFlight,
            },
        );
        true
    }

    /// Drops an in-flight marker whose post never started.
    pub fn abandon(&mut self, item_id: &str) {
        if self.state_of(item_id) == Some(MarkerState::InFlight) {
            self.window.entries.remove(item_id);
        }
    }

    /// Settles an in-flight marker as replied when the post result is unknown.
    pub fn mark_indeterminate(&mut self, item_id: &str) {
        if let Some(entry) = self.window.entries.get_mut(item_id) {
            entry.state = MarkerState::Replied;
        }
    }

    pub fn record(&mut self, record: &ReplyRecord) -> RecordEffect {
        match record.outcome {
            Outcome::Success => {
                if self.state_of(&record.item_id) == Some(MarkerState::Replied) {
                    warn!(
                        item_id = %record.item_id,
                        target_key = %record.target,
                        "Conflicting success record ignored: item already replied"
                    );
                    return RecordEffect::Conflict;
                }
                let marked_at = record.recorded_at.timestamp();
                self.window.entries.insert(
                    record.item_id.clone(),
                    ReplyEntry {
                        item_created: record.item_created,
                        marked_at,
                        account: record.account.clone(),
                        state: MarkerState::Replied,
                    },
                );
                RecordEffect::Inserted
            }
            Outcome::Failure => {
                if self.state_of(&record.item_id) == Some(MarkerState::InFlight) {
                    self.window.entries.remove(&record.item_id);
                    RecordEffect::Cleared
                } else {
                    RecordEffect::Unchanged
                }
            }
            Outcome::Skipped => RecordEffect::Unchanged,
        }
    }

    pub fn snapshot(&self) -> ReplyWindow {
        self.window.clone()
    }

    /// Replaces the in-memory set with a persisted window.
    ///
    /// In-flight markers left by a crash are treated as replied.
    pub fn restore(&mut self, mut window: ReplyWindow) {
        for (id, entry) in window.entries.iter_mut() {
            if entry.state == MarkerState::InFlight {
                warn!(
                    item_id = %id,
                    account = ?entry.account,
                    "Found in-flight marker from an interrupted run; treating as replied"
                );
                entry.state = MarkerState::Replied;
            }
        }
        self.window = window;
    }

    /// Forgets entries for items created before `cutoff`.
    pub fn prune(&mut self, cutoff: i64) -> usize {
        let before = self.window.len();
        self.window
            .entries
            .retain(|_, entry| entry.item_created >= cutoff || entry.state == MarkerState::InFlight);
        let pruned = before - self.window.len();
        if pruned > 0 {
            debug!("Pruned {} replied entries older than {}", pruned, cutoff);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
