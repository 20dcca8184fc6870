//! # Domain Types for the Journal
//!
//! The journal stores [`PersistentRepr`]s grouped into [`AtomicWrite`]s. Each
//! persisted row also receives a global `ordering` from the database, which is
//! what tag queries page over.
//!
//! ## Numbering
//!
//! - `sequence_nr`: 1-based position within one persistence id. Unique per
//!   stream, assigned by the caller.
//! - `ordering`: strictly increasing across all streams, assigned by SQLite
//!   at insert time.
//!
//! Ranges are inclusive on both ends and use `i64` to match SQLite's integer
//! column type. [`MAX_SEQUENCE_NR`] means "no upper bound".

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::serialization::Payload;

/// Upper bound meaning "everything" for ranges and limits.
pub const MAX_SEQUENCE_NR: i64 = i64::MAX;

// =============================================================================
// Events
// =============================================================================

/// One event of one stream, as written and replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentRepr {
    pub persistence_id: String,
    pub sequence_nr: i64,
    pub payload: Payload,
    /// Explicit manifest. Empty means "let the serializer decide".
    pub manifest: String,
    /// Milliseconds since the Unix epoch. Zero is replaced by the write time.
    pub timestamp: i64,
    /// Read back from storage. Ignored on write.
    pub is_deleted: bool,
    pub tags: BTreeSet<String>,
}

impl PersistentRepr {
    pub fn new(persistence_id: impl Into<String>, sequence_nr: i64, payload: Payload) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            payload,
            manifest: String::new(),
            timestamp: 0,
            is_deleted: false,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Events of one stream that are persisted all together or not at all.
///
/// # Invariants
///
/// - at least one event
/// - every event has the same `persistence_id`
/// - sequence numbers are positive, ascending and contiguous
#[derive(Debug, Clone)]
pub struct AtomicWrite {
    events: Vec<PersistentRepr>,
}

impl AtomicWrite {
    pub fn new(events: Vec<PersistentRepr>) -> Result<Self> {
        let first = events
            .first()
            .ok_or_else(|| Error::InvalidRequest("atomic write has no events".to_string()))?;

        if first.persistence_id.is_empty() {
            return Err(Error::InvalidRequest(
                "persistence id must not be empty".to_string(),
            ));
        }
        if first.sequence_nr < 1 {
            return Err(Error::InvalidRequest(format!(
                "sequence numbers start at 1, got {}",
                first.sequence_nr
            )));
        }

        for pair in events.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.persistence_id != first.persistence_id {
                return Err(Error::InvalidRequest(format!(
                    "atomic write mixes persistence ids '{}' and '{}'",
                    first.persistence_id, next.persistence_id
                )));
            }
            if next.sequence_nr != prev.sequence_nr + 1 {
                return Err(Error::InvalidRequest(format!(
                    "sequence numbers of '{}' are not contiguous: {} then {}",
                    first.persistence_id, prev.sequence_nr, next.sequence_nr
                )));
            }
        }

        Ok(Self { events })
    }

    /// Single-event write.
    pub fn single(event: PersistentRepr) -> Result<Self> {
        Self::new(vec![event])
    }

    pub fn persistence_id(&self) -> &str {
        &self.events[0].persistence_id
    }

    pub fn lowest_sequence_nr(&self) -> i64 {
        self.events[0].sequence_nr
    }

    pub fn highest_sequence_nr(&self) -> i64 {
        self.events[self.events.len() - 1].sequence_nr
    }

    pub fn events(&self) -> &[PersistentRepr] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<PersistentRepr> {
        self.events
    }
}

/// Outcome of a committed [`AtomicWrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub persistence_id: String,
    pub lowest_sequence_nr: i64,
    pub highest_sequence_nr: i64,
    /// Orderings assigned to the events, in write order.
    pub orderings: Vec<i64>,
}

impl WriteResult {
    /// Sequence number the stream expects next.
    pub fn next_sequence_nr(&self) -> i64 {
        self.highest_sequence_nr + 1
    }
}

// =============================================================================
// Tag Queries
// =============================================================================

/// An event returned by a tag query.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub event: PersistentRepr,
    pub tag: String,
    pub ordering: i64,
}

/// A page of tag query results.
#[derive(Debug, Clone, PartialEq)]
pub struct TagReplay {
    pub events: Vec<TaggedEvent>,
    /// Offset to pass as `from_offset` for the next page.
    pub max_ordering: i64,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Identity of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub persistence_id: String,
    pub sequence_nr: i64,
    /// Milliseconds since the Unix epoch. Zero is replaced by the save time.
    pub timestamp: i64,
}

impl SnapshotMetadata {
    pub fn new(persistence_id: impl Into<String>, sequence_nr: i64) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A snapshot loaded from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSnapshot {
    pub metadata: SnapshotMetadata,
    pub snapshot: Payload,
}

/// Bounds used to pick snapshots for loading or deletion. All bounds are
/// inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSelectionCriteria {
    pub max_sequence_nr: i64,
    pub max_timestamp: i64,
    pub min_sequence_nr: i64,
    pub min_timestamp: i64,
}

impl SnapshotSelectionCriteria {
    /// Matches every snapshot.
    pub fn latest() -> Self {
        Self {
            max_sequence_nr: MAX_SEQUENCE_NR,
            max_timestamp: i64::MAX,
            min_sequence_nr: 0,
            min_timestamp: 0,
        }
    }

    /// Matches nothing.
    pub fn none() -> Self {
        Self {
            max_sequence_nr: 0,
            max_timestamp: 0,
            min_sequence_nr: 0,
            min_timestamp: 0,
        }
    }

    /// Snapshots at or below `sequence_nr`.
    pub fn up_to(sequence_nr: i64) -> Self {
        Self {
            max_sequence_nr: sequence_nr,
            ..Self::latest()
        }
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

// =============================================================================
// Tests
// =============================================================================
