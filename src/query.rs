//! # Query Executor
//!
//! Builds the journal SQL once from validated settings and runs it against a
//! connection or transaction handed in by the caller. The executor holds no
//! connection of its own: the batching engine decides which transaction each
//! statement runs in.
//!
//! ## Statements
//!
//! | Operation | Shape |
//! |-----------|-------|
//! | insert | one `INSERT` per event, tag rows through the tag strategy |
//! | replay range | `WHERE persistence_id = ? AND sequence_nr BETWEEN ? AND ?` ascending, `LIMIT ?` |
//! | highest sequence nr | `MAX` over journal rows and the metadata high-water mark |
//! | delete to | unindex tags, delete rows, keep the high-water mark in metadata |
//! | replay by tag | tag predicate, `ordering > ?` ascending, `LIMIT ?` |
//! | persistence ids | `UNION` of journal and metadata ids |
//!
//! Every caller-supplied string is bound as a parameter. Only identifiers
//! from validated settings are formatted into SQL text.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, Connection, Row};

use crate::codec::{codec_for, current_time_ms, read_payload, PayloadCodec, StoredPayload};
use crate::error::{is_unique_violation, Error, Result};
use crate::schema::qualified_name;
use crate::serialization::SerializerRegistry;
use crate::settings::JournalSettings;
use crate::tags::{strategy_for, TagStrategy};
use crate::types::{AtomicWrite, PersistentRepr, TaggedEvent, WriteResult};

// =============================================================================
// Encoded Writes
// =============================================================================

/// One event with its payload already encoded for the configured column.
#[derive(Debug, Clone)]
pub(crate) struct EncodedEvent {
    pub sequence_nr: i64,
    pub timestamp: i64,
    pub manifest: String,
    pub serializer_id: Option<i32>,
    pub payload: StoredPayload,
    pub tags_column: Option<String>,
    pub tags: BTreeSet<String>,
}

/// An [`AtomicWrite`] ready for insertion.
#[derive(Debug, Clone)]
pub(crate) struct EncodedWrite {
    pub persistence_id: String,
    pub events: Vec<EncodedEvent>,
}

impl EncodedWrite {
    pub fn lowest_sequence_nr(&self) -> i64 {
        self.events.first().map(|e| e.sequence_nr).unwrap_or(0)
    }

    pub fn highest_sequence_nr(&self) -> i64 {
        self.events.last().map(|e| e.sequence_nr).unwrap_or(0)
    }
}

// =============================================================================
// Statements
// =============================================================================

struct Statements {
    insert: String,
    replay_range: String,
    highest: String,
    delete_events: String,
    trim_metadata: String,
    insert_metadata: String,
    replay_by_tag: String,
    persistence_ids: String,
}

impl Statements {
    fn build(settings: &JournalSettings, tags: &dyn TagStrategy) -> Self {
        let schema = settings.schema_name();
        let journal = qualified_name(schema, settings.table_name());
        let metadata = qualified_name(schema, settings.metadata_table_name());
        let stored_as = settings.stored_as();
        let columns = format!(
            "e.ordering, e.persistence_id, e.sequence_nr, e.is_deleted, e.created_at, \
             e.manifest, {}, e.tags, e.serializer_id",
            stored_as.select_expr("e.payload")
        );

        Self {
            insert: format!(
                "INSERT INTO {journal} \
                 (persistence_id, sequence_nr, is_deleted, created_at, manifest, payload, tags, serializer_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, {}, ?7, ?8)",
                stored_as.bind_expr(6)
            ),
            replay_range: format!(
                "SELECT {columns} FROM {journal} AS e \
                 WHERE e.persistence_id = ?1 AND e.sequence_nr >= ?2 AND e.sequence_nr <= ?3 \
                 AND e.is_deleted = 0 \
                 ORDER BY e.sequence_nr ASC LIMIT ?4"
            ),
            highest: format!(
                "SELECT MAX(sequence_nr) FROM ( \
                 SELECT MAX(sequence_nr) AS sequence_nr FROM {journal} WHERE persistence_id = ?1 \
                 UNION ALL \
                 SELECT MAX(sequence_nr) AS sequence_nr FROM {metadata} WHERE persistence_id = ?1)"
            ),
            delete_events: format!(
                "DELETE FROM {journal} WHERE persistence_id = ?1 AND sequence_nr <= ?2"
            ),
            trim_metadata: format!(
                "DELETE FROM {metadata} WHERE persistence_id = ?1 AND sequence_nr < ?2"
            ),
            insert_metadata: format!(
                "INSERT OR IGNORE INTO {metadata} (persistence_id, sequence_nr) VALUES (?1, ?2)"
            ),
            replay_by_tag: format!(
                "SELECT {columns} FROM {journal} AS e {join} \
                 WHERE {predicate} AND e.ordering > ?2 AND e.is_deleted = 0 \
                 ORDER BY e.ordering ASC LIMIT ?3",
                join = tags.query_join(),
                predicate = tags.query_predicate(),
            ),
            persistence_ids: format!(
                "SELECT persistence_id FROM {journal} \
                 UNION SELECT persistence_id FROM {metadata} \
                 ORDER BY persistence_id ASC"
            ),
        }
    }
}

/// Raw journal row before payload and tag decoding.
struct JournalRow {
    ordering: i64,
    persistence_id: String,
    sequence_nr: i64,
    is_deleted: bool,
    created_at: i64,
    manifest: String,
    payload: StoredPayload,
    tags: Option<String>,
    serializer_id: Option<i32>,
}

impl JournalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ordering: row.get(0)?,
            persistence_id: row.get(1)?,
            sequence_nr: row.get(2)?,
            is_deleted: row.get(3)?,
            created_at: row.get(4)?,
            manifest: row.get(5)?,
            payload: read_payload(row, 6)?,
            tags: row.get(7)?,
            serializer_id: row.get(8)?,
        })
    }
}

// =============================================================================
// Query Executor
// =============================================================================

/// Parameterized journal SQL plus the codec and tag strategy it binds with.
pub(crate) struct QueryExecutor {
    codec: Arc<dyn PayloadCodec>,
    tags: Box<dyn TagStrategy>,
    sql: Statements,
}

impl QueryExecutor {
    pub fn new(settings: &JournalSettings, registry: Arc<SerializerRegistry>) -> Self {
        let tags = strategy_for(settings);
        let sql = Statements::build(settings, tags.as_ref());
        Self {
            codec: codec_for(settings.stored_as(), registry),
            tags,
            sql,
        }
    }

    /// Rejects tag queries the configured layout cannot answer exactly.
    pub fn check_tag_query(&self, tag: &str) -> Result<()> {
        self.tags.check_query(tag)
    }

    /// Serializes payloads and tags of `write`. Runs on the caller's task.
    pub fn encode(&self, write: &AtomicWrite) -> Result<EncodedWrite> {
        let now = current_time_ms();
        let events = write
            .events()
            .iter()
            .map(|event| {
                let encoded = self.codec.encode(&event.payload, &event.manifest)?;
                Ok(EncodedEvent {
                    sequence_nr: event.sequence_nr,
                    timestamp: if event.timestamp == 0 { now } else { event.timestamp },
                    manifest: encoded.manifest,
                    serializer_id: encoded.serializer_id,
                    payload: encoded.data,
                    tags_column: self.tags.encode(&event.tags)?,
                    tags: event.tags.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EncodedWrite {
            persistence_id: write.persistence_id().to_string(),
            events,
        })
    }

    /// Inserts every event of `write`. The caller provides the atomicity
    /// boundary (savepoint or transaction).
    pub fn insert(&self, conn: &Connection, write: &EncodedWrite) -> Result<WriteResult> {
        let mut stmt = conn.prepare_cached(&self.sql.insert)?;
        let mut orderings = Vec::with_capacity(write.events.len());

        for event in &write.events {
            stmt.execute(params![
                write.persistence_id,
                event.sequence_nr,
                // New events are never stored as deleted.
                false,
                event.timestamp,
                event.manifest,
                event.payload,
                event.tags_column,
                event.serializer_id,
            ])
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict {
                        persistence_id: write.persistence_id.clone(),
                        sequence_nr: event.sequence_nr,
                    }
                } else {
                    Error::from(e)
                }
            })?;

            let ordering = conn.last_insert_rowid();
            self.tags.index(conn, ordering, &event.tags)?;
            orderings.push(ordering);
        }

        Ok(WriteResult {
            persistence_id: write.persistence_id.clone(),
            lowest_sequence_nr: write.lowest_sequence_nr(),
            highest_sequence_nr: write.highest_sequence_nr(),
            orderings,
        })
    }

    /// Streams non-deleted events of one stream in `[from, to]`, ascending,
    /// at most `max`. `on_event` returns false to stop early.
    ///
    /// Returns the number of events delivered.
    pub fn replay_range<F>(
        &self,
        conn: &Connection,
        persistence_id: &str,
        from: i64,
        to: i64,
        max: i64,
        mut on_event: F,
    ) -> Result<u64>
    where
        F: FnMut(PersistentRepr) -> bool,
    {
        // LIMIT with a negative value means "no limit" in SQLite.
        if max <= 0 || from > to {
            return Ok(0);
        }

        let mut stmt = conn.prepare_cached(&self.sql.replay_range)?;
        let mut rows = stmt.query(params![persistence_id, from, to, max])?;
        let mut delivered = 0;

        while let Some(row) = rows.next()? {
            let (_, event) = self.decode(JournalRow::from_row(row)?)?;
            if !on_event(event) {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Highest sequence number ever written to the stream, 0 if none.
    pub fn highest_sequence_nr(&self, conn: &Connection, persistence_id: &str) -> Result<i64> {
        let highest: Option<i64> = conn
            .prepare_cached(&self.sql.highest)?
            .query_row(params![persistence_id], |row| row.get(0))?;
        Ok(highest.unwrap_or(0))
    }

    /// Deletes events up to `to_sequence_nr` while keeping the stream's
    /// highest sequence number readable.
    pub fn delete_to(&self, conn: &Connection, persistence_id: &str, to_sequence_nr: i64) -> Result<()> {
        let highest = self.highest_sequence_nr(conn, persistence_id)?;

        self.tags.unindex(conn, persistence_id, to_sequence_nr)?;
        conn.prepare_cached(&self.sql.delete_events)?
            .execute(params![persistence_id, to_sequence_nr])?;

        if highest > 0 && highest <= to_sequence_nr {
            conn.prepare_cached(&self.sql.trim_metadata)?
                .execute(params![persistence_id, highest])?;
            conn.prepare_cached(&self.sql.insert_metadata)?
                .execute(params![persistence_id, highest])?;
        }
        Ok(())
    }

    /// Streams events carrying `tag` with `ordering > from_offset`, ascending,
    /// at most `max`. `on_event` returns false to stop early.
    ///
    /// Returns the offset to resume from: the ordering of the last event
    /// delivered, or `from_offset` when nothing matched.
    pub fn replay_by_tag<F>(
        &self,
        conn: &Connection,
        tag: &str,
        from_offset: i64,
        max: i64,
        mut on_event: F,
    ) -> Result<i64>
    where
        F: FnMut(TaggedEvent) -> bool,
    {
        if max <= 0 {
            return Ok(from_offset);
        }

        let mut stmt = conn.prepare_cached(&self.sql.replay_by_tag)?;
        let mut rows = stmt.query(params![tag, from_offset, max])?;
        let mut max_ordering = from_offset;

        while let Some(row) = rows.next()? {
            let (ordering, event) = self.decode(JournalRow::from_row(row)?)?;
            let tagged = TaggedEvent {
                event,
                tag: tag.to_string(),
                ordering,
            };
            if !on_event(tagged) {
                break;
            }
            max_ordering = ordering;
        }
        Ok(max_ordering)
    }

    /// Every persistence id known to the journal, ascending.
    pub fn persistence_ids(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(&self.sql.persistence_ids)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn decode(&self, row: JournalRow) -> Result<(i64, PersistentRepr)> {
        let payload = self
            .codec
            .decode(row.payload, &row.manifest, row.serializer_id)?;
        let tags = self.tags.decode(row.tags.as_deref())?;

        Ok((
            row.ordering,
            PersistentRepr {
                persistence_id: row.persistence_id,
                sequence_nr: row.sequence_nr,
                payload,
                manifest: row.manifest,
                timestamp: row.created_at,
                is_deleted: row.is_deleted,
                tags,
            },
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::initialize_journal;
    use crate::serialization::Payload;
    use crate::settings::{JournalConfig, StoredAs, TagStorage};
    use serde_json::json;

    fn setup(configure: impl FnOnce(&mut JournalConfig)) -> (Connection, QueryExecutor) {
        let mut config = JournalConfig::new("query.db");
        configure(&mut config);
        let settings = config.build().unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        initialize_journal(&mut conn, &settings).unwrap();
        let executor = QueryExecutor::new(&settings, Arc::new(SerializerRegistry::new()));
        (conn, executor)
    }

    fn write(pid: &str, seqs: std::ops::RangeInclusive<i64>, tags: &[&str]) -> AtomicWrite {
        AtomicWrite::new(
            seqs.map(|n| {
                PersistentRepr::new(pid, n, Payload::from_value("n", json!(n)))
                    .with_tags(tags.iter().copied())
            })
            .collect(),
        )
        .unwrap()
    }

    fn insert(conn: &Connection, executor: &QueryExecutor, w: AtomicWrite) -> Result<WriteResult> {
        let encoded = executor.encode(&w)?;
        executor.insert(conn, &encoded)
    }

    fn replay_all(conn: &Connection, executor: &QueryExecutor, pid: &str) -> Vec<i64> {
        let mut seen = Vec::new();
        executor
            .replay_range(conn, pid, 0, i64::MAX, i64::MAX, |e| {
                seen.push(e.sequence_nr);
                true
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_insert_and_replay() {
        let (conn, executor) = setup(|_| {});

        let result = insert(&conn, &executor, write("p1", 1..=5, &[])).unwrap();
        assert_eq!(result.lowest_sequence_nr, 1);
        assert_eq!(result.highest_sequence_nr, 5);
        assert_eq!(result.orderings.len(), 5);
        assert!(result.orderings.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(replay_all(&conn, &executor, "p1"), vec![1, 2, 3, 4, 5]);
        assert_eq!(executor.highest_sequence_nr(&conn, "p1").unwrap(), 5);
        assert_eq!(executor.highest_sequence_nr(&conn, "nobody").unwrap(), 0);
    }

    #[test]
    fn test_replay_bounds_and_limit() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=10, &[])).unwrap();

        let mut seen = Vec::new();
        executor
            .replay_range(&conn, "p", 3, 8, 4, |e| {
                seen.push(e.sequence_nr);
                true
            })
            .unwrap();
        assert_eq!(seen, vec![3, 4, 5, 6]);

        let count = executor
            .replay_range(&conn, "p", 1, 10, 0, |_| true)
            .unwrap();
        assert_eq!(count, 0);

        // Early stop
        let count = executor
            .replay_range(&conn, "p", 1, 10, 100, |e| e.sequence_nr < 2)
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_stopped_consumer_is_not_counted() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=3, &["t"])).unwrap();

        let mut accepted = 0;
        let delivered = executor
            .replay_range(&conn, "p", 1, i64::MAX, i64::MAX, |_| {
                accepted += 1;
                accepted < 2
            })
            .unwrap();
        assert_eq!(delivered, 1);

        // The resume offset stays at the last event the consumer took.
        let mut first = None;
        let offset = executor
            .replay_by_tag(&conn, "t", 0, i64::MAX, |e| {
                if first.is_none() {
                    first = Some(e.ordering);
                    true
                } else {
                    false
                }
            })
            .unwrap();
        assert_eq!(Some(offset), first);
    }

    #[test]
    fn test_caller_deleted_flag_is_not_stored() {
        let (conn, executor) = setup(|_| {});
        let mut event = PersistentRepr::new("p", 1, Payload::from_value("n", json!(1)));
        event.is_deleted = true;
        insert(&conn, &executor, AtomicWrite::single(event).unwrap()).unwrap();

        assert_eq!(replay_all(&conn, &executor, "p"), vec![1]);
    }

    #[test]
    fn test_duplicate_is_conflict() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=2, &[])).unwrap();

        let err = insert(&conn, &executor, write("p", 2..=3, &[])).unwrap_err();
        match err {
            Error::Conflict {
                persistence_id,
                sequence_nr,
            } => {
                assert_eq!(persistence_id, "p");
                assert_eq!(sequence_nr, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_keeps_highest() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=5, &["blue"])).unwrap();

        executor.delete_to(&conn, "p", 3).unwrap();
        assert_eq!(replay_all(&conn, &executor, "p"), vec![4, 5]);
        assert_eq!(executor.highest_sequence_nr(&conn, "p").unwrap(), 5);

        executor.delete_to(&conn, "p", i64::MAX).unwrap();
        assert!(replay_all(&conn, &executor, "p").is_empty());
        assert_eq!(executor.highest_sequence_nr(&conn, "p").unwrap(), 5);

        // Tag index rows went with the events.
        let tag_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM event_journal_tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tag_rows, 0);
    }

    #[test]
    fn test_delete_then_write_advances_metadata() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=3, &[])).unwrap();
        executor.delete_to(&conn, "p", 3).unwrap();

        insert(&conn, &executor, write("p", 4..=6, &[])).unwrap();
        executor.delete_to(&conn, "p", 6).unwrap();

        let rows: Vec<i64> = conn
            .prepare("SELECT sequence_nr FROM metadata WHERE persistence_id = 'p'")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![6]);
        assert_eq!(executor.highest_sequence_nr(&conn, "p").unwrap(), 6);
    }

    #[test]
    fn test_delete_unknown_stream_records_nothing() {
        let (conn, executor) = setup(|_| {});
        executor.delete_to(&conn, "ghost", i64::MAX).unwrap();
        assert!(executor.persistence_ids(&conn).unwrap().is_empty());
    }

    fn tag_page(conn: &Connection, executor: &QueryExecutor, tag: &str, from: i64, max: i64) -> (Vec<i64>, i64) {
        let mut seqs = Vec::new();
        let resume = executor
            .replay_by_tag(conn, tag, from, max, |t| {
                seqs.push(t.event.sequence_nr);
                true
            })
            .unwrap();
        (seqs, resume)
    }

    #[test]
    fn test_replay_by_tag_both_layouts() {
        for storage in [TagStorage::Array, TagStorage::Delimited] {
            let (conn, executor) = setup(|c| c.tag_storage = storage);
            insert(&conn, &executor, write("a", 1..=1, &[])).unwrap();
            insert(&conn, &executor, write("a", 2..=2, &["green"])).unwrap();
            insert(&conn, &executor, write("b", 1..=2, &["green", "red"])).unwrap();
            insert(&conn, &executor, write("c", 1..=1, &["greenish"])).unwrap();

            let (seqs, _) = tag_page(&conn, &executor, "green", 0, 10);
            assert_eq!(seqs, vec![2, 1, 2], "{storage:?}");

            let (first, resume) = tag_page(&conn, &executor, "green", 0, 2);
            assert_eq!(first.len(), 2);
            let (rest, last) = tag_page(&conn, &executor, "green", resume, 10);
            assert_eq!(rest, vec![2]);

            let (none, unchanged) = tag_page(&conn, &executor, "green", last, 10);
            assert!(none.is_empty());
            assert_eq!(unchanged, last);
        }
    }

    #[test]
    fn test_tags_round_trip_on_replay() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=1, &["x", "y"])).unwrap();

        let mut tags = BTreeSet::new();
        executor
            .replay_range(&conn, "p", 1, 1, 1, |e| {
                tags = e.tags;
                true
            })
            .unwrap();
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_persistence_ids_include_deleted_streams() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("b", 1..=1, &[])).unwrap();
        insert(&conn, &executor, write("a", 1..=2, &[])).unwrap();
        executor.delete_to(&conn, "b", i64::MAX).unwrap();

        assert_eq!(executor.persistence_ids(&conn).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_jsonb_round_trip() {
        let (conn, executor) = setup(|c| c.stored_as = StoredAs::JsonB);
        let payload = Payload::from_value("doc", json!({"k": [1, 2.5, "x", null]}));
        let w = AtomicWrite::single(PersistentRepr::new("p", 1, payload.clone())).unwrap();
        insert(&conn, &executor, w).unwrap();

        let stored_type: String = conn
            .query_row("SELECT typeof(payload) FROM event_journal", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored_type, "blob");

        let mut replayed = None;
        executor
            .replay_range(&conn, "p", 1, 1, 1, |e| {
                replayed = Some(e.payload);
                true
            })
            .unwrap();
        assert_eq!(replayed.unwrap().value(), payload.value());
    }

    #[test]
    fn test_zero_timestamp_replaced() {
        let (conn, executor) = setup(|_| {});
        insert(&conn, &executor, write("p", 1..=1, &[])).unwrap();
        let fixed = AtomicWrite::single(
            PersistentRepr::new("p", 2, Payload::from_value("n", json!(2))).with_timestamp(1234),
        )
        .unwrap();
        insert(&conn, &executor, fixed).unwrap();

        let mut stamps = Vec::new();
        executor
            .replay_range(&conn, "p", 1, 2, 2, |e| {
                stamps.push(e.timestamp);
                true
            })
            .unwrap();
        assert!(stamps[0] > 0);
        assert_eq!(stamps[1], 1234);
    }
}
