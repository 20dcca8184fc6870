//! # Snapshot Store
//!
//! Point-in-time snapshots of a stream, keyed by `(persistence_id,
//! sequence_nr)`. Saving an existing key replaces the stored snapshot.
//!
//! Snapshot calls are few and independent, so they skip the batching engine:
//! each call takes a pooled connection, runs one short transaction and
//! returns. Payload encoding follows the same `stored-as` codecs as the
//! journal.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::codec::{codec_for, current_time_ms, read_payload, PayloadCodec};
use crate::error::Result;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::schema::{check_stored_as, initialize_snapshot_store, qualified_name};
use crate::serialization::{Payload, SerializerRegistry};
use crate::settings::SnapshotStoreSettings;
use crate::types::{SelectedSnapshot, SnapshotMetadata, SnapshotSelectionCriteria};

struct Statements {
    save: String,
    load: String,
    delete: String,
    delete_many: String,
}

impl Statements {
    fn build(settings: &SnapshotStoreSettings) -> Self {
        let table = qualified_name(settings.schema_name(), settings.table_name());
        let stored_as = settings.stored_as();
        let criteria = "persistence_id = ?1 AND sequence_nr <= ?2 AND created_at <= ?3 \
                        AND sequence_nr >= ?4 AND created_at >= ?5";

        Self {
            save: format!(
                "INSERT INTO {table} \
                 (persistence_id, sequence_nr, created_at, manifest, payload, serializer_id) \
                 VALUES (?1, ?2, ?3, ?4, {}, ?6) \
                 ON CONFLICT (persistence_id, sequence_nr) DO UPDATE SET \
                 created_at = excluded.created_at, manifest = excluded.manifest, \
                 payload = excluded.payload, serializer_id = excluded.serializer_id",
                stored_as.bind_expr(5)
            ),
            load: format!(
                "SELECT persistence_id, sequence_nr, created_at, manifest, {}, serializer_id \
                 FROM {table} WHERE {criteria} \
                 ORDER BY sequence_nr DESC LIMIT 1",
                stored_as.select_expr("payload")
            ),
            delete: format!(
                "DELETE FROM {table} WHERE persistence_id = ?1 AND sequence_nr = ?2 \
                 AND (?3 = 0 OR created_at = ?3)"
            ),
            delete_many: format!("DELETE FROM {table} WHERE {criteria}"),
        }
    }
}

struct Inner {
    settings: SnapshotStoreSettings,
    pool: ConnectionPool,
    codec: Arc<dyn PayloadCodec>,
    breaker: CircuitBreaker,
    sql: Statements,
}

/// Handle to the snapshot store. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

impl SnapshotStore {
    /// Opens the store, creating its table when `auto-initialize` is set.
    pub async fn open(
        settings: SnapshotStoreSettings,
        registry: Arc<SerializerRegistry>,
    ) -> Result<Self> {
        registry.validate()?;
        let pool = ConnectionPool::new(PoolOptions::from(&settings));

        let init = settings.clone();
        pool.run(move |pooled| {
            let conn = pooled.connection()?;
            check_stored_as(conn, init.stored_as())?;
            if init.auto_initialize() {
                initialize_snapshot_store(conn, &init)?;
            }
            Ok(())
        })
        .await?;

        let breaker = CircuitBreaker::new("snapshot-store", settings.circuit_breaker());
        Ok(Self {
            inner: Arc::new(Inner {
                codec: codec_for(settings.stored_as(), registry),
                sql: Statements::build(&settings),
                settings,
                pool,
                breaker,
            }),
        })
    }

    pub fn settings(&self) -> &SnapshotStoreSettings {
        &self.inner.settings
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Saves a snapshot, replacing one stored under the same key.
    pub async fn save(&self, metadata: SnapshotMetadata, snapshot: Payload) -> Result<()> {
        let encoded = self.inner.codec.encode(&snapshot, "")?;
        let timestamp = match metadata.timestamp {
            0 => current_time_ms(),
            ts => ts,
        };

        let inner = self.inner.clone();
        self.inner
            .breaker
            .call(self.inner.pool.run(move |pooled| {
                let tx = pooled.begin_write()?;
                tx.prepare_cached(&inner.sql.save)?.execute(params![
                    metadata.persistence_id,
                    metadata.sequence_nr,
                    timestamp,
                    encoded.manifest,
                    encoded.data,
                    encoded.serializer_id,
                ])?;
                tx.commit()?;
                debug!(
                    persistence_id = %metadata.persistence_id,
                    sequence_nr = metadata.sequence_nr,
                    "snapshot saved"
                );
                Ok(())
            }))
            .await
    }

    /// Latest snapshot of `persistence_id` matching `criteria`.
    pub async fn load(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<SelectedSnapshot>> {
        let inner = self.inner.clone();
        let persistence_id = persistence_id.to_string();

        self.inner
            .breaker
            .call(self.inner.pool.run(move |pooled| {
                let tx = pooled.begin_read()?;
                let row = tx
                    .prepare_cached(&inner.sql.load)?
                    .query_row(
                        params![
                            persistence_id,
                            criteria.max_sequence_nr,
                            criteria.max_timestamp,
                            criteria.min_sequence_nr,
                            criteria.min_timestamp,
                        ],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, String>(3)?,
                                read_payload(row, 4)?,
                                row.get::<_, Option<i32>>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                tx.commit()?;

                let Some((pid, sequence_nr, timestamp, manifest, payload, serializer_id)) = row
                else {
                    return Ok(None);
                };
                let snapshot = inner.codec.decode(payload, &manifest, serializer_id)?;
                Ok(Some(SelectedSnapshot {
                    metadata: SnapshotMetadata {
                        persistence_id: pid,
                        sequence_nr,
                        timestamp,
                    },
                    snapshot,
                }))
            }))
            .await
    }

    /// Deletes one snapshot. A non-zero timestamp must match as well.
    pub async fn delete(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let inner = self.inner.clone();
        let metadata = metadata.clone();

        self.inner
            .breaker
            .call(self.inner.pool.run(move |pooled| {
                let tx = pooled.begin_write()?;
                tx.prepare_cached(&inner.sql.delete)?.execute(params![
                    metadata.persistence_id,
                    metadata.sequence_nr,
                    metadata.timestamp,
                ])?;
                tx.commit()?;
                Ok(())
            }))
            .await
    }

    /// Deletes every snapshot of `persistence_id` matching `criteria`.
    pub async fn delete_many(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let persistence_id = persistence_id.to_string();

        self.inner
            .breaker
            .call(self.inner.pool.run(move |pooled| {
                let tx = pooled.begin_write()?;
                let deleted = tx.prepare_cached(&inner.sql.delete_many)?.execute(params![
                    persistence_id,
                    criteria.max_sequence_nr,
                    criteria.max_timestamp,
                    criteria.min_sequence_nr,
                    criteria.min_timestamp,
                ])?;
                tx.commit()?;
                debug!(persistence_id = %persistence_id, deleted, "snapshots deleted");
                Ok(())
            }))
            .await
    }
}
