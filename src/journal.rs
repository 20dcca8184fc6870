//! # Journal API
//!
//! [`Journal`] is the public async handle to the event journal. It encodes
//! payloads on the caller's task, hands operations to the batching engine
//! and wraps every call in the journal's circuit breaker.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Async callers                          │
//! │   write ─┐   delete ─┐   read_highest ─┐   replay / tags ─┐  │
//! └──────────┼───────────┼─────────────────┼──────────────────┼──┘
//!            │ encode    │                 │                  │
//!            ▼           ▼                 ▼                  ▼
//!        ┌────────────────────── circuit breaker ─────────────────┐
//!        └──────────────────────────┬─────────────────────────────┘
//!                                   ▼
//!                      ┌──────────────────────────┐
//!                      │  engine thread           │  buffer, batches,
//!                      │  (current-thread runtime)│  immediate reads
//!                      └────────────┬─────────────┘
//!                                   ▼
//!                      pooled SQLite connections (spawn_blocking)
//! ```
//!
//! The handle is `Clone + Send + Sync`; every clone talks to the same engine.
//!
//! # Example
//!
//! ```rust,ignore
//! let journal = Journal::open(settings, Arc::new(SerializerRegistry::new())).await?;
//!
//! let event = PersistentRepr::new("account-1", 1, Payload::new(&Opened { owner })?)
//!     .with_tags(["accounts"]);
//! let written = journal.write(AtomicWrite::single(event)?).await?;
//!
//! let events = journal.replay_messages("account-1", 1, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::join_all;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batching::{spawn_engine, EngineHandle, EngineLimits};
use crate::breaker::{CallPermit, CircuitBreaker};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolOptions};
use crate::query::QueryExecutor;
use crate::schema::{check_stored_as, initialize_journal};
use crate::serialization::SerializerRegistry;
use crate::settings::JournalSettings;
use crate::types::{AtomicWrite, PersistentRepr, TagReplay, TaggedEvent, WriteResult};

struct JournalInner {
    settings: JournalSettings,
    executor: Arc<QueryExecutor>,
    engine: EngineHandle,
    breaker: CircuitBreaker,
}

/// Async handle to the event journal.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

impl Journal {
    /// Opens the journal and starts its engine thread.
    ///
    /// Creates the journal tables first when `auto-initialize` is set. Fails
    /// with [`Error::Configuration`] when the serializer registry is
    /// inconsistent or SQLite cannot store the configured `stored-as` format.
    pub async fn open(settings: JournalSettings, registry: Arc<SerializerRegistry>) -> Result<Self> {
        registry.validate()?;
        let pool = ConnectionPool::new(PoolOptions::from(&settings));

        let init = settings.clone();
        pool.run(move |pooled| {
            let conn = pooled.connection()?;
            check_stored_as(conn, init.stored_as())?;
            if init.auto_initialize() {
                initialize_journal(conn, &init)?;
            }
            Ok(())
        })
        .await?;

        let executor = Arc::new(QueryExecutor::new(&settings, registry));
        let engine = spawn_engine(
            pool,
            executor.clone(),
            EngineLimits {
                max_batch_size: settings.max_batch_size(),
                max_buffer_size: settings.max_buffer_size(),
                max_concurrent_operations: settings.max_concurrent_operations(),
            },
        )?;

        info!(
            path = settings.connection_string(),
            table = settings.table_name(),
            stored_as = %settings.stored_as(),
            "journal started"
        );

        Ok(Self {
            inner: Arc::new(JournalInner {
                breaker: CircuitBreaker::new("journal", settings.circuit_breaker()),
                settings,
                executor,
                engine,
            }),
        })
    }

    pub fn settings(&self) -> &JournalSettings {
        &self.inner.settings
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Write operations currently waiting in the engine buffer.
    pub fn buffered(&self) -> usize {
        self.inner.engine.buffered()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persists an atomic write. All of its events are stored or none.
    pub async fn write(&self, write: AtomicWrite) -> Result<WriteResult> {
        self.write_cancellable(write, CancellationToken::new()).await
    }

    /// Like [`Journal::write`]; cancelling `token` before the write commits
    /// leaves the journal untouched and yields [`Error::Cancelled`].
    pub async fn write_cancellable(
        &self,
        write: AtomicWrite,
        token: CancellationToken,
    ) -> Result<WriteResult> {
        let encoded = self.inner.executor.encode(&write)?;
        self.inner
            .breaker
            .call(self.inner.engine.insert(encoded, token))
            .await
    }

    /// Submits several atomic writes at once and returns one result per write,
    /// in input order. Writes of one stream are applied in input order.
    pub async fn write_many(&self, writes: Vec<AtomicWrite>) -> Vec<Result<WriteResult>> {
        join_all(writes.into_iter().map(|write| self.write(write))).await
    }

    /// Deletes events of `persistence_id` up to and including
    /// `to_sequence_nr`. The stream's highest sequence number is preserved.
    pub async fn delete_messages_to(&self, persistence_id: &str, to_sequence_nr: i64) -> Result<()> {
        self.delete_messages_to_cancellable(persistence_id, to_sequence_nr, CancellationToken::new())
            .await
    }

    pub async fn delete_messages_to_cancellable(
        &self,
        persistence_id: &str,
        to_sequence_nr: i64,
        token: CancellationToken,
    ) -> Result<()> {
        self.inner
            .breaker
            .call(
                self.inner
                    .engine
                    .delete_to(persistence_id.to_string(), to_sequence_nr, token),
            )
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Highest sequence number ever written to `persistence_id`, 0 if none.
    /// Sees every write of the stream submitted before it.
    pub async fn read_highest_sequence_nr(&self, persistence_id: &str) -> Result<i64> {
        self.inner
            .breaker
            .call(self.inner.engine.read_highest(persistence_id.to_string()))
            .await
    }

    /// Events of `persistence_id` in `[from, to]`, ascending, at most `max`.
    pub async fn replay_messages(
        &self,
        persistence_id: &str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
        max: i64,
    ) -> Result<Vec<PersistentRepr>> {
        let engine = &self.inner.engine;
        self.inner
            .breaker
            .call(async {
                let mut events = engine.replay_range(
                    persistence_id.to_string(),
                    from_sequence_nr,
                    to_sequence_nr,
                    max,
                    CancellationToken::new(),
                )?;
                let mut replayed = Vec::new();
                while let Some(event) = events.recv().await {
                    replayed.push(event?);
                }
                Ok(replayed)
            })
            .await
    }

    /// Streaming form of [`Journal::replay_messages`]. Dropping the stream or
    /// cancelling `token` stops the underlying query.
    pub fn replay_stream(
        &self,
        persistence_id: &str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
        max: i64,
        token: CancellationToken,
    ) -> Result<ReplayStream> {
        let permit = self.inner.breaker.admit()?;
        let events = self.inner.engine.replay_range(
            persistence_id.to_string(),
            from_sequence_nr,
            to_sequence_nr,
            max,
            token,
        )?;
        Ok(ReplayStream {
            events,
            permit: Some(permit),
        })
    }

    /// Up to `max` events tagged `tag` with ordering above `from_offset`,
    /// ascending, plus the offset to pass for the next page.
    ///
    /// The returned offset is the ordering of the last event on this page, or
    /// `from_offset` when the page is empty. It never skips past events the
    /// page did not return, so it is not the highest ordering of the tag.
    ///
    /// With the delimited tag layout, a tag containing `;` is rejected with
    /// [`Error::InvalidRequest`].
    pub async fn events_by_tag(&self, tag: &str, from_offset: i64, max: i64) -> Result<TagReplay> {
        self.inner.executor.check_tag_query(tag)?;
        let engine = &self.inner.engine;
        self.inner
            .breaker
            .call(async {
                let (mut events, offset) =
                    engine.replay_tag(tag.to_string(), from_offset, max, CancellationToken::new())?;
                let mut replayed = Vec::new();
                while let Some(event) = events.recv().await {
                    replayed.push(event);
                }
                let max_ordering = offset.await.map_err(|_| Error::Closed)??;
                Ok(TagReplay {
                    events: replayed,
                    max_ordering,
                })
            })
            .await
    }

    /// Streaming form of [`Journal::events_by_tag`].
    pub fn events_by_tag_stream(
        &self,
        tag: &str,
        from_offset: i64,
        max: i64,
        token: CancellationToken,
    ) -> Result<TaggedStream> {
        self.inner.executor.check_tag_query(tag)?;
        let permit = self.inner.breaker.admit()?;
        let (events, offset) = self
            .inner
            .engine
            .replay_tag(tag.to_string(), from_offset, max, token)?;
        Ok(TaggedStream {
            events,
            offset: Some(offset),
            max_ordering: from_offset,
            permit: Some(permit),
        })
    }

    /// Every persistence id known to the journal, including streams whose
    /// events were all deleted.
    pub async fn persistence_ids(&self) -> Result<Vec<String>> {
        self.inner
            .breaker
            .call(self.inner.engine.persistence_ids())
            .await
    }

    /// Stops accepting work and waits until buffered and in-flight operations
    /// have completed. Later calls fail with [`Error::Closed`].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.engine.shutdown().await
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Reports the first outcome of a stream to the breaker: the first event,
/// the first error, or the end of the stream.
fn settle_permit<T>(permit: &mut Option<CallPermit>, item: &Option<Result<T>>) {
    if let Some(permit) = permit.take() {
        match item {
            Some(Err(e)) => permit.record_error(e),
            _ => permit.record_success(),
        }
    }
}

/// Events of one stream, ascending by sequence number.
pub struct ReplayStream {
    events: mpsc::Receiver<Result<PersistentRepr>>,
    permit: Option<CallPermit>,
}

impl Stream for ReplayStream {
    type Item = Result<PersistentRepr>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let item = match this.events.poll_recv(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };
        settle_permit(&mut this.permit, &item);
        Poll::Ready(item)
    }
}

/// Events carrying one tag, ascending by ordering.
///
/// After the stream ends, [`TaggedStream::max_ordering`] is the offset to
/// resume from.
pub struct TaggedStream {
    events: mpsc::Receiver<TaggedEvent>,
    offset: Option<oneshot::Receiver<Result<i64>>>,
    max_ordering: i64,
    permit: Option<CallPermit>,
}

impl TaggedStream {
    pub fn max_ordering(&self) -> i64 {
        self.max_ordering
    }
}

impl Stream for TaggedStream {
    type Item = Result<TaggedEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.max_ordering = event.ordering;
                if let Some(permit) = this.permit.take() {
                    permit.record_success();
                }
                return Poll::Ready(Some(Ok(event)));
            }
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        let Some(offset) = this.offset.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(offset).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.offset = None;
                let item = match result {
                    Ok(Ok(max_ordering)) => {
                        this.max_ordering = max_ordering;
                        None
                    }
                    Ok(Err(e)) => Some(Err(e)),
                    Err(_) => Some(Err(Error::Closed)),
                };
                settle_permit(&mut this.permit, &item);
                Poll::Ready(item)
            }
        }
    }
}
