//! # Batching Engine
//!
//! The engine is the single scheduler between callers and the database. It
//! runs on a dedicated thread with its own current-thread runtime and owns the
//! buffer of pending writes.
//!
//! ## Why batch?
//!
//! Every SQLite commit is an fsync. Coalescing writes of many streams into one
//! transaction amortizes it:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ w1 → BEGIN → COMMIT      │     │ BEGIN IMMEDIATE          │
//! │ w2 → BEGIN → COMMIT      │     │   SAVEPOINT op_0  (w1)   │
//! │ w3 → BEGIN → COMMIT      │     │   SAVEPOINT op_1  (w2)   │
//! │ ...                      │     │   SAVEPOINT op_2  (w3)   │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Scheduling
//!
//! ```text
//!  callers ──Submit──► ┌────────────────────────────┐
//!                      │ buffer (FIFO, ≤ max-buffer) │
//!                      └──────────────┬─────────────┘
//!                                     │ drain ≤ max-batch-size, skipping
//!                                     │ streams with a batch in flight
//!                                     ▼
//!                      ≤ max-concurrent-operations batches
//!                      each: pool permit → BEGIN → SAVEPOINT per op → COMMIT
//!                                     │
//!                         completion ─┘ releases streams, triggers next drain
//! ```
//!
//! Writes and deletes are always buffered. A highest-sequence-number read is
//! buffered only when its stream still has buffered or in-flight work, so a
//! stream always reads its own writes. Replays and the persistence id query
//! run immediately on the same pool.
//!
//! ## Failure scope
//!
//! | Failure | Scope |
//! |---------|-------|
//! | duplicate `(persistence_id, sequence_nr)` | `ROLLBACK TO` the op's savepoint, only that op gets `Conflict` |
//! | cancellation observed inside the batch | op's savepoint rolled back, op gets `Cancelled` |
//! | caller dropped its future | op purged, or skipped inside the batch like a cancellation |
//! | any other SQL error, failed `COMMIT`, no connection | whole transaction rolled back, every op gets the same `Connection` error |
//!
//! ## Invariants
//!
//! - Operations of one stream are applied in submission order, never
//!   concurrently.
//! - Every accepted submission receives exactly one terminal reply.
//! - Nothing is buffered beyond `max-buffer-size`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::{EncodedWrite, QueryExecutor};
use crate::types::{PersistentRepr, TaggedEvent, WriteResult};

/// Capacity of the per-replay channel between the database thread and the
/// consumer.
pub(crate) const REPLAY_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Operations
// =============================================================================

/// A unit of work together with its reply channel.
pub(crate) enum BatchOperation {
    /// Atomic multi-event write of one stream.
    InsertMany {
        write: EncodedWrite,
        response: oneshot::Sender<Result<WriteResult>>,
    },

    /// Delete a stream's events up to a sequence number.
    DeleteTo {
        persistence_id: String,
        to_sequence_nr: i64,
        response: oneshot::Sender<Result<()>>,
    },

    /// Highest sequence number of a stream.
    ReadHighest {
        persistence_id: String,
        response: oneshot::Sender<Result<i64>>,
    },

    /// Stream a sequence range of one stream. Errors arrive as the last item.
    ReplayRange {
        persistence_id: String,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
        max: i64,
        sink: mpsc::Sender<Result<PersistentRepr>>,
    },

    /// Stream events carrying a tag. The resume offset (or the error) arrives
    /// on `response` once the sink is closed.
    ReplayTag {
        tag: String,
        from_offset: i64,
        max: i64,
        sink: mpsc::Sender<TaggedEvent>,
        response: oneshot::Sender<Result<i64>>,
    },

    /// All persistence ids.
    PersistenceIds {
        response: oneshot::Sender<Result<Vec<String>>>,
    },
}

/// Value produced by a buffered operation inside a batch.
enum OpValue {
    Written(WriteResult),
    Deleted,
    Highest(i64),
}

/// A submitted operation.
pub(crate) struct PendingOperation {
    id: u64,
    token: CancellationToken,
    op: BatchOperation,
}

impl PendingOperation {
    /// Stream whose per-stream ordering this operation participates in.
    fn stream(&self) -> Option<&str> {
        match &self.op {
            BatchOperation::InsertMany { write, .. } => Some(&write.persistence_id),
            BatchOperation::DeleteTo { persistence_id, .. }
            | BatchOperation::ReadHighest { persistence_id, .. } => Some(persistence_id),
            _ => None,
        }
    }

    fn is_write(&self) -> bool {
        matches!(
            self.op,
            BatchOperation::InsertMany { .. } | BatchOperation::DeleteTo { .. }
        )
    }

    /// Whether this operation occupies a buffer slot.
    fn counts_against_buffer(&self) -> bool {
        self.stream().is_some()
    }

    /// Replies with `err`.
    fn fail(self, err: Error) {
        match self.op {
            BatchOperation::InsertMany { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchOperation::DeleteTo { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchOperation::ReadHighest { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchOperation::ReplayRange { sink, .. } => {
                let _ = sink.try_send(Err(err));
            }
            BatchOperation::ReplayTag { response, .. } => {
                let _ = response.send(Err(err));
            }
            BatchOperation::PersistenceIds { response } => {
                let _ = response.send(Err(err));
            }
        }
    }

    /// Replies with the outcome of a committed batch.
    fn complete(self, result: Result<OpValue>) {
        match (self.op, result) {
            (BatchOperation::InsertMany { response, .. }, Ok(OpValue::Written(written))) => {
                let _ = response.send(Ok(written));
            }
            (BatchOperation::DeleteTo { response, .. }, Ok(OpValue::Deleted)) => {
                let _ = response.send(Ok(()));
            }
            (BatchOperation::ReadHighest { response, .. }, Ok(OpValue::Highest(n))) => {
                let _ = response.send(Ok(n));
            }
            (op, Ok(_)) => PendingOperation {
                id: self.id,
                token: self.token,
                op,
            }
            .fail(Error::InvalidRequest(
                "operation produced a mismatched result".to_string(),
            )),
            (op, Err(err)) => PendingOperation {
                id: self.id,
                token: self.token,
                op,
            }
            .fail(err),
        }
    }

    /// Runs a buffered operation against the batch transaction.
    fn run(&self, conn: &Connection, executor: &QueryExecutor) -> Result<OpValue> {
        match &self.op {
            BatchOperation::InsertMany { write, .. } => {
                executor.insert(conn, write).map(OpValue::Written)
            }
            BatchOperation::DeleteTo {
                persistence_id,
                to_sequence_nr,
                ..
            } => executor
                .delete_to(conn, persistence_id, *to_sequence_nr)
                .map(|_| OpValue::Deleted),
            BatchOperation::ReadHighest { persistence_id, .. } => executor
                .highest_sequence_nr(conn, persistence_id)
                .map(OpValue::Highest),
            _ => Err(Error::InvalidRequest(
                "reads cannot run inside a write batch".to_string(),
            )),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Messages accepted by the engine thread.
pub(crate) enum JournalRequest {
    Submit(PendingOperation),
    /// Drop a buffered operation whose caller cancelled.
    Purge { id: u64 },
    /// Finish everything buffered and in flight, then stop.
    Shutdown { ack: oneshot::Sender<()> },
}

enum Completion {
    Batch { streams: Vec<String> },
    Read,
}

/// Engine limits derived from journal settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineLimits {
    pub max_batch_size: usize,
    pub max_buffer_size: usize,
    pub max_concurrent_operations: usize,
}

// =============================================================================
// Engine
// =============================================================================

struct Engine {
    executor: Arc<QueryExecutor>,
    pool: ConnectionPool,
    limits: EngineLimits,
    buffer: VecDeque<PendingOperation>,
    /// Streams with a batch in flight.
    in_flight: HashSet<String>,
    running_batches: usize,
    running_reads: usize,
    /// Buffer slots taken, shared with handles for the overflow check.
    buffered: Arc<AtomicUsize>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    closing: bool,
}

impl Engine {
    fn release_slot(&self) {
        self.buffered.fetch_sub(1, Ordering::AcqRel);
    }

    fn accept(&mut self, pending: PendingOperation) {
        let counted = pending.counts_against_buffer();
        if self.closing {
            if counted {
                self.release_slot();
            }
            pending.fail(Error::Closed);
            return;
        }

        let must_queue = match &pending.op {
            BatchOperation::InsertMany { .. } | BatchOperation::DeleteTo { .. } => true,
            BatchOperation::ReadHighest { persistence_id, .. } => {
                self.in_flight.contains(persistence_id)
                    || self
                        .buffer
                        .iter()
                        .any(|queued| queued.stream() == Some(persistence_id.as_str()))
            }
            _ => false,
        };

        if must_queue {
            self.buffer.push_back(pending);
        } else {
            if counted {
                self.release_slot();
            }
            self.dispatch_read(pending);
        }
    }

    fn purge(&mut self, id: u64) {
        if let Some(index) = self.buffer.iter().position(|p| p.id == id) {
            if let Some(pending) = self.buffer.remove(index) {
                self.release_slot();
                debug!(id, "cancelled operation removed from buffer");
                pending.fail(Error::Cancelled);
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Batch { streams } => {
                for stream in streams {
                    self.in_flight.remove(&stream);
                }
                self.running_batches -= 1;
            }
            Completion::Read => self.running_reads -= 1,
        }
    }

    /// Starts batches while there is buffered work and batch capacity.
    fn flush(&mut self) {
        while self.running_batches < self.limits.max_concurrent_operations
            && !self.buffer.is_empty()
        {
            let batch = self.drain_batch();
            if batch.is_empty() {
                break;
            }
            self.dispatch_batch(batch);
        }
    }

    /// Takes up to `max-batch-size` operations FIFO, leaving behind those
    /// whose stream is already in flight.
    fn drain_batch(&mut self) -> Vec<PendingOperation> {
        let mut batch = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.buffer.len());

        while let Some(pending) = self.buffer.pop_front() {
            if batch.len() >= self.limits.max_batch_size {
                remaining.push_back(pending);
                remaining.extend(self.buffer.drain(..));
                break;
            }
            if pending.token.is_cancelled() {
                self.release_slot();
                pending.fail(Error::Cancelled);
                continue;
            }
            let busy = pending
                .stream()
                .map(|s| self.in_flight.contains(s))
                .unwrap_or(false);
            if busy {
                remaining.push_back(pending);
            } else {
                self.release_slot();
                batch.push(pending);
            }
        }

        self.buffer = remaining;
        batch
    }

    fn dispatch_batch(&mut self, batch: Vec<PendingOperation>) {
        let streams: Vec<String> = batch
            .iter()
            .filter_map(|p| p.stream().map(str::to_string))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for stream in &streams {
            self.in_flight.insert(stream.clone());
        }
        self.running_batches += 1;

        debug!(
            operations = batch.len(),
            streams = streams.len(),
            buffered = self.buffer.len(),
            "flushing batch"
        );

        let pool = self.pool.clone();
        let executor = self.executor.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            execute_batch(pool, executor, batch).await;
            let _ = completions.send(Completion::Batch { streams });
        });
    }

    fn dispatch_read(&mut self, pending: PendingOperation) {
        self.running_reads += 1;

        let pool = self.pool.clone();
        let executor = self.executor.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            execute_read(pool, executor, pending).await;
            let _ = completions.send(Completion::Read);
        });
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.running_batches == 0 && self.running_reads == 0
    }
}

// =============================================================================
// Batch Execution
// =============================================================================

/// Executes one batch and replies to every operation in it.
async fn execute_batch(
    pool: ConnectionPool,
    executor: Arc<QueryExecutor>,
    batch: Vec<PendingOperation>,
) {
    let pooled = match pool.acquire().await {
        Ok(pooled) => pooled,
        Err(e) => {
            fail_batch(batch, &e);
            return;
        }
    };

    let joined = tokio::task::spawn_blocking(move || {
        let mut pooled = pooled;
        match run_batch(&mut pooled, &executor, &batch) {
            Ok(results) => {
                for (pending, result) in batch.into_iter().zip(results) {
                    pending.complete(result);
                }
            }
            Err(e) => {
                pooled.discard();
                fail_batch(batch, &e);
            }
        }
    })
    .await;

    if let Err(e) = joined {
        // The operations were dropped with the task, so their callers see a
        // closed reply channel.
        warn!(error = %e, "batch task failed");
    }
}

fn fail_batch(batch: Vec<PendingOperation>, cause: &Error) {
    warn!(operations = batch.len(), error = %cause, "batch failed");
    for pending in batch {
        pending.fail(Error::batch_failed(cause));
    }
}

/// Runs every operation in its own savepoint inside one transaction.
///
/// The outer `Err` is a batch-level failure. Inner results are per operation.
fn run_batch(
    pooled: &mut PooledConnection,
    executor: &QueryExecutor,
    batch: &[PendingOperation],
) -> Result<Vec<Result<OpValue>>> {
    let writes = batch.iter().any(PendingOperation::is_write);
    let tx = if writes {
        pooled.begin_write()?
    } else {
        pooled.begin_read()?
    };

    let mut results = Vec::with_capacity(batch.len());
    for (index, pending) in batch.iter().enumerate() {
        results.push(run_in_savepoint(&tx, executor, pending, index)?);
    }

    tx.commit()?;
    Ok(results)
}

fn run_in_savepoint(
    conn: &Connection,
    executor: &QueryExecutor,
    pending: &PendingOperation,
    index: usize,
) -> Result<Result<OpValue>> {
    if pending.token.is_cancelled() {
        return Ok(Err(Error::Cancelled));
    }

    let name = format!("op_{index}");
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;

    let outcome = match pending.run(conn, executor) {
        Ok(_) if pending.token.is_cancelled() => Err(Error::Cancelled),
        other => other,
    };

    match outcome {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(Ok(value))
        }
        Err(e) if e.is_operation_scoped() => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
            Ok(Err(e))
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Immediate Reads
// =============================================================================

async fn execute_read(pool: ConnectionPool, executor: Arc<QueryExecutor>, pending: PendingOperation) {
    let acquired = tokio::select! {
        acquired = pool.acquire() => acquired,
        _ = pending.token.cancelled() => {
            pending.fail(Error::Cancelled);
            return;
        }
    };
    let pooled = match acquired {
        Ok(pooled) => pooled,
        Err(e) => {
            pending.fail(e);
            return;
        }
    };

    let joined = tokio::task::spawn_blocking(move || {
        let mut pooled = pooled;
        run_read(&mut pooled, &executor, pending);
    })
    .await;

    if let Err(e) = joined {
        warn!(error = %e, "read task failed");
    }
}

fn run_read(pooled: &mut PooledConnection, executor: &QueryExecutor, pending: PendingOperation) {
    let token = pending.token;
    match pending.op {
        BatchOperation::ReadHighest {
            persistence_id,
            response,
        } => {
            let result = pooled.begin_read().and_then(|tx| {
                let highest = executor.highest_sequence_nr(&tx, &persistence_id)?;
                tx.commit()?;
                Ok(highest)
            });
            let _ = response.send(result);
        }
        BatchOperation::ReplayRange {
            persistence_id,
            from_sequence_nr,
            to_sequence_nr,
            max,
            sink,
        } => {
            let result = pooled.begin_read().and_then(|tx| {
                executor.replay_range(&tx, &persistence_id, from_sequence_nr, to_sequence_nr, max, |event| {
                    !token.is_cancelled() && sink.blocking_send(Ok(event)).is_ok()
                })
            });
            match result {
                Err(e) => {
                    let _ = sink.blocking_send(Err(e));
                }
                Ok(_) if token.is_cancelled() => {
                    let _ = sink.blocking_send(Err(Error::Cancelled));
                }
                Ok(count) => debug!(persistence_id = %persistence_id, count, "replay finished"),
            }
        }
        BatchOperation::ReplayTag {
            tag,
            from_offset,
            max,
            sink,
            response,
        } => {
            let result = pooled.begin_read().and_then(|tx| {
                executor.replay_by_tag(&tx, &tag, from_offset, max, |event| {
                    !token.is_cancelled() && sink.blocking_send(event).is_ok()
                })
            });
            drop(sink);
            let result = match result {
                Ok(_) if token.is_cancelled() => Err(Error::Cancelled),
                other => other,
            };
            let _ = response.send(result);
        }
        BatchOperation::PersistenceIds { response } => {
            let result = pooled.begin_read().and_then(|tx| executor.persistence_ids(&tx));
            let _ = response.send(result);
        }
        op @ (BatchOperation::InsertMany { .. } | BatchOperation::DeleteTo { .. }) => {
            PendingOperation { id: pending.id, token, op }.fail(Error::InvalidRequest(
                "writes must go through the batch buffer".to_string(),
            ));
        }
    }
}

// =============================================================================
// Engine Loop
// =============================================================================

async fn run_engine(
    mut engine: Engine,
    mut requests: mpsc::UnboundedReceiver<JournalRequest>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    let mut shutdown_ack: Option<oneshot::Sender<()>> = None;
    let mut requests_open = true;

    loop {
        tokio::select! {
            request = requests.recv(), if requests_open => match request {
                Some(JournalRequest::Submit(pending)) => engine.accept(pending),
                Some(JournalRequest::Purge { id }) => engine.purge(id),
                Some(JournalRequest::Shutdown { ack }) => {
                    info!(buffered = engine.buffer.len(), "journal shutting down");
                    engine.closing = true;
                    shutdown_ack = Some(ack);
                }
                None => {
                    // Every handle is gone.
                    engine.closing = true;
                    requests_open = false;
                }
            },
            Some(completion) = completions.recv() => engine.complete(completion),
        }

        engine.flush();

        if engine.closing && engine.is_idle() {
            break;
        }
    }

    // Late submissions that raced the shutdown.
    requests.close();
    while let Ok(request) = requests.try_recv() {
        match request {
            JournalRequest::Submit(pending) => engine.accept(pending),
            JournalRequest::Shutdown { ack } => {
                let _ = ack.send(());
            }
            JournalRequest::Purge { .. } => {}
        }
    }

    info!("journal stopped");
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cancels and purges a submitted operation whose caller stopped waiting.
struct Retract<'a> {
    tx: &'a mpsc::UnboundedSender<JournalRequest>,
    token: CancellationToken,
    id: u64,
    armed: bool,
}

impl Drop for Retract<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
            let _ = self.tx.send(JournalRequest::Purge { id: self.id });
            debug!(id = self.id, "caller went away, operation retracted");
        }
    }
}

/// Async handle to the engine thread.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<JournalRequest>,
    buffered: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    max_buffer_size: usize,
}

impl EngineHandle {
    /// Operations currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn enqueue(&self, op: BatchOperation, token: CancellationToken) -> Result<u64> {
        let pending = PendingOperation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token,
            op,
        };
        let id = pending.id;
        let counted = pending.counts_against_buffer();

        if counted {
            let previous = self.buffered.fetch_add(1, Ordering::AcqRel);
            if previous >= self.max_buffer_size {
                self.buffered.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::BufferOverflow {
                    capacity: self.max_buffer_size,
                });
            }
        }

        if self.tx.send(JournalRequest::Submit(pending)).is_err() {
            if counted {
                self.buffered.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(Error::Closed);
        }
        Ok(id)
    }

    /// Submits `op` and waits for its single reply. Cancelling `token` while
    /// the operation is still buffered removes it; a batch already running
    /// decides the outcome itself.
    ///
    /// Dropping the returned future before the reply arrives (a timeout, a
    /// lost `select!`) retracts the operation the same way, so it cannot
    /// commit behind the caller's back unless its savepoint already ran.
    async fn request<T>(
        &self,
        op: BatchOperation,
        token: CancellationToken,
        mut reply: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // The engine watches a child so retracting never cancels the
        // caller's own token.
        let op_token = token.child_token();
        let id = self.enqueue(op, op_token.clone())?;
        let mut retract = Retract {
            tx: &self.tx,
            token: op_token,
            id,
            armed: true,
        };

        tokio::select! {
            biased;
            result = &mut reply => {
                retract.armed = false;
                return result.map_err(|_| Error::Closed)?;
            }
            _ = token.cancelled() => {
                let _ = self.tx.send(JournalRequest::Purge { id });
            }
        }
        let result = reply.await;
        retract.armed = false;
        result.map_err(|_| Error::Closed)?
    }

    pub async fn insert(&self, write: EncodedWrite, token: CancellationToken) -> Result<WriteResult> {
        let (response, reply) = oneshot::channel();
        self.request(BatchOperation::InsertMany { write, response }, token, reply)
            .await
    }

    pub async fn delete_to(
        &self,
        persistence_id: String,
        to_sequence_nr: i64,
        token: CancellationToken,
    ) -> Result<()> {
        let (response, reply) = oneshot::channel();
        self.request(
            BatchOperation::DeleteTo {
                persistence_id,
                to_sequence_nr,
                response,
            },
            token,
            reply,
        )
        .await
    }

    pub async fn read_highest(&self, persistence_id: String) -> Result<i64> {
        let (response, reply) = oneshot::channel();
        self.request(
            BatchOperation::ReadHighest {
                persistence_id,
                response,
            },
            CancellationToken::new(),
            reply,
        )
        .await
    }

    pub async fn persistence_ids(&self) -> Result<Vec<String>> {
        let (response, reply) = oneshot::channel();
        self.request(
            BatchOperation::PersistenceIds { response },
            CancellationToken::new(),
            reply,
        )
        .await
    }

    /// Starts a range replay. Events and a trailing error, if any, arrive on
    /// the returned receiver.
    pub fn replay_range(
        &self,
        persistence_id: String,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
        max: i64,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<PersistentRepr>>> {
        let (sink, events) = mpsc::channel(REPLAY_CHANNEL_SIZE);
        self.enqueue(
            BatchOperation::ReplayRange {
                persistence_id,
                from_sequence_nr,
                to_sequence_nr,
                max,
                sink,
            },
            token,
        )?;
        Ok(events)
    }

    /// Starts a tag replay. Events arrive on the first receiver; the resume
    /// offset arrives on the second after the last event.
    pub fn replay_tag(
        &self,
        tag: String,
        from_offset: i64,
        max: i64,
        token: CancellationToken,
    ) -> Result<(mpsc::Receiver<TaggedEvent>, oneshot::Receiver<Result<i64>>)> {
        let (sink, events) = mpsc::channel(REPLAY_CHANNEL_SIZE);
        let (response, offset) = oneshot::channel();
        self.enqueue(
            BatchOperation::ReplayTag {
                tag,
                from_offset,
                max,
                sink,
                response,
            },
            token,
        )?;
        Ok((events, offset))
    }

    /// Stops accepting work, drains the buffer and waits for in-flight
    /// batches and reads.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(JournalRequest::Shutdown { ack }).is_err() {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }
}

/// Spawns the engine on a dedicated thread.
pub(crate) fn spawn_engine(
    pool: ConnectionPool,
    executor: Arc<QueryExecutor>,
    limits: EngineLimits,
) -> Result<EngineHandle> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Configuration(format!("failed to create engine runtime: {e}")))?;

    let (tx, requests) = mpsc::unbounded_channel();
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));

    let engine = Engine {
        executor,
        pool,
        limits,
        buffer: VecDeque::new(),
        in_flight: HashSet::new(),
        running_batches: 0,
        running_reads: 0,
        buffered: buffered.clone(),
        completions_tx,
        closing: false,
    };

    std::thread::Builder::new()
        .name("sqljournal-engine".to_string())
        .spawn(move || runtime.block_on(run_engine(engine, requests, completions)))
        .map_err(|e| Error::Configuration(format!("failed to spawn engine thread: {e}")))?;

    Ok(EngineHandle {
        tx,
        buffered,
        next_id: Arc::new(AtomicU64::new(1)),
        max_buffer_size: limits.max_buffer_size,
    })
}

// =============================================================================
// Tests
// =============================================================================
