//! # sqljournal - Batching SQL Event Journal
//!
//! An append-only event journal and snapshot store for actor persistence,
//! built on SQLite. It provides:
//!
//! - **Per-stream ordering**: writes of one persistence id apply in submission order
//! - **Batched writes**: many streams share one transaction, one savepoint each
//! - **Tag queries**: cross-stream replay by tag with a resumable offset
//! - **Snapshots**: latest-matching-criteria load, upsert on save
//! - **Pluggable payloads**: binary, JSON text or JSONB columns
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Journal / SnapshotStore (async handles)              │
//! │                  wrapped by a circuit breaker                   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Batching Engine                           │
//! │            (dedicated thread, current-thread runtime)           │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │ FIFO buffer │  │  SAVEPOINT  │  │  in-flight streams      │  │
//! │  │  + batches  │  │  per op     │  │  (one batch per stream) │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Query Executor  →  pooled SQLite connections           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Uniqueness**: `(persistence_id, sequence_nr)` is never stored twice
//! 2. **Stream order**: a stream's writes commit in the order they were submitted
//! 3. **Durable high-water mark**: deleting events never lowers a stream's highest sequence number
//! 4. **One reply**: every accepted request gets exactly one terminal result
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`settings`]: TOML configuration and validated settings
//! - [`types`]: events, atomic writes, snapshot metadata and criteria
//! - [`serialization`]: payloads, the `Serializer` trait and its registry
//! - [`codec`]: `stored-as` column codecs
//! - [`schema`]: DDL and table initialization
//! - [`journal`]: the journal handle (main entry point)
//! - [`snapshot`]: the snapshot store handle
//! - [`breaker`]: circuit breaker around public calls
//! - [`extension`]: starts journal and snapshot store from one config

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for journal and snapshot operations.
pub mod error;

/// Configuration parsing and validation.
pub mod settings;

/// Domain types for events and snapshots.
pub mod types;

/// Logical payloads and the serializer registry.
pub mod serialization;

/// Storage encodings for payload columns.
pub mod codec;

/// SQLite DDL and table initialization.
pub mod schema;

/// Tag storage strategies.
mod tags;

/// Pooled SQLite connections gated by a semaphore.
mod pool;

/// Parameterized journal statements.
mod query;

/// The batching engine.
///
/// Buffers writes and deletes, groups them into transactions with one
/// savepoint per operation and keeps at most one batch in flight per stream.
mod batching;

/// Circuit breaker for public calls.
pub mod breaker;

/// Async journal API.
pub mod journal;

/// Snapshot store.
pub mod snapshot;

/// Startup of journal and snapshot store from one configuration.
pub mod extension;

// =============================================================================
// Re-exports
// =============================================================================

pub use breaker::{BreakerMetricsSnapshot, BreakerState, CallPermit, CircuitBreaker};
pub use error::{Error, Result};
pub use extension::SqlPersistence;
pub use journal::{Journal, ReplayStream, TaggedStream};
pub use serialization::{JsonSerializer, Payload, Serializer, SerializerRegistry, JSON_SERIALIZER_ID};
pub use settings::{
    CircuitBreakerConfig, IsolationLevel, JournalConfig, JournalSettings, PersistenceConfig,
    SnapshotStoreConfig, SnapshotStoreSettings, StoredAs, TagStorage,
};
pub use snapshot::SnapshotStore;
pub use types::{
    AtomicWrite, PersistentRepr, SelectedSnapshot, SnapshotMetadata, SnapshotSelectionCriteria,
    TagReplay, TaggedEvent, WriteResult, MAX_SEQUENCE_NR,
};
