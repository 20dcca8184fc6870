//! # Error Handling for the SQL Journal
//!
//! A single error enum ([`Error`]) covers every failure mode of the journal,
//! the snapshot store and their configuration. Callers match on the variant to
//! decide whether a failure is worth retrying.
//!
//! ## Error Categories
//!
//! | Category | Variants | Scope | Typical Response |
//! |----------|----------|-------|------------------|
//! | Startup | `Configuration` | whole journal | Fix config, restart |
//! | Caller data | `Conflict`, `Serialization`, `InvalidRequest` | one operation | Resequence or fix payload |
//! | Transient | `Connection`, `Sqlite` | whole batch | Back off, retry later |
//! | Flow control | `BufferOverflow`, `CircuitOpen` | one submission | Back off |
//! | Lifecycle | `Cancelled`, `Closed` | one operation | Caller decides |
//!
//! ## Batch Scope
//!
//! The batching engine shares one database transaction between operations of
//! different streams. Operation-scoped errors ([`Error::is_operation_scoped`])
//! are isolated to the offending operation with a savepoint. Everything else
//! aborts the transaction and every operation in the batch receives the same
//! [`Error::Connection`] message.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in journal and snapshot store operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup
    // =========================================================================

    /// Settings could not be parsed or failed validation.
    ///
    /// Raised while building settings or opening the journal, never per write.
    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Operation-scoped (isolated to the offending request)
    // =========================================================================

    /// A row with the same `(persistence_id, sequence_nr)` already exists.
    ///
    /// # When This Happens
    ///
    /// Two writers raced to persist the same sequence number of one stream, or
    /// a caller replayed a write that was already committed.
    ///
    /// # Recovery
    ///
    /// Permanent for this write. Read the highest sequence number, resequence
    /// and submit again if the domain allows it.
    #[error("conflict on '{persistence_id}': sequence number {sequence_nr} already exists")]
    Conflict {
        /// Stream that already holds the sequence number
        persistence_id: String,
        /// The duplicated sequence number
        sequence_nr: i64,
    },

    /// Payload could not be encoded or decoded.
    ///
    /// Unknown serializer ids, manifests no serializer understands and
    /// malformed stored payloads all end up here.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A request was malformed before it reached the database.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller cancelled the operation before it was committed.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Transient (reported to every operation of a batch)
    // =========================================================================

    /// The database was unavailable or the batch transaction was aborted.
    #[error("connection error: {0}")]
    Connection(String),

    /// A SQLite call failed outside of a batch.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // =========================================================================
    // Flow control and lifecycle
    // =========================================================================

    /// The engine buffer is full. This is backpressure: nothing was queued.
    #[error("journal buffer is full ({capacity} pending operations)")]
    BufferOverflow {
        /// Configured `max-buffer-size`
        capacity: usize,
    },

    /// The circuit breaker is open and the call was rejected without running.
    #[error("circuit breaker is open, call rejected")]
    CircuitOpen,

    /// The journal has shut down and no longer accepts requests.
    #[error("journal has shut down")]
    Closed,
}

impl Error {
    /// Returns true when the error belongs to a single operation and must not
    /// abort the transaction it shares with other operations.
    pub fn is_operation_scoped(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::Serialization(_)
                | Error::InvalidRequest(_)
                | Error::Cancelled
        )
    }

    /// Returns true when the error should count against a circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Sqlite(_))
    }

    /// Builds the uniform error handed to every operation of a failed batch.
    pub(crate) fn batch_failed(cause: &Error) -> Error {
        match cause {
            Error::Connection(msg) => Error::Connection(msg.clone()),
            other => Error::Connection(format!("batch aborted: {other}")),
        }
    }
}

/// Returns true if the SQLite error is a unique or primary key violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let conflict = Error::Conflict {
            persistence_id: "p-1".to_string(),
            sequence_nr: 3,
        };
        assert_eq!(
            conflict.to_string(),
            "conflict on 'p-1': sequence number 3 already exists"
        );

        let overflow = Error::BufferOverflow { capacity: 10 };
        assert_eq!(
            overflow.to_string(),
            "journal buffer is full (10 pending operations)"
        );

        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.is_transient());
        assert!(!our_err.is_operation_scoped());
    }

    #[test]
    fn test_batch_failed_is_uniform_connection_error() {
        let cause = Error::Sqlite(rusqlite::Error::InvalidQuery);
        let first = Error::batch_failed(&cause);
        let second = Error::batch_failed(&cause);

        assert!(matches!(first, Error::Connection(_)));
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b INTEGER, UNIQUE (a, b))")
            .unwrap();
        conn.execute("INSERT INTO t VALUES (1, 1)", []).unwrap();

        let err = conn.execute("INSERT INTO t VALUES (1, 1)", []).unwrap_err();
        assert!(is_unique_violation(&err));

        let err = conn.execute("INSERT INTO missing VALUES (1)", []).unwrap_err();
        assert!(!is_unique_violation(&err));
    }
}
