//! # Connection Pool
//!
//! A small pool of SQLite connections gated by a counting semaphore. The
//! semaphore size is `max-concurrent-operations`: it bounds how many batches
//! and reads hold a connection at the same time. Batches and reads share the
//! one budget.
//!
//! ```text
//!  acquire() ──► semaphore permit (wait ≤ connection-timeout)
//!                   │
//!                   ▼
//!            idle connection? ── yes ──► reuse
//!                   │ no
//!                   ▼
//!            open lazily (WAL, busy_timeout)
//!
//!  drop(PooledConnection) ──► connection back to idle list, permit released
//! ```
//!
//! Connections are opened on the blocking thread that first uses them, so
//! the async side never touches the filesystem.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};
use crate::settings::{IsolationLevel, JournalSettings, SnapshotStoreSettings};

/// Pool parameters derived from journal or snapshot settings.
#[derive(Debug, Clone)]
pub(crate) struct PoolOptions {
    pub path: String,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub read_isolation: IsolationLevel,
    pub write_isolation: IsolationLevel,
}

impl From<&JournalSettings> for PoolOptions {
    fn from(settings: &JournalSettings) -> Self {
        Self {
            path: settings.connection_string().to_string(),
            max_connections: settings.max_concurrent_operations(),
            connection_timeout: settings.connection_timeout(),
            read_isolation: settings.read_isolation_level(),
            write_isolation: settings.write_isolation_level(),
        }
    }
}

impl From<&SnapshotStoreSettings> for PoolOptions {
    fn from(settings: &SnapshotStoreSettings) -> Self {
        Self {
            path: settings.connection_string().to_string(),
            max_connections: settings.max_concurrent_operations(),
            connection_timeout: settings.connection_timeout(),
            read_isolation: settings.read_isolation_level(),
            write_isolation: settings.write_isolation_level(),
        }
    }
}

struct PoolInner {
    options: PoolOptions,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// Shared handle to the pool.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_connections));
        Self {
            inner: Arc::new(PoolInner {
                options,
                idle: Mutex::new(Vec::new()),
                permits,
            }),
        }
    }

    /// Waits up to `connection-timeout` for a connection slot.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let timeout = self.inner.options.connection_timeout;
        let permit = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out after {timeout:?} waiting for a database connection"
                ))
            })?
            .map_err(|_| Error::Closed)?;

        Ok(self.checkout(permit))
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PooledConnection {
        let conn = self
            .inner
            .idle
            .lock()
            .map(|mut idle| idle.pop())
            .unwrap_or(None);

        PooledConnection {
            conn,
            pool: self.inner.clone(),
            discard: false,
            _permit: permit,
        }
    }

    /// Runs `f` on a pooled connection on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PooledConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut pooled = self.acquire().await?;
        tokio::task::spawn_blocking(move || f(&mut pooled))
            .await
            .map_err(|e| Error::Connection(format!("database task failed: {e}")))?
    }
}

/// A connection slot. Returns its connection to the pool on drop.
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The connection, opened on first use.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            self.conn = Some(open_connection(&self.pool.options)?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Connection("connection unavailable".to_string()))
    }

    /// Starts a write transaction at the configured isolation level.
    pub fn begin_write(&mut self) -> Result<Transaction<'_>> {
        let behavior = self.pool.options.write_isolation.write_behavior();
        Ok(self.connection()?.transaction_with_behavior(behavior)?)
    }

    /// Starts a read transaction at the configured isolation level.
    pub fn begin_read(&mut self) -> Result<Transaction<'_>> {
        let behavior = self.pool.options.read_isolation.read_behavior();
        Ok(self.connection()?.transaction_with_behavior(behavior)?)
    }

    /// Closes the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConnection {
    type Target = Option<Connection>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discard {
            debug!(path = %self.pool.options.path, "discarding pooled connection");
            return;
        }
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(conn);
        }
    }
}

fn open_connection(options: &PoolOptions) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        &options.path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| Error::Connection(format!("failed to open '{}': {e}", options.path)))?;

    conn.busy_timeout(options.connection_timeout)?;
    // WAL lets readers keep a snapshot while a batch is writing.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    if options.read_isolation.reads_uncommitted() {
        conn.pragma_update(None, "read_uncommitted", true)?;
    }

    debug!(path = %options.path, "opened database connection");
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
