//! # SQLite Schema for the Journal and Snapshot Store
//!
//! DDL is generated from validated settings so the initializer and the query
//! executor always agree on schema, table and column names. Every statement
//! uses `IF NOT EXISTS`, so initialization is idempotent and safe to run on
//! every start.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  event_journal                       metadata                           │
//! │  ┌───────────────────────────┐       ┌───────────────────────────┐      │
//! │  │ ordering (PK, identity)   │       │ persistence_id   (PK)     │      │
//! │  │ persistence_id ─┐ UNIQUE  │       │ sequence_nr      (PK)     │      │
//! │  │ sequence_nr    ─┘         │       └───────────────────────────┘      │
//! │  │ is_deleted, created_at    │        highest sequence number kept      │
//! │  │ manifest, serializer_id   │        after deletes                     │
//! │  │ payload, tags             │                                          │
//! │  └─────────────┬─────────────┘       snapshot_store                     │
//! │                │                     ┌───────────────────────────┐      │
//! │  event_journal_tags (array only)     │ persistence_id   (PK)     │      │
//! │  ┌─────────────▼─────────────┐       │ sequence_nr      (PK)     │      │
//! │  │ tag      (PK)             │       │ created_at, manifest      │      │
//! │  │ ordering (PK)             │       │ payload, serializer_id    │      │
//! │  └───────────────────────────┘       └───────────────────────────┘      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Identity
//!
//! `ordering` is always `INTEGER PRIMARY KEY AUTOINCREMENT`. A plain rowid
//! would hand out the highest ordering again once its row is deleted, and tag
//! queries resume from the last seen ordering. SQLite integers are 64-bit, so
//! `use-bigint-identity-for-ordering-column` selects the same column.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Error, Result};
use crate::settings::{JournalSettings, SnapshotStoreSettings, StoredAs, TagStorage};

// =============================================================================
// Identifiers
// =============================================================================

/// Quotes an identifier for SQLite, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

// =============================================================================
// DDL Builders
// =============================================================================

/// Statements creating the journal, metadata and (array layout) tag tables.
pub fn journal_ddl(settings: &JournalSettings) -> Vec<String> {
    let schema = settings.schema_name();
    let table = settings.table_name();
    let journal = qualified_name(schema, table);

    let ordering = "ordering       INTEGER PRIMARY KEY AUTOINCREMENT";
    let tags_type = match settings.tag_storage() {
        TagStorage::Array => "TEXT".to_string(),
        TagStorage::Delimited => format!("VARCHAR({})", settings.tags_column_size()),
    };

    let mut ddl = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {journal} (
    {ordering},
    persistence_id VARCHAR(255) NOT NULL,
    sequence_nr    INTEGER NOT NULL,
    is_deleted     BOOLEAN NOT NULL DEFAULT 0,
    created_at     INTEGER NOT NULL,
    manifest       VARCHAR(500) NOT NULL,
    payload        {payload} NOT NULL,
    tags           {tags_type} NULL,
    serializer_id  INTEGER NULL,
    CONSTRAINT {uq} UNIQUE (persistence_id, sequence_nr)
)",
            payload = settings.stored_as().column_type(),
            uq = quote_identifier(&format!("{table}_uq")),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (created_at)",
            qualified_name(schema, &format!("{table}_created_at_idx")),
            quote_identifier(table),
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    persistence_id VARCHAR(255) NOT NULL,
    sequence_nr    INTEGER NOT NULL,
    CONSTRAINT {} PRIMARY KEY (persistence_id, sequence_nr)
)",
            qualified_name(schema, settings.metadata_table_name()),
            quote_identifier(&format!("{}_pk", settings.metadata_table_name())),
        ),
    ];

    if settings.tag_storage() == TagStorage::Array {
        let tags_table = settings.tags_table_name();
        ddl.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (
    tag      VARCHAR(100) NOT NULL,
    ordering INTEGER NOT NULL,
    CONSTRAINT {} PRIMARY KEY (tag, ordering)
) WITHOUT ROWID",
            qualified_name(schema, &tags_table),
            quote_identifier(&format!("{tags_table}_pk")),
        ));
    }

    ddl
}

/// Statements creating the snapshot table and its indexes.
pub fn snapshot_ddl(settings: &SnapshotStoreSettings) -> Vec<String> {
    let schema = settings.schema_name();
    let table = settings.table_name();

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    persistence_id VARCHAR(255) NOT NULL,
    sequence_nr    INTEGER NOT NULL,
    created_at     INTEGER NOT NULL,
    manifest       VARCHAR(500) NOT NULL,
    payload        {} NOT NULL,
    serializer_id  INTEGER NULL,
    CONSTRAINT {} PRIMARY KEY (persistence_id, sequence_nr)
)",
            qualified_name(schema, table),
            settings.stored_as().column_type(),
            quote_identifier(&format!("{table}_pk")),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (sequence_nr)",
            qualified_name(schema, &format!("{table}_sequence_nr_idx")),
            quote_identifier(table),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (created_at)",
            qualified_name(schema, &format!("{table}_created_at_idx")),
            quote_identifier(table),
        ),
    ]
}

// =============================================================================
// Initialization
// =============================================================================

/// Creates the journal tables if they are missing.
pub fn initialize_journal(conn: &mut Connection, settings: &JournalSettings) -> Result<()> {
    run_ddl(conn, &journal_ddl(settings))?;
    info!(
        schema = settings.schema_name(),
        table = settings.table_name(),
        metadata = settings.metadata_table_name(),
        "journal schema initialized"
    );
    Ok(())
}

/// Creates the snapshot table if it is missing.
pub fn initialize_snapshot_store(
    conn: &mut Connection,
    settings: &SnapshotStoreSettings,
) -> Result<()> {
    run_ddl(conn, &snapshot_ddl(settings))?;
    info!(
        schema = settings.schema_name(),
        table = settings.table_name(),
        "snapshot schema initialized"
    );
    Ok(())
}

/// Fails when the linked SQLite cannot store payloads as `stored_as`.
pub fn check_stored_as(conn: &Connection, stored_as: StoredAs) -> Result<()> {
    let probe = match stored_as {
        StoredAs::ByteA => return Ok(()),
        StoredAs::Json => "SELECT json('{}')",
        StoredAs::JsonB => "SELECT json(jsonb('{}'))",
    };
    conn.query_row(probe, [], |row| row.get::<_, String>(0))
        .map(|_| ())
        .map_err(|e| {
            Error::Configuration(format!(
                "stored-as = {stored_as} is not supported by SQLite {}: {e}",
                rusqlite::version()
            ))
        })
}

fn run_ddl(conn: &mut Connection, statements: &[String]) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in statements {
        tx.execute_batch(statement)?;
    }
    tx.commit()?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
