//! # Journal and Snapshot Store Settings
//!
//! Configuration is read from TOML (kebab-case keys) into plain serde structs
//! ([`JournalConfig`], [`SnapshotStoreConfig`]), then validated once into
//! immutable settings ([`JournalSettings`], [`SnapshotStoreSettings`]). Only
//! validated settings reach the engine, the query executor and the schema
//! initializer, so all three agree on table names and column types.
//!
//! ```toml
//! [journal]
//! connection-string = "/var/lib/app/journal.db"
//! stored-as = "jsonb"
//! auto-initialize = true
//! max-batch-size = 100
//! write-isolation-level = "serializable"
//!
//! [journal.circuit-breaker]
//! max-failures = 10
//! call-timeout = "20s"
//! reset-timeout = "1m"
//!
//! [snapshot-store]
//! connection-string = "/var/lib/app/journal.db"
//! ```
//!
//! ## Storage mapping
//!
//! | Setting | SQLite behavior |
//! |---------|-----------------|
//! | `schema-name` | attached database name (`main` by default) |
//! | `stored-as = bytea` | `BLOB` column, payload written by a registered serializer |
//! | `stored-as = json` | `TEXT` column validated with `json(?)` |
//! | `stored-as = jsonb` | SQLite binary JSON via `jsonb(?)`, read back with `json(payload)` |
//! | isolation levels | transaction behavior, see [`IsolationLevel`] |

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::TransactionBehavior;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default wait for a pooled connection and for SQLite's busy handler.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default schema. SQLite names the primary database `main`.
pub const DEFAULT_SCHEMA_NAME: &str = "main";

/// Default journal table.
pub const DEFAULT_JOURNAL_TABLE: &str = "event_journal";

/// Default metadata table.
pub const DEFAULT_METADATA_TABLE: &str = "metadata";

/// Default snapshot table.
pub const DEFAULT_SNAPSHOT_TABLE: &str = "snapshot_store";

/// Default number of batches and reads allowed to hold a connection at once.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 64;

/// Default number of operations drained into one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default number of buffered write operations before submissions are rejected.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 500_000;

/// Default declared width of the delimited tags column.
pub const DEFAULT_TAGS_COLUMN_SIZE: usize = 2000;

// =============================================================================
// Stored-as
// =============================================================================

/// Physical encoding of event and snapshot payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoredAs {
    /// Binary column written by a serializer from the registry.
    #[default]
    ByteA,
    /// JSON text column.
    Json,
    /// SQLite's binary JSON representation.
    JsonB,
}

impl StoredAs {
    /// Column type used in DDL.
    pub fn column_type(self) -> &'static str {
        match self {
            StoredAs::ByteA => "BLOB",
            StoredAs::Json => "TEXT",
            StoredAs::JsonB => "BLOB",
        }
    }

    /// SQL expression used for the bound payload parameter at `index`.
    pub fn bind_expr(self, index: usize) -> String {
        match self {
            StoredAs::ByteA => format!("?{index}"),
            StoredAs::Json => format!("json(?{index})"),
            StoredAs::JsonB => format!("jsonb(?{index})"),
        }
    }

    /// SQL expression used to select the payload column.
    pub fn select_expr(self, column: &str) -> String {
        match self {
            StoredAs::ByteA | StoredAs::Json => column.to_string(),
            StoredAs::JsonB => format!("json({column})"),
        }
    }
}

impl FromStr for StoredAs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bytea" => Ok(StoredAs::ByteA),
            "json" => Ok(StoredAs::Json),
            "jsonb" => Ok(StoredAs::JsonB),
            _ => Err(Error::Configuration(format!(
                "Value [{s}] is not valid. Valid values: bytea, json, jsonb."
            ))),
        }
    }
}

impl fmt::Display for StoredAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoredAs::ByteA => "bytea",
            StoredAs::Json => "json",
            StoredAs::JsonB => "jsonb",
        })
    }
}

// =============================================================================
// Isolation Level
// =============================================================================

/// Requested transaction isolation.
///
/// SQLite serializes writers and gives WAL readers a snapshot, so the levels
/// collapse onto transaction behaviors:
///
/// | Level | Write transaction | Read transaction |
/// |-------|-------------------|------------------|
/// | `serializable` | `BEGIN EXCLUSIVE` | `BEGIN IMMEDIATE` |
/// | `read-uncommitted` | `BEGIN IMMEDIATE` | `BEGIN DEFERRED` + `read_uncommitted` pragma |
/// | any other | `BEGIN IMMEDIATE` | `BEGIN DEFERRED` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    Chaos,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    pub(crate) fn write_behavior(self) -> TransactionBehavior {
        match self {
            IsolationLevel::Serializable => TransactionBehavior::Exclusive,
            _ => TransactionBehavior::Immediate,
        }
    }

    pub(crate) fn read_behavior(self) -> TransactionBehavior {
        match self {
            IsolationLevel::Serializable => TransactionBehavior::Immediate,
            _ => TransactionBehavior::Deferred,
        }
    }

    pub(crate) fn reads_uncommitted(self) -> bool {
        self == IsolationLevel::ReadUncommitted
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unspecified" => Ok(IsolationLevel::Unspecified),
            "chaos" => Ok(IsolationLevel::Chaos),
            "read-uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            "snapshot" => Ok(IsolationLevel::Snapshot),
            _ => Err(Error::Configuration(format!(
                "Value [{s}] is not valid. Valid values: chaos, read-committed, \
                 read-uncommitted, repeatable-read, serializable, snapshot, unspecified."
            ))),
        }
    }
}

// =============================================================================
// Tag Storage
// =============================================================================

/// How event tags are persisted and queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagStorage {
    /// JSON array in the `tags` column plus an indexed `(tag, ordering)` table.
    #[default]
    Array,
    /// `;a;b;` string in the `tags` column, matched by substring.
    Delimited,
}

impl FromStr for TagStorage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "array" => Ok(TagStorage::Array),
            "delimited" => Ok(TagStorage::Delimited),
            _ => Err(Error::Configuration(format!(
                "Value [{s}] is not valid. Valid values: array, delimited."
            ))),
        }
    }
}

// Enums are written as strings in TOML and parsed case-insensitively.
macro_rules! deserialize_from_str {
    ($ty:ty) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

deserialize_from_str!(StoredAs);
deserialize_from_str!(IsolationLevel);
deserialize_from_str!(TagStorage);

// =============================================================================
// Durations
// =============================================================================

/// Parses `"500ms"`, `"30s"`, `"2m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid duration '{raw}'")))?;

    let scaled = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::Configuration(format!("duration '{raw}' is too large")))
    };

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled(60),
        "h" => scaled(3600),
        other => Err(Error::Configuration(format!(
            "invalid duration unit '{other}' in '{raw}'"
        ))),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Raw Configuration (serde)
// =============================================================================

/// Circuit breaker section shared by journal and snapshot store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    pub max_failures: u32,
    /// Calls running longer than this count as failures.
    #[serde(deserialize_with = "deserialize_duration")]
    pub call_timeout: Duration,
    /// Time spent open before a trial call is let through.
    #[serde(deserialize_with = "deserialize_duration")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            call_timeout: Duration::from_secs(20),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// The `[journal]` section as written by the user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct JournalConfig {
    pub connection_string: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    pub schema_name: String,
    pub table_name: String,
    pub metadata_table_name: String,
    pub stored_as: StoredAs,
    pub auto_initialize: bool,
    pub max_concurrent_operations: usize,
    pub max_batch_size: usize,
    pub max_buffer_size: usize,
    pub read_isolation_level: IsolationLevel,
    pub write_isolation_level: IsolationLevel,
    pub tags_column_size: usize,
    pub tag_storage: TagStorage,
    pub use_bigint_identity_for_ordering_column: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            table_name: DEFAULT_JOURNAL_TABLE.to_string(),
            metadata_table_name: DEFAULT_METADATA_TABLE.to_string(),
            stored_as: StoredAs::default(),
            auto_initialize: false,
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_isolation_level: IsolationLevel::default(),
            write_isolation_level: IsolationLevel::default(),
            tags_column_size: DEFAULT_TAGS_COLUMN_SIZE,
            tag_storage: TagStorage::default(),
            use_bigint_identity_for_ordering_column: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl JournalConfig {
    /// Defaults pointing at `connection_string`.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Validates the section into immutable settings.
    pub fn build(self) -> Result<JournalSettings> {
        validate_connection_string(&self.connection_string)?;
        validate_identifier("schema-name", &self.schema_name)?;
        validate_identifier("table-name", &self.table_name)?;
        validate_identifier("metadata-table-name", &self.metadata_table_name)?;
        if self.table_name == self.metadata_table_name {
            return Err(Error::Configuration(
                "table-name and metadata-table-name must differ".to_string(),
            ));
        }
        require_positive("max-concurrent-operations", self.max_concurrent_operations)?;
        require_positive("max-batch-size", self.max_batch_size)?;
        require_positive("max-buffer-size", self.max_buffer_size)?;
        require_positive("tags-column-size", self.tags_column_size)?;
        if self.max_batch_size > self.max_buffer_size {
            return Err(Error::Configuration(format!(
                "max-batch-size ({}) cannot exceed max-buffer-size ({})",
                self.max_batch_size, self.max_buffer_size
            )));
        }
        validate_breaker(&self.circuit_breaker)?;

        Ok(JournalSettings { config: self })
    }
}

/// The `[snapshot-store]` section as written by the user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SnapshotStoreConfig {
    pub connection_string: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    pub schema_name: String,
    pub table_name: String,
    pub stored_as: StoredAs,
    pub auto_initialize: bool,
    pub max_concurrent_operations: usize,
    pub read_isolation_level: IsolationLevel,
    pub write_isolation_level: IsolationLevel,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            table_name: DEFAULT_SNAPSHOT_TABLE.to_string(),
            stored_as: StoredAs::default(),
            auto_initialize: false,
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            read_isolation_level: IsolationLevel::default(),
            write_isolation_level: IsolationLevel::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl SnapshotStoreConfig {
    /// Defaults pointing at `connection_string`.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Validates the section into immutable settings.
    pub fn build(self) -> Result<SnapshotStoreSettings> {
        validate_connection_string(&self.connection_string)?;
        validate_identifier("schema-name", &self.schema_name)?;
        validate_identifier("table-name", &self.table_name)?;
        require_positive("max-concurrent-operations", self.max_concurrent_operations)?;
        validate_breaker(&self.circuit_breaker)?;

        Ok(SnapshotStoreSettings { config: self })
    }
}

/// Whole configuration file: a journal and a snapshot store section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PersistenceConfig {
    pub journal: JournalConfig,
    pub snapshot_store: SnapshotStoreConfig,
}

impl PersistenceConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_connection_string(raw: &str) -> Result<()> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Configuration(
            "connection-string must be set".to_string(),
        ));
    }
    // Every pooled connection would get its own private database.
    if trimmed == ":memory:" || trimmed.contains("mode=memory") {
        return Err(Error::Configuration(
            "in-memory databases cannot be shared by pooled connections".to_string(),
        ));
    }
    Ok(())
}

fn validate_identifier(key: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('\0') {
        return Err(Error::Configuration(format!(
            "{key} must be a non-empty identifier"
        )));
    }
    Ok(())
}

fn require_positive(key: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Configuration(format!("{key} must be greater than 0")));
    }
    Ok(())
}

fn validate_breaker(breaker: &CircuitBreakerConfig) -> Result<()> {
    if breaker.max_failures == 0 {
        return Err(Error::Configuration(
            "circuit-breaker.max-failures must be greater than 0".to_string(),
        ));
    }
    if breaker.call_timeout.is_zero() {
        return Err(Error::Configuration(
            "circuit-breaker.call-timeout must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// Validated Settings
// =============================================================================

/// Validated, immutable journal settings.
#[derive(Debug, Clone)]
pub struct JournalSettings {
    config: JournalConfig,
}

impl JournalSettings {
    pub fn connection_string(&self) -> &str {
        self.config.connection_string.trim()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.config.connection_timeout
    }

    pub fn schema_name(&self) -> &str {
        &self.config.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn metadata_table_name(&self) -> &str {
        &self.config.metadata_table_name
    }

    /// Name of the `(tag, ordering)` index table used by [`TagStorage::Array`].
    pub fn tags_table_name(&self) -> String {
        format!("{}_tags", self.config.table_name)
    }

    pub fn stored_as(&self) -> StoredAs {
        self.config.stored_as
    }

    pub fn auto_initialize(&self) -> bool {
        self.config.auto_initialize
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.config.max_concurrent_operations
    }

    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    pub fn max_buffer_size(&self) -> usize {
        self.config.max_buffer_size
    }

    pub fn read_isolation_level(&self) -> IsolationLevel {
        self.config.read_isolation_level
    }

    pub fn write_isolation_level(&self) -> IsolationLevel {
        self.config.write_isolation_level
    }

    pub fn tags_column_size(&self) -> usize {
        self.config.tags_column_size
    }

    pub fn tag_storage(&self) -> TagStorage {
        self.config.tag_storage
    }

    pub fn use_bigint_identity(&self) -> bool {
        self.config.use_bigint_identity_for_ordering_column
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerConfig {
        &self.config.circuit_breaker
    }
}

/// Validated, immutable snapshot store settings.
#[derive(Debug, Clone)]
pub struct SnapshotStoreSettings {
    config: SnapshotStoreConfig,
}

impl SnapshotStoreSettings {
    pub fn connection_string(&self) -> &str {
        self.config.connection_string.trim()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.config.connection_timeout
    }

    pub fn schema_name(&self) -> &str {
        &self.config.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn stored_as(&self) -> StoredAs {
        self.config.stored_as
    }

    pub fn auto_initialize(&self) -> bool {
        self.config.auto_initialize
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.config.max_concurrent_operations
    }

    pub fn read_isolation_level(&self) -> IsolationLevel {
        self.config.read_isolation_level
    }

    pub fn write_isolation_level(&self) -> IsolationLevel {
        self.config.write_isolation_level
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerConfig {
        &self.config.circuit_breaker
    }
}

// =============================================================================
// Tests
// =============================================================================
