#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sqljournal::{
    AtomicWrite, Journal, JournalConfig, Payload, PersistentRepr, SerializerRegistry,
    SnapshotStore, SnapshotStoreConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub account: String,
    pub amount: i64,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn journal_config(path: &Path) -> JournalConfig {
    let mut config = JournalConfig::new(path.to_string_lossy());
    config.auto_initialize = true;
    config
}

pub fn snapshot_config(path: &Path) -> SnapshotStoreConfig {
    let mut config = SnapshotStoreConfig::new(path.to_string_lossy());
    config.auto_initialize = true;
    config
}

pub async fn open_journal_with(
    name: &str,
    configure: impl FnOnce(&mut JournalConfig),
) -> (tempfile::TempDir, PathBuf, Journal) {
    init_tracing();
    let (dir, path) = create_temp_db_path(name);
    let mut config = journal_config(&path);
    configure(&mut config);
    let settings = config.build().expect("valid journal settings");
    let journal = Journal::open(settings, Arc::new(SerializerRegistry::new()))
        .await
        .expect("open journal");
    (dir, path, journal)
}

pub async fn open_journal(name: &str) -> (tempfile::TempDir, PathBuf, Journal) {
    open_journal_with(name, |_| {}).await
}

pub async fn open_snapshot_store_with(
    name: &str,
    configure: impl FnOnce(&mut SnapshotStoreConfig),
) -> (tempfile::TempDir, PathBuf, SnapshotStore) {
    init_tracing();
    let (dir, path) = create_temp_db_path(name);
    let mut config = snapshot_config(&path);
    configure(&mut config);
    let settings = config.build().expect("valid snapshot settings");
    let store = SnapshotStore::open(settings, Arc::new(SerializerRegistry::new()))
        .await
        .expect("open snapshot store");
    (dir, path, store)
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub fn text_payload(text: &str) -> Payload {
    Payload::new(&text.to_string()).expect("string payload")
}

pub fn deposit(account: &str, amount: i64) -> Payload {
    Payload::new(&Deposited {
        account: account.to_string(),
        amount,
    })
    .expect("deposit payload")
}

pub fn event(persistence_id: &str, sequence_nr: i64, text: &str) -> PersistentRepr {
    PersistentRepr::new(persistence_id, sequence_nr, text_payload(text))
}

pub fn single(persistence_id: &str, sequence_nr: i64, text: &str) -> AtomicWrite {
    AtomicWrite::single(event(persistence_id, sequence_nr, text)).expect("valid write")
}

/// One atomic write holding sequence numbers `from..=to`.
pub fn range_write(persistence_id: &str, from: i64, to: i64) -> AtomicWrite {
    AtomicWrite::new(
        (from..=to)
            .map(|seq| event(persistence_id, seq, &format!("{persistence_id}-{seq}")))
            .collect(),
    )
    .expect("valid write")
}

pub fn payload_text(event: &PersistentRepr) -> String {
    event.payload.to_typed::<String>().expect("string payload")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
