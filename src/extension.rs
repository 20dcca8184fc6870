//! # Persistence Entry Point
//!
//! [`SqlPersistence`] builds the journal and snapshot store from one
//! [`PersistenceConfig`] and owns both handles. It is created once at startup
//! and handed to whatever needs persistence; there is no process-wide lookup.
//!
//! ```rust,ignore
//! let config = PersistenceConfig::from_file("persistence.toml")?;
//! let serializers = SerializerRegistry::new()
//!     .register(MySerializer)
//!     .bind("Opened", MY_SERIALIZER_ID);
//!
//! let persistence = SqlPersistence::start(config, serializers).await?;
//! let journal = persistence.journal().clone();
//! ```

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::journal::Journal;
use crate::serialization::SerializerRegistry;
use crate::settings::PersistenceConfig;
use crate::snapshot::SnapshotStore;

/// A started journal plus snapshot store sharing one serializer registry.
#[derive(Clone)]
pub struct SqlPersistence {
    journal: Journal,
    snapshot_store: SnapshotStore,
    serializers: Arc<SerializerRegistry>,
}

impl SqlPersistence {
    /// Validates `config`, initializes schemas where requested and starts the
    /// journal engine.
    ///
    /// A snapshot section without a connection string uses the journal's
    /// database.
    pub async fn start(mut config: PersistenceConfig, serializers: SerializerRegistry) -> Result<Self> {
        if config.snapshot_store.connection_string.trim().is_empty() {
            config.snapshot_store.connection_string = config.journal.connection_string.clone();
        }

        let journal_settings = config.journal.build()?;
        let snapshot_settings = config.snapshot_store.build()?;
        let serializers = Arc::new(serializers);

        let journal = Journal::open(journal_settings, serializers.clone()).await?;
        let snapshot_store = match SnapshotStore::open(snapshot_settings, serializers.clone()).await {
            Ok(store) => store,
            Err(e) => {
                // Don't leave the engine thread running behind a failed start.
                let _ = journal.shutdown().await;
                return Err(e);
            }
        };

        info!("persistence started");
        Ok(Self {
            journal,
            snapshot_store,
            serializers,
        })
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshot_store
    }

    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.serializers
    }

    /// Drains and stops the journal engine. Snapshot calls hold no background
    /// work and need no shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.journal.shutdown().await?;
        info!("persistence stopped");
        Ok(())
    }
}
