//! Wiring from [`Config`] to live services.
//!
//! Every command that touches the database builds one [`AppContext`]: a
//! SQLite pool, the stores on top of it, the search index for the
//! configured tier, the connector registry, and the orchestrator that ties
//! them together.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use filesync_core::search::SearchIndex;

use crate::auth::TokenRefresher;
use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::db;
use crate::embedding;
use crate::migrate;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_store::SqliteStore;
use crate::storage::LocalCopies;
use crate::sync::SyncOrchestrator;

pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub index: Arc<SearchIndex>,
    pub connectors: Arc<ConnectorRegistry>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppContext {
    /// Open the database (creating tables if needed) with the connectors
    /// declared in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let connectors = ConnectorRegistry::from_config(config)?;
        Self::open_with(config, connectors).await
    }

    /// Like [`open`](Self::open) with an explicit connector registry.
    pub async fn open_with(config: &Config, connectors: ConnectorRegistry) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool.clone()));

        let mut index = SearchIndex::new(
            Arc::new(SqliteIndex::new(pool.clone())),
            config.index.tier()?,
        )
        .with_chunker(config.chunking.to_chunker())
        .with_chunk_threshold(config.index.chunk_threshold);
        if let Some(service) = embedding::create_service(&config.embedding)? {
            index = index.with_embeddings(service);
        }
        let index = Arc::new(index);

        let connectors = Arc::new(connectors);
        let tokens = Arc::new(TokenRefresher::new(store.clone()));
        let mut orchestrator = SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            connectors.clone(),
            tokens,
            index.clone(),
        )
        .with_index_workers(config.scheduler.index_workers);
        if let Some(copies) = LocalCopies::from_config(&config.storage) {
            orchestrator = orchestrator.with_local_copies(Arc::new(copies));
        }

        info!(
            db = %config.db.path.display(),
            tier = %index.tier(),
            embeddings = index.embeddings_enabled(),
            connectors = connectors.len(),
            "context ready"
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            store,
            index,
            connectors,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
