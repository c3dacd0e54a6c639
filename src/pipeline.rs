//! Wiring of store, search backend, and listeners.
//!
//! A [`Pipeline`] owns everything a harvest, an index-maintenance command,
//! or the HTTP gateway needs. Building one subscribes the listeners in the
//! order the dataflow requires: the projector first, the transformer second.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::bronze::BronzeTransformer;
use crate::config::Config;
use crate::db;
use crate::http::HttpFetcher;
use crate::indexing::IndexingProjector;
use crate::migrate;
use crate::search_backend::{self, SearchBackend};
use crate::store::RecordStore;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    store: RecordStore,
    backend: Arc<dyn SearchBackend>,
    fetcher: HttpFetcher,
    projector: Arc<IndexingProjector>,
    transformer: Arc<BronzeTransformer>,
}

impl Pipeline {
    /// Connects to the configured database and search engine.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let backend = search_backend::connect(config)?;
        Self::new(config.clone(), pool, backend)
    }

    pub fn new(config: Config, pool: SqlitePool, backend: Arc<dyn SearchBackend>) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(&config)?;
        let store = RecordStore::new(pool);

        let projector = Arc::new(IndexingProjector::new(
            backend.clone(),
            config.indices.clone(),
        ));
        let transformer = Arc::new(BronzeTransformer::new(backend.clone()));
        store.events().subscribe(projector.clone());
        store.events().subscribe(transformer.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            backend,
            fetcher,
            projector,
            transformer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    pub fn fetcher(&self) -> &HttpFetcher {
        &self.fetcher
    }

    pub fn projector(&self) -> &IndexingProjector {
        &self.projector
    }

    pub fn transformer(&self) -> &BronzeTransformer {
        &self.transformer
    }

    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}
