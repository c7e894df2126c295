//! Shared application handle: configuration, store, blob storage, and
//! providers, built once and cloned into every worker and HTTP handler.

use anyhow::Result;
use std::sync::Arc;

use crate::cache::SemanticCache;
use crate::config::Config;
use crate::embedding::{create_provider, Embedder, EmbeddingProvider};
use crate::llm::{create_completion_provider, CompletionProvider};
use crate::normalize::Normalizer;
use crate::storage::{BlobStore, FsBlobStore};
use crate::store::SqliteStore;

/// External services the pipeline and answer path talk to.
pub struct Providers {
    pub embedding: Arc<dyn EmbeddingProvider>,
    /// Model used for semantic normalization.
    pub normalizer: Arc<dyn CompletionProvider>,
    /// Model used to answer questions.
    pub chat: Arc<dyn CompletionProvider>,
}

impl Providers {
    /// Build providers from the `[embedding]`, `[llm]` and `[normalizer]`
    /// sections. API keys are read from the environment here.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            embedding: create_provider(&config.embedding)?,
            normalizer: create_completion_provider(&config.llm, &config.normalizer.model)?,
            chat: create_completion_provider(&config.llm, &config.llm.model)?,
        })
    }
}

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub store: SqliteStore,
    pub blobs: Arc<dyn BlobStore>,
    pub embedder: Embedder,
    pub normalizer: Arc<Normalizer>,
    pub chat: Arc<dyn CompletionProvider>,
}

impl App {
    /// Connect to the database and build every provider from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let providers = Providers::from_config(config)?;
        let pool = crate::db::connect(config).await?;
        let blobs = Arc::new(FsBlobStore::new(config.storage.root.clone()));
        Ok(Self::new(config.clone(), SqliteStore::new(pool), blobs, providers))
    }

    pub fn new(
        config: Config,
        store: SqliteStore,
        blobs: Arc<dyn BlobStore>,
        providers: Providers,
    ) -> Self {
        let cache = SemanticCache::new(store.clone(), config.normalizer.memory_cache_entries);
        let normalizer = Normalizer::new(providers.normalizer, cache, config.normalizer.clone());
        let embedder = Embedder::new(providers.embedding, &config.embedding);

        Self {
            config: Arc::new(config),
            store,
            blobs,
            embedder,
            normalizer: Arc::new(normalizer),
            chat: providers.chat,
        }
    }
}
