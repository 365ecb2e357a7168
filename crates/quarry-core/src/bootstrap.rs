//! Service assembly: provider chain, store and indexing services from config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use quarry_index::{
    ChangeWatcher, CodeRetriever, EmbeddingPipeline, LexicalSearchIndex, ProjectIndexCoordinator,
    ProviderHealthRegistry,
};
use quarry_llm::AnyEmbedder;
use quarry_llm::EmbeddingProvider;
use quarry_llm::local::LocalEmbedder;
use quarry_llm::ollama::OllamaEmbedder;
use quarry_llm::openai::OpenAiEmbedder;
use quarry_memory::{
    InMemoryIndexStore, IndexStore, ProjectInfo, SqliteIndexStore, WorkspaceIdentifier,
};

use crate::config::{Config, StoreKind};

const DEFAULT_CONFIG_PATH: &str = "quarry.toml";

/// Every long-lived service of a quarry process, wired from one [`Config`].
pub struct Quarry {
    config: Config,
    store: Arc<dyn IndexStore>,
    health: Arc<ProviderHealthRegistry>,
    pipeline: Arc<EmbeddingPipeline>,
    coordinator: Arc<ProjectIndexCoordinator>,
    retriever: CodeRetriever,
}

impl Quarry {
    /// Build the provider chain and store named by `config` and wire the
    /// indexing services on top of them.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider can be built or the store cannot be
    /// opened.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let providers = build_providers(&config)?;
        Self::with_providers(config, providers).await
    }

    /// Like [`Quarry::build`] with an explicit provider chain, tried in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `providers` is empty or the store cannot be opened.
    pub async fn with_providers(config: Config, providers: Vec<AnyEmbedder>) -> anyhow::Result<Self> {
        if providers.is_empty() {
            bail!("no embedding provider configured");
        }
        let chain: Vec<String> = providers.iter().map(|p| p.signature().to_string()).collect();

        let store = build_store(&config).await?;
        let health = Arc::new(ProviderHealthRegistry::new(
            config.health.health_config(config.embedding.batch_concurrency),
        ));
        let pipeline = Arc::new(EmbeddingPipeline::new(
            providers,
            Arc::clone(&store),
            Arc::clone(&health),
            config.embedding.pipeline_config(),
        ));
        let lexical = Arc::new(LexicalSearchIndex::new());
        let coordinator = Arc::new(ProjectIndexCoordinator::new(
            Arc::new(WorkspaceIdentifier),
            Arc::clone(&store),
            Arc::clone(&pipeline),
            Arc::clone(&lexical),
            config.index.coordinator_config(),
        ));
        let retriever = CodeRetriever::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            lexical,
            config.retrieval.retrieval_config(),
        );

        tracing::info!(providers = ?chain, store = %config.index.store, "services ready");
        Ok(Self {
            config,
            store,
            health,
            pipeline,
            coordinator,
            retriever,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealthRegistry> {
        &self.health
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<ProjectIndexCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn retriever(&self) -> &CodeRetriever {
        &self.retriever
    }

    /// A watcher sharing this process's coordinator.
    #[must_use]
    pub fn watcher(&self) -> ChangeWatcher {
        ChangeWatcher::new(Arc::clone(&self.coordinator), self.config.watch.watch_config())
    }

    /// Identify the project at `path` and, on first use in this process,
    /// rebuild its lexical entries from the persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be identified or the store
    /// cannot be read.
    pub async fn open_project(&self, path: &Path) -> anyhow::Result<ProjectInfo> {
        let project = self
            .coordinator
            .identify(path)
            .await
            .with_context(|| format!("cannot open project at {}", path.display()))?;
        if self.coordinator.lexical().files(&project.id).is_empty() {
            let restored = self.coordinator.warm_lexical(&project.id).await?;
            tracing::debug!(project = %project.id, records = restored, "lexical index restored");
        }
        Ok(project)
    }
}

/// Enabled providers in fail-over order: `openai`, `ollama`, `local`.
///
/// # Errors
///
/// Returns an error if no provider is enabled or `openai` lacks a key.
pub fn build_providers(config: &Config) -> anyhow::Result<Vec<AnyEmbedder>> {
    let p = &config.providers;
    let mut chain: Vec<AnyEmbedder> = Vec::with_capacity(3);

    if p.openai.enabled {
        let key = p
            .openai
            .api_key
            .as_ref()
            .filter(|k| !k.is_empty())
            .context("providers.openai is enabled but no api key is set")?;
        chain.push(
            OpenAiEmbedder::new(
                key.expose().to_owned(),
                p.openai.base_url.clone(),
                p.openai.model.clone(),
                p.openai.dimensions,
            )
            .into(),
        );
    }
    if p.ollama.enabled {
        chain.push(
            OllamaEmbedder::new(&p.ollama.base_url, p.ollama.model.clone(), p.ollama.dimensions)
                .into(),
        );
    }
    if p.local.enabled {
        chain.push(LocalEmbedder::new(p.local.dimensions).into());
    }

    if chain.is_empty() {
        bail!("no embedding provider is enabled");
    }
    Ok(chain)
}

/// # Errors
///
/// Returns an error if the `SQLite` database cannot be opened or migrated.
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn IndexStore>> {
    let limit = config.index.max_dimensions;
    let store: Arc<dyn IndexStore> = match config.index.store {
        StoreKind::Memory => {
            let mut store = InMemoryIndexStore::new();
            if let Some(limit) = limit {
                store = store.with_dimension_limit(limit);
            }
            Arc::new(store)
        }
        StoreKind::Sqlite => {
            let path = &config.index.sqlite_path;
            let mut store = SqliteIndexStore::open(path)
                .await
                .with_context(|| format!("failed to open index database {path}"))?;
            if let Some(limit) = limit {
                store = store.with_dimension_limit(limit);
            }
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Priority: explicit path > `QUARRY_CONFIG` env > `quarry.toml`.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("QUARRY_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
