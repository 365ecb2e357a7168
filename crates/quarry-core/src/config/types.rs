use std::time::Duration;

use quarry_index::{
    CoordinatorConfig, HealthConfig, PipelineConfig, RetrievalConfig, WatchConfig,
};
use quarry_llm::RetryPolicy;
use serde::Deserialize;

use crate::secret::Secret;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
}

fn default_batch_size() -> usize {
    32
}

fn default_max_chunk_size() -> usize {
    1500
}

fn default_chunk_overlap_lines() -> usize {
    5
}

fn default_file_concurrency() -> usize {
    2
}

fn default_batch_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_fallback_cooldown_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Characters; longer chunks are split into overlapping line windows.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_chunk_overlap_lines")]
    pub chunk_overlap_lines: usize,
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_fallback_cooldown_ms")]
    pub fallback_cooldown_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_chunk_size: default_max_chunk_size(),
            chunk_overlap_lines: default_chunk_overlap_lines(),
            file_concurrency: default_file_concurrency(),
            batch_concurrency: default_batch_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            fallback_cooldown_ms: default_fallback_cooldown_ms(),
        }
    }
}

impl EmbeddingConfig {
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            max_chunk_size: self.max_chunk_size,
            chunk_overlap_lines: self.chunk_overlap_lines,
            file_concurrency: self.file_concurrency,
            batch_concurrency: self.batch_concurrency,
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            fallback_cooldown: Duration::from_millis(self.fallback_cooldown_ms),
        }
    }
}

/// Embedding backends. Enabled providers are tried in the order
/// `openai`, `ollama`, `local`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: OpenAiProviderConfig,
    #[serde(default)]
    pub ollama: OllamaProviderConfig,
    #[serde(default)]
    pub local: LocalProviderConfig,
}

impl ProvidersConfig {
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        [self.openai.enabled, self.ollama.enabled, self.local.enabled]
            .into_iter()
            .filter(|e| *e)
            .count()
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_openai_model() -> String {
    "text-embedding-3-small".into()
}

fn default_openai_dimensions() -> usize {
    1536
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub api_key: Option<Secret>,
}

impl Default for OpenAiProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            dimensions: default_openai_dimensions(),
            api_key: None,
        }
    }
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_ollama_model() -> String {
    "nomic-embed-text".into()
}

fn default_ollama_dimensions() -> usize {
    768
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_ollama_dimensions")]
    pub dimensions: usize,
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            dimensions: default_ollama_dimensions(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_local_dimensions() -> usize {
    384
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_local_dimensions")]
    pub dimensions: usize,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: default_local_dimensions(),
        }
    }
}

fn default_debounce_secs() -> u64 {
    180
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_coalesce_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

impl WatchSettings {
    #[must_use]
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_secs(self.debounce_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            coalesce: Duration::from_millis(self.coalesce_ms),
        }
    }
}

/// Backing store for embeddings and file metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local; every run starts from scratch.
    Memory,
    #[default]
    Sqlite,
}

impl StoreKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_sqlite_path() -> String {
    ".quarry/index.db".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// Gitignore-syntax patterns applied on top of the built-in denylist.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Widest vector the store accepts, if bounded.
    #[serde(default)]
    pub max_dimensions: Option<usize>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            store: StoreKind::default(),
            sqlite_path: default_sqlite_path(),
            max_dimensions: None,
        }
    }
}

impl IndexSettings {
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            ignore_patterns: self.ignore_patterns.clone(),
            max_file_bytes: self.max_file_bytes,
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failure_window_secs() -> u64 {
    3600
}

fn default_rate_limit_threshold() -> u32 {
    3
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            rate_limit_threshold: default_rate_limit_threshold(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl HealthSettings {
    /// Healthy providers are allowed `default_concurrency` calls at once.
    #[must_use]
    pub fn health_config(&self, default_concurrency: usize) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            rate_limit_threshold: self.rate_limit_threshold,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            default_concurrency,
        }
    }
}

fn default_candidates() -> usize {
    24
}

fn default_score_threshold() -> f32 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            score_threshold: default_score_threshold(),
        }
    }
}

impl RetrievalSettings {
    #[must_use]
    pub fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            candidates: self.candidates,
            score_threshold: self.score_threshold,
            ..RetrievalConfig::default()
        }
    }
}
