mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};
use quarry_index::chunker::FALLBACK_WINDOW_LINES;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the indexer cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let e = &self.embedding;
        if e.batch_size == 0 {
            bail!("embedding.batch_size must be at least 1");
        }
        if e.max_chunk_size == 0 {
            bail!("embedding.max_chunk_size must be at least 1");
        }
        if e.file_concurrency == 0 || e.batch_concurrency == 0 {
            bail!("embedding.file_concurrency and embedding.batch_concurrency must be at least 1");
        }
        if e.max_retries == 0 {
            bail!("embedding.max_retries must be at least 1");
        }
        if e.chunk_overlap_lines >= FALLBACK_WINDOW_LINES {
            bail!(
                "embedding.chunk_overlap_lines ({}) must be smaller than the {FALLBACK_WINDOW_LINES}-line window",
                e.chunk_overlap_lines
            );
        }

        let p = &self.providers;
        if p.enabled_count() == 0 {
            bail!("no embedding provider is enabled");
        }
        if p.openai.enabled && p.openai.api_key.as_ref().is_none_or(crate::secret::Secret::is_empty) {
            bail!("providers.openai is enabled but no api key is set (QUARRY_OPENAI_API_KEY)");
        }
        for (name, enabled, dims) in [
            ("openai", p.openai.enabled, p.openai.dimensions),
            ("ollama", p.ollama.enabled, p.ollama.dimensions),
            ("local", p.local.enabled, p.local.dimensions),
        ] {
            if enabled && dims == 0 {
                bail!("providers.{name}.dimensions must be at least 1");
            }
        }

        if self.watch.debounce_secs == 0 {
            bail!("watch.debounce_secs must be at least 1");
        }
        if self.watch.sweep_interval_secs == 0 {
            bail!("watch.sweep_interval_secs must be at least 1");
        }
        if self.health.failure_threshold == 0 || self.health.rate_limit_threshold == 0 {
            bail!("health thresholds must be at least 1");
        }
        if self.index.max_dimensions == Some(0) {
            bail!("index.max_dimensions must be at least 1 when set");
        }
        if self.index.store == StoreKind::Sqlite && self.index.sqlite_path.trim().is_empty() {
            bail!("index.sqlite_path must not be empty");
        }
        Ok(())
    }
}
