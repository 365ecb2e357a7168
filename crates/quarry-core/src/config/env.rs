use super::{Config, StoreKind};
use crate::secret::Secret;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_embedding();
        self.apply_env_overrides_providers();
        self.apply_env_overrides_index();
    }

    fn apply_env_overrides_embedding(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.batch_size = n;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_MAX_CHUNK_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.max_chunk_size = n;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_FILE_CONCURRENCY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.file_concurrency = n;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_BATCH_CONCURRENCY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.batch_concurrency = n;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_MAX_RETRIES")
            && let Ok(n) = v.parse::<u32>()
        {
            self.embedding.max_retries = n;
        }
    }

    fn apply_env_overrides_providers(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(Secret::new(v));
        }
        if let Ok(v) = std::env::var("QUARRY_OPENAI_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.providers.openai.enabled = enabled;
        }
        if let Ok(v) = std::env::var("QUARRY_OPENAI_BASE_URL") {
            self.providers.openai.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_OPENAI_MODEL") {
            self.providers.openai.model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_OLLAMA_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.providers.ollama.enabled = enabled;
        }
        if let Ok(v) = std::env::var("QUARRY_OLLAMA_BASE_URL") {
            self.providers.ollama.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_OLLAMA_MODEL") {
            self.providers.ollama.model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LOCAL_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.providers.local.enabled = enabled;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_INDEX_STORE") {
            if let Ok(kind) = serde_json::from_value::<StoreKind>(serde_json::Value::String(v.clone())) {
                self.index.store = kind;
            } else {
                tracing::warn!("ignoring invalid QUARRY_INDEX_STORE value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_SQLITE_PATH") {
            self.index.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_MAX_FILE_BYTES")
            && let Ok(n) = v.parse::<u64>()
        {
            self.index.max_file_bytes = n;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_IGNORE") {
            self.index.ignore_patterns = v
                .split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("QUARRY_WATCH_DEBOUNCE_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.watch.debounce_secs = secs;
        }
        if let Ok(v) = std::env::var("QUARRY_WATCH_SWEEP_INTERVAL_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.watch.sweep_interval_secs = secs;
        }
    }
}
