//! Chunks in, vectors out.
//!
//! Batches are routed through an ordered provider chain. A provider is
//! skipped while its circuit is open; transient failures are retried with
//! backoff and then fall through to the next provider after a cooldown;
//! permanent failures fall through at once and count toward the breaker.
//! Before a run the project's stored embedding space is compared with the
//! live configuration and the project is cleared when they differ.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use quarry_llm::retry::{RetryPolicy, with_retry};
use quarry_llm::{AnyEmbedder, EmbedError, EmbeddingProvider, ModelSignature};
use quarry_memory::{EmbeddingRecord, FileMetadata, IndexStore, ModelChange, embedding_id};
use tokio::sync::Semaphore;

use crate::chunker::{Chunk, FALLBACK_WINDOW_LINES, estimate_tokens};
use crate::context::contextualize_for_embedding;
use crate::error::{IndexError, Result};
use crate::health::ProviderHealthRegistry;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Texts per provider call.
    pub batch_size: usize,
    /// Chunks longer than this many characters are split into line windows.
    pub max_chunk_size: usize,
    /// Lines repeated between consecutive windows of a split chunk.
    pub chunk_overlap_lines: usize,
    /// Files embedded at the same time.
    pub file_concurrency: usize,
    /// Provider calls in flight across all files.
    pub batch_concurrency: usize,
    pub retry: RetryPolicy,
    /// Pause before falling through after a transient failure.
    pub fallback_cooldown: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_chunk_size: 1500,
            chunk_overlap_lines: 5,
            file_concurrency: 2,
            batch_concurrency: 8,
            retry: RetryPolicy::default(),
            fallback_cooldown: Duration::from_secs(1),
        }
    }
}

/// A chunked file ready to embed. `metadata` is persisted only once every
/// chunk has been embedded and written.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub metadata: FileMetadata,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Compare the stored model with the live one and migrate on mismatch.
    pub verify_model: bool,
}

#[derive(Debug)]
pub struct FileOutcome {
    pub path: String,
    /// Chunks after oversized ones were split.
    pub chunks: usize,
    pub embedded: usize,
    pub failed_batches: usize,
    /// `name:model` of the provider that embedded the last batch.
    pub provider: Option<String>,
    /// First error hit; the file's previous records are left in place.
    pub error: Option<IndexError>,
}

#[derive(Debug, Default)]
pub struct EmbeddingProgress {
    pub total_chunks: usize,
    pub embedded: usize,
    pub failed_batches: usize,
    pub provider: Option<String>,
    /// The project was cleared because its model changed.
    pub migrated: bool,
    pub files: Vec<FileOutcome>,
}

struct EmbeddedBatch {
    vectors: Vec<Vec<f32>>,
    signature: ModelSignature,
}

pub struct EmbeddingPipeline {
    providers: Vec<AnyEmbedder>,
    store: Arc<dyn IndexStore>,
    health: Arc<ProviderHealthRegistry>,
    config: PipelineConfig,
    batch_permits: Semaphore,
}

impl EmbeddingPipeline {
    #[must_use]
    pub fn new(
        providers: Vec<AnyEmbedder>,
        store: Arc<dyn IndexStore>,
        health: Arc<ProviderHealthRegistry>,
        config: PipelineConfig,
    ) -> Self {
        let batch_permits = Semaphore::new(config.batch_concurrency.max(1));
        Self {
            providers,
            store,
            health,
            config,
            batch_permits,
        }
    }

    #[must_use]
    pub fn providers(&self) -> &[AnyEmbedder] {
        &self.providers
    }

    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealthRegistry> {
        &self.health
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Signature new embeddings are expected to carry: that of the first
    /// provider whose circuit is not open.
    #[must_use]
    pub fn active_signature(&self) -> Option<ModelSignature> {
        self.providers
            .iter()
            .find(|p| self.health.is_available(p.name()))
            .map(EmbeddingProvider::signature)
    }

    /// The live signature, if the project's stored embeddings were produced
    /// by a different model, dimension or format and should be regenerated.
    async fn pending_migration(&self, project_id: &str) -> Result<Option<(ModelChange, ModelSignature)>> {
        let Some(current) = self.active_signature() else {
            return Ok(None);
        };
        let change = self.store.check_model_change(project_id, &current).await?;
        Ok((change.changed && change.migration_recommended).then_some((change, current)))
    }

    /// Whether the next full run would migrate the project.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn needs_migration(&self, project_id: &str) -> Result<bool> {
        Ok(self.pending_migration(project_id).await?.is_some())
    }

    /// Clear the project when its stored embeddings were produced by a
    /// different model, dimension or format. Returns whether it migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried or cleared.
    pub async fn ensure_model_compatibility(&self, project_id: &str) -> Result<bool> {
        let Some((change, current)) = self.pending_migration(project_id).await? else {
            return Ok(false);
        };

        let previous = change
            .previous
            .as_ref()
            .map_or_else(|| "mixed".to_owned(), ToString::to_string);
        tracing::info!(
            project = project_id,
            %previous,
            %current,
            "embedding model changed, migrating project"
        );
        let removed = self.store.clear_project_embeddings(project_id).await?;
        tracing::info!(project = project_id, removed, "cleared embeddings for migration");
        Ok(true)
    }

    /// Embed and persist `files`, at most `file_concurrency` at a time.
    ///
    /// Per-file failures are reported in the returned progress, not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error only if model verification fails.
    pub async fn generate_for_project(
        &self,
        project_id: &str,
        files: Vec<PreparedFile>,
        options: GenerateOptions,
    ) -> Result<EmbeddingProgress> {
        let mut progress = EmbeddingProgress::default();
        if options.verify_model {
            progress.migrated = self.ensure_model_compatibility(project_id).await?;
        }

        let mut outcomes = futures::stream::iter(files)
            .map(|file| self.embed_file(project_id, file))
            .buffer_unordered(self.config.file_concurrency.max(1));

        while let Some(outcome) = outcomes.next().await {
            progress.total_chunks += outcome.chunks;
            progress.embedded += outcome.embedded;
            progress.failed_batches += outcome.failed_batches;
            if outcome.provider.is_some() {
                progress.provider.clone_from(&outcome.provider);
            }
            progress.files.push(outcome);
        }

        tracing::info!(
            project = project_id,
            chunks = progress.total_chunks,
            embedded = progress.embedded,
            failed_batches = progress.failed_batches,
            "embedding run finished"
        );
        Ok(progress)
    }

    /// Embed one file and replace its stored records.
    ///
    /// Old records are deleted only after every batch succeeded, so a failed
    /// file keeps its previous index state.
    pub async fn embed_file(&self, project_id: &str, file: PreparedFile) -> FileOutcome {
        let PreparedFile { metadata, chunks } = file;
        let chunks = split_oversized(
            &chunks,
            self.config.max_chunk_size,
            self.config.chunk_overlap_lines,
        );
        let mut outcome = FileOutcome {
            path: metadata.path.clone(),
            chunks: chunks.len(),
            embedded: 0,
            failed_batches: 0,
            provider: None,
            error: None,
        };

        let texts: Vec<String> = chunks
            .iter()
            .map(|c| contextualize_for_embedding(&metadata.path, &metadata.language, c))
            .collect();
        let results = futures::future::join_all(
            texts
                .chunks(self.config.batch_size.max(1))
                .map(|batch| self.embed_texts(batch)),
        )
        .await;

        let mut batches = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    outcome.failed_batches += 1;
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = &outcome.error {
            tracing::warn!(
                path = %metadata.path,
                failed_batches = outcome.failed_batches,
                "embedding failed: {e}"
            );
            return outcome;
        }

        match self.persist(project_id, &metadata, &chunks, batches).await {
            Ok((written, provider)) => {
                outcome.embedded = written;
                outcome.provider = provider;
            }
            Err(e) => {
                tracing::warn!(path = %metadata.path, "persisting embeddings failed: {e}");
                outcome.error = Some(e);
            }
        }
        outcome
    }

    async fn persist(
        &self,
        project_id: &str,
        metadata: &FileMetadata,
        chunks: &[Chunk],
        batches: Vec<EmbeddedBatch>,
    ) -> Result<(usize, Option<String>)> {
        let removed = self.store.delete_embeddings_by_file(&metadata.id).await?;

        let vectors = batches.into_iter().flat_map(|batch| {
            let signature = batch.signature;
            batch
                .vectors
                .into_iter()
                .map(move |vector| (vector, signature.clone()))
        });

        let mut written = 0;
        let mut provider = None;
        for (chunk, (vector, signature)) in chunks.iter().zip(vectors) {
            let record = EmbeddingRecord {
                id: embedding_id(project_id, &metadata.path, chunk.index),
                project_id: project_id.to_owned(),
                file_id: metadata.id.clone(),
                file_path: metadata.path.clone(),
                chunk_index: chunk.index,
                content: chunk.content.clone(),
                dimensions: vector.len(),
                vector,
                format: signature.format,
                provider: signature.provider,
                content_hash: metadata.content_hash.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                symbol_name: chunk.symbol_name.clone(),
                symbol_type: chunk.symbol_type.clone(),
                language: metadata.language.clone(),
            };
            provider = Some(record.provider.clone());
            self.store.store_embedding(record).await?;
            written += 1;
        }

        self.store.store_file_metadata(metadata.clone()).await?;
        tracing::debug!(path = %metadata.path, removed, written, "file embedded");
        Ok((written, provider))
    }

    /// Embed one batch through the provider chain.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddedBatch> {
        let last = self.providers.len().saturating_sub(1);
        for (position, provider) in self.providers.iter().enumerate() {
            let name = provider.name();
            if !self.health.is_available(name) {
                tracing::debug!(provider = name, "circuit open, skipping provider");
                continue;
            }

            let error = match self.call_provider(provider, texts).await {
                Ok(vectors) => match self.check_vectors(provider, texts.len(), vectors).await {
                    Ok(batch) => {
                        self.health.record_success(name);
                        return Ok(batch);
                    }
                    Err(IndexError::Embed(e)) => e,
                    Err(e) => return Err(e),
                },
                Err(e) => e,
            };

            if error.is_transient() {
                self.health.record_rate_limit(name);
                tracing::warn!(provider = name, "retries exhausted, falling back: {error}");
                if position < last && !self.config.fallback_cooldown.is_zero() {
                    tokio::time::sleep(self.config.fallback_cooldown).await;
                }
            } else {
                self.health.record_failure(name);
                tracing::warn!(provider = name, "provider failed, falling back: {error}");
            }
        }

        Err(EmbedError::NoProviderAvailable.into())
    }

    async fn call_provider(
        &self,
        provider: &AnyEmbedder,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        let _permit = self
            .batch_permits
            .acquire()
            .await
            .map_err(|e| EmbedError::Other(format!("batch pool closed: {e}")))?;
        let name = provider.name();
        let _slot = self.health.acquire(name).await;
        with_retry(name, &self.config.retry, || provider.embed_batch(texts)).await
    }

    /// Reject empty or ragged output. A uniform length other than the
    /// configured one is accepted if the store can be widened to hold it.
    async fn check_vectors(
        &self,
        provider: &AnyEmbedder,
        expected: usize,
        vectors: Vec<Vec<f32>>,
    ) -> Result<EmbeddedBatch> {
        let name = provider.name();
        if vectors.len() != expected || vectors.iter().any(Vec::is_empty) {
            return Err(EmbedError::EmptyResponse {
                provider: name.to_owned(),
            }
            .into());
        }

        let mut signature = provider.signature();
        let actual = vectors.first().map_or(0, Vec::len);
        if vectors.iter().any(|v| v.len() != actual) {
            return Err(EmbedError::Other(format!("{name} returned vectors of mixed length")).into());
        }
        if actual != signature.dimensions {
            tracing::warn!(
                provider = name,
                expected = signature.dimensions,
                actual,
                "unexpected embedding dimensions, widening store"
            );
            self.store.ensure_dimension_compatibility(actual).await?;
            signature.dimensions = actual;
        }

        Ok(EmbeddedBatch { vectors, signature })
    }

    /// Embed a search query.
    ///
    /// When the project was indexed with a model other than the live one,
    /// that model is used so query and document vectors stay comparable. If
    /// it is not configured or fails, the live chain is used and the mismatch
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::NoProviderAvailable`] if every provider fails.
    pub async fn embed_query(&self, text: &str, project_id: Option<&str>) -> Result<Vec<f32>> {
        let texts = [text.to_owned()];

        if let Some(project_id) = project_id
            && let Some(stored) = self.store.project_model(project_id).await?
            && self.active_signature().as_ref() != Some(&stored)
        {
            match self.providers.iter().find(|p| p.signature() == stored) {
                Some(provider) if self.health.is_available(provider.name()) => {
                    match self.call_provider(provider, &texts).await {
                        Ok(mut vectors) if vectors.len() == 1 && !vectors[0].is_empty() => {
                            self.health.record_success(provider.name());
                            return Ok(vectors.swap_remove(0));
                        }
                        Ok(_) => tracing::warn!(
                            project = project_id,
                            %stored,
                            "stored model returned no vector, using current configuration"
                        ),
                        Err(e) => tracing::warn!(
                            project = project_id,
                            %stored,
                            "stored model failed, using current configuration: {e}"
                        ),
                    }
                }
                _ => tracing::warn!(
                    project = project_id,
                    %stored,
                    "stored model unavailable, using current configuration"
                ),
            }
        }

        let batch = self.embed_texts(&texts).await?;
        batch.vectors.into_iter().next().ok_or_else(|| {
            EmbedError::EmptyResponse {
                provider: batch.signature.provider,
            }
            .into()
        })
    }
}

/// Split chunks longer than `max_chars` into overlapping line windows and
/// renumber the result.
///
/// The window is sized from the chunk's average line length, between
/// `overlap + 1` and the fallback window.
pub(crate) fn split_oversized(chunks: &[Chunk], max_chars: usize, overlap: usize) -> Vec<Chunk> {
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let chars = chunk.content.chars().count();
        let lines: Vec<&str> = chunk.content.lines().collect();
        if chars <= max_chars || lines.len() < 2 {
            let index = out.len();
            out.push(Chunk {
                index,
                ..chunk.clone()
            });
            continue;
        }

        let average = (chars / lines.len()).max(1);
        let window = (max_chars / average).clamp(overlap + 1, FALLBACK_WINDOW_LINES.max(overlap + 1));
        let step = window - overlap;
        let mut offset = 0;
        loop {
            let end = (offset + window).min(lines.len());
            let content = lines[offset..end].join("\n");
            let index = out.len();
            out.push(Chunk {
                token_estimate: estimate_tokens(&content),
                content,
                start_line: chunk.start_line + offset,
                end_line: chunk.start_line + end - 1,
                symbol_name: chunk.symbol_name.clone(),
                symbol_type: chunk.symbol_type.clone(),
                index,
            });
            if end == lines.len() {
                break;
            }
            offset += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use quarry_llm::mock::{MockEmbedder, MockOutcome};
    use quarry_memory::{InMemoryIndexStore, file_id};

    use super::*;
    use crate::health::CircuitState;

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
            fallback_cooldown: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(providers: Vec<AnyEmbedder>, store: Arc<InMemoryIndexStore>) -> EmbeddingPipeline {
        EmbeddingPipeline::new(
            providers,
            store,
            Arc::new(ProviderHealthRegistry::default()),
            config(),
        )
    }

    fn prepared(project: &str, path: &str, n: usize) -> PreparedFile {
        let chunks = (0..n)
            .map(|i| Chunk {
                content: format!("fn item_{i}() {{}}"),
                start_line: i + 1,
                end_line: i + 1,
                token_estimate: 4,
                symbol_name: Some(format!("item_{i}")),
                symbol_type: Some("function_item".into()),
                index: i,
            })
            .collect();
        PreparedFile {
            metadata: FileMetadata {
                id: file_id(project, path),
                project_id: project.into(),
                path: path.into(),
                content_hash: format!("hash-{n}"),
                language: "rust".into(),
                size: 100,
                line_count: n,
                last_modified: Utc::now(),
            },
            chunks,
        }
    }

    fn long_chunk(lines: usize) -> Chunk {
        let content = (1..=lines)
            .map(|i| format!("line {i:04} xxxxxxxxxx"))
            .collect::<Vec<_>>()
            .join("\n");
        Chunk {
            token_estimate: estimate_tokens(&content),
            content,
            start_line: 1,
            end_line: lines,
            symbol_name: Some("big".into()),
            symbol_type: None,
            index: 0,
        }
    }

    #[test]
    fn split_oversized_uses_overlapping_windows() {
        let small = Chunk {
            content: "fn a() {}".into(),
            start_line: 121,
            end_line: 121,
            token_estimate: 3,
            symbol_name: None,
            symbol_type: None,
            index: 1,
        };
        let out = split_oversized(&[long_chunk(120), small], 1500, 5);
        let ranges: Vec<_> = out.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 50), (46, 95), (91, 120), (121, 121)]);
        assert!(out.iter().enumerate().all(|(i, c)| c.index == i));
        assert!(out[..3].iter().all(|c| c.symbol_name.as_deref() == Some("big")));
        assert!(out[1].content.starts_with("line 0046"));
    }

    #[test]
    fn split_oversized_keeps_small_chunks() {
        let chunk = long_chunk(10);
        let out = split_oversized(std::slice::from_ref(&chunk), 10_000, 5);
        assert_eq!(out, vec![chunk]);
    }

    #[tokio::test]
    async fn generates_one_record_per_chunk() {
        let store = Arc::new(InMemoryIndexStore::new());
        let mock = MockEmbedder::new("local", 16);
        let p = pipeline(vec![mock.clone().into()], store.clone());

        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "src/a.rs", 3)], GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(progress.total_chunks, 3);
        assert_eq!(progress.embedded, 3);
        assert_eq!(progress.provider.as_deref(), Some("local:mock-embed"));

        let stats = store.get_project_stats("proj").await.unwrap();
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_files, 1);
        let meta = store.get_file_metadata("proj", "src/a.rs").await.unwrap().unwrap();
        assert_eq!(meta.content_hash, "hash-3");
    }

    #[tokio::test]
    async fn shrinking_file_drops_stale_chunks() {
        let store = Arc::new(InMemoryIndexStore::new());
        let p = pipeline(vec![MockEmbedder::new("local", 16).into()], store.clone());

        p.generate_for_project("proj", vec![prepared("proj", "a.rs", 5)], GenerateOptions::default())
            .await
            .unwrap();
        p.generate_for_project("proj", vec![prepared("proj", "a.rs", 2)], GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(store.get_project_stats("proj").await.unwrap().total_chunks, 2);
    }

    #[tokio::test]
    async fn permanent_failures_fall_through_and_open_breaker() {
        let store = Arc::new(InMemoryIndexStore::new());
        let remote = MockEmbedder::failing("remote", 16);
        let local = MockEmbedder::new("local", 16);
        let p = EmbeddingPipeline::new(
            vec![remote.clone().into(), local.clone().into()],
            store.clone(),
            Arc::new(ProviderHealthRegistry::default()),
            PipelineConfig {
                batch_size: 1,
                batch_concurrency: 1,
                ..config()
            },
        );

        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 5)], GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(progress.embedded, 5);
        assert_eq!(remote.calls(), 3, "breaker opens after three failures");
        assert_eq!(local.calls(), 5);
        assert_eq!(p.health().circuit_state("remote"), CircuitState::Open);
        assert_eq!(progress.provider.as_deref(), Some("local:mock-embed"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_records_rate_limit_not_failure() {
        let store = Arc::new(InMemoryIndexStore::new());
        let remote = MockEmbedder::new("remote", 16)
            .with_script([MockOutcome::RateLimited(None), MockOutcome::Server(503)]);
        let local = MockEmbedder::new("local", 16);
        let p = pipeline(vec![remote.clone().into(), local.clone().into()], store);

        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 2)], GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(progress.embedded, 2);
        assert_eq!(remote.calls(), 2);
        let health = p.health().snapshot("remote");
        assert_eq!(health.failure_count, 0);
        assert_eq!(health.rate_limit_hits, 1);
    }

    #[tokio::test]
    async fn no_provider_available_fails_file_only() {
        let store = Arc::new(InMemoryIndexStore::new());
        let p = pipeline(vec![MockEmbedder::failing("remote", 16).into()], store.clone());

        let progress = p
            .generate_for_project(
                "proj",
                vec![prepared("proj", "a.rs", 2), prepared("proj", "b.rs", 1)],
                GenerateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(progress.embedded, 0);
        assert_eq!(progress.files.len(), 2);
        assert!(progress.failed_batches >= 2);
        assert!(progress.files.iter().all(|f| matches!(
            f.error,
            Some(IndexError::Embed(EmbedError::NoProviderAvailable))
        )));
        assert_eq!(store.get_project_stats("proj").await.unwrap().total_files, 0);
    }

    #[tokio::test]
    async fn failed_file_keeps_previous_records() {
        let store = Arc::new(InMemoryIndexStore::new());
        let mock = MockEmbedder::new("local", 16);
        let p = pipeline(vec![mock.clone().into()], store.clone());

        p.generate_for_project("proj", vec![prepared("proj", "a.rs", 3)], GenerateOptions::default())
            .await
            .unwrap();
        mock.push([MockOutcome::Permanent]);
        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 1)], GenerateOptions::default())
            .await
            .unwrap();

        assert!(progress.files[0].error.is_some());
        assert_eq!(store.get_project_stats("proj").await.unwrap().total_chunks, 3);
    }

    #[tokio::test]
    async fn unexpected_dimensions_widen_store() {
        let store = Arc::new(InMemoryIndexStore::new());
        let mock = MockEmbedder::new("local", 16).with_script([MockOutcome::WrongDimensions(32)]);
        let p = pipeline(vec![mock.into()], store.clone());

        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 1)], GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(progress.embedded, 1);
        assert_eq!(store.widest_dimensions(), 32);
        let records = store.project_records("proj").await.unwrap();
        assert_eq!(records[0].dimensions, 32);
    }

    #[tokio::test]
    async fn dimensions_beyond_store_limit_fail_batch() {
        let store = Arc::new(InMemoryIndexStore::new().with_dimension_limit(16));
        let first = MockEmbedder::new("remote", 16).with_script([MockOutcome::WrongDimensions(64)]);
        let second = MockEmbedder::new("local", 16);
        let p = pipeline(vec![first.into(), second.clone().into()], store.clone());

        let progress = p
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 1)], GenerateOptions::default())
            .await
            .unwrap();

        assert!(matches!(progress.files[0].error, Some(IndexError::Store(_))));
        assert_eq!(second.calls(), 0);
        assert_eq!(store.get_project_stats("proj").await.unwrap().total_chunks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_does_not_hold_a_batch_slot() {
        let store = Arc::new(InMemoryIndexStore::new());
        let remote = MockEmbedder::new("remote", 16).with_script([MockOutcome::RateLimited(None)]);
        let local = MockEmbedder::new("local", 16);
        let p = Arc::new(EmbeddingPipeline::new(
            vec![remote.clone().into(), local.clone().into()],
            store,
            Arc::new(ProviderHealthRegistry::default()),
            PipelineConfig {
                file_concurrency: 2,
                batch_concurrency: 1,
                retry: RetryPolicy {
                    max_attempts: 1,
                    ..RetryPolicy::default()
                },
                fallback_cooldown: Duration::from_secs(10),
                ..PipelineConfig::default()
            },
        ));

        let run = tokio::spawn({
            let p = Arc::clone(&p);
            async move {
                p.generate_for_project(
                    "proj",
                    vec![prepared("proj", "a.rs", 1), prepared("proj", "b.rs", 1)],
                    GenerateOptions::default(),
                )
                .await
            }
        });

        // One file is cooling down; the other still gets the single slot.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.calls(), 2);
        assert_eq!(local.calls(), 0);

        let progress = run.await.unwrap().unwrap();
        assert_eq!(progress.embedded, 2);
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn model_change_clears_project_before_regenerating() {
        let store = Arc::new(InMemoryIndexStore::new());
        let old = pipeline(vec![MockEmbedder::new("old", 16).into()], store.clone());
        old.generate_for_project(
            "proj",
            vec![prepared("proj", "a.rs", 2), prepared("proj", "b.rs", 2)],
            GenerateOptions::default(),
        )
        .await
        .unwrap();

        let new = pipeline(vec![MockEmbedder::new("new", 24).into()], store.clone());
        assert!(new.needs_migration("proj").await.unwrap());
        assert_eq!(store.get_project_stats("proj").await.unwrap().total_chunks, 4);
        let progress = new
            .generate_for_project(
                "proj",
                vec![prepared("proj", "a.rs", 2)],
                GenerateOptions { verify_model: true },
            )
            .await
            .unwrap();

        assert!(progress.migrated);
        let records = store.project_records("proj").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.provider == "new:mock-embed" && r.dimensions == 24));
    }

    #[tokio::test]
    async fn unchanged_model_does_not_migrate() {
        let store = Arc::new(InMemoryIndexStore::new());
        let p = pipeline(vec![MockEmbedder::new("local", 16).into()], store.clone());
        p.generate_for_project("proj", vec![prepared("proj", "a.rs", 2)], GenerateOptions::default())
            .await
            .unwrap();

        assert!(!p.needs_migration("proj").await.unwrap());
        assert!(!p.ensure_model_compatibility("proj").await.unwrap());
        assert_eq!(store.get_project_stats("proj").await.unwrap().total_chunks, 2);
    }

    #[tokio::test]
    async fn query_uses_stored_model() {
        let store = Arc::new(InMemoryIndexStore::new());
        let stored = MockEmbedder::new("stored", 16);
        pipeline(vec![stored.clone().into()], store.clone())
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 1)], GenerateOptions::default())
            .await
            .unwrap();
        let before = stored.calls();

        let live = MockEmbedder::new("live", 8);
        let p = pipeline(vec![live.clone().into(), stored.clone().into()], store);
        let vector = p.embed_query("find item", Some("proj")).await.unwrap();

        assert_eq!(vector.len(), 16);
        assert_eq!(stored.calls(), before + 1);
        assert_eq!(live.calls(), 0);
    }

    #[tokio::test]
    async fn query_falls_back_when_stored_model_missing() {
        let store = Arc::new(InMemoryIndexStore::new());
        pipeline(vec![MockEmbedder::new("gone", 16).into()], store.clone())
            .generate_for_project("proj", vec![prepared("proj", "a.rs", 1)], GenerateOptions::default())
            .await
            .unwrap();

        let live = MockEmbedder::new("live", 8);
        let p = pipeline(vec![live.clone().into()], store);
        let vector = p.embed_query("find item", Some("proj")).await.unwrap();
        assert_eq!(vector.len(), 8);
        assert_eq!(live.calls(), 1);
    }
}
