use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use quarry_llm::ModelSignature;

use crate::error::{Result, StoreError};
use crate::store::{BoxFuture, IndexStore};
use crate::types::{
    EmbeddingRecord, FileMetadata, ModelChange, ProjectStats, ScoredRecord, cosine_similarity,
    majority_signature, model_change, normalize_rel_path,
};

#[derive(Default)]
struct State {
    files: HashMap<String, FileMetadata>,
    embeddings: HashMap<String, EmbeddingRecord>,
    last_updated: HashMap<String, DateTime<Utc>>,
    widest_dimensions: usize,
}

impl State {
    fn touch(&mut self, project_id: &str) {
        self.last_updated.insert(project_id.to_owned(), Utc::now());
    }

    fn signatures(&self, project_id: &str) -> Vec<(ModelSignature, usize)> {
        let mut counts: HashMap<ModelSignature, usize> = HashMap::new();
        for rec in self.embeddings.values().filter(|r| r.project_id == project_id) {
            *counts.entry(rec.signature()).or_default() += 1;
        }
        counts.into_iter().collect()
    }
}

/// Process-local store, used in tests and when no database is configured.
pub struct InMemoryIndexStore {
    state: RwLock<State>,
    dimension_limit: Option<usize>,
}

impl InMemoryIndexStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            dimension_limit: None,
        }
    }

    /// Reject vectors longer than `limit`.
    #[must_use]
    pub fn with_dimension_limit(mut self, limit: usize) -> Self {
        self.dimension_limit = Some(limit);
        self
    }

    /// Widest vector length accepted so far.
    #[must_use]
    pub fn widest_dimensions(&self) -> usize {
        self.read().map(|s| s.widest_dimensions).unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIndexStore")
            .field("dimension_limit", &self.dimension_limit)
            .finish_non_exhaustive()
    }
}

impl IndexStore for InMemoryIndexStore {
    fn store_file_metadata(&self, meta: FileMetadata) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.write()?;
            state.touch(&meta.project_id);
            state.files.insert(meta.id.clone(), meta);
            Ok(())
        })
    }

    fn get_file_metadata(
        &self,
        project_id: &str,
        path: &str,
    ) -> BoxFuture<'_, Result<Option<FileMetadata>>> {
        let project_id = project_id.to_owned();
        let path = normalize_rel_path(path);
        Box::pin(async move {
            let state = self.read()?;
            Ok(state
                .files
                .values()
                .find(|f| f.project_id == project_id && f.path == path)
                .cloned())
        })
    }

    fn list_files(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<FileMetadata>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let state = self.read()?;
            let mut files: Vec<FileMetadata> = state
                .files
                .values()
                .filter(|f| f.project_id == project_id)
                .cloned()
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(files)
        })
    }

    fn delete_file(&self, file_id: &str) -> BoxFuture<'_, Result<()>> {
        let file_id = file_id.to_owned();
        Box::pin(async move {
            let mut state = self.write()?;
            if let Some(meta) = state.files.remove(&file_id) {
                state.touch(&meta.project_id);
            }
            state.embeddings.retain(|_, r| r.file_id != file_id);
            Ok(())
        })
    }

    fn delete_embeddings_by_file(&self, file_id: &str) -> BoxFuture<'_, Result<usize>> {
        let file_id = file_id.to_owned();
        Box::pin(async move {
            let mut state = self.write()?;
            let before = state.embeddings.len();
            state.embeddings.retain(|_, r| r.file_id != file_id);
            Ok(before - state.embeddings.len())
        })
    }

    fn store_embedding(&self, record: EmbeddingRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(limit) = self.dimension_limit
                && record.dimensions > limit
            {
                return Err(StoreError::DimensionUnsupported {
                    requested: record.dimensions,
                    limit,
                });
            }
            let mut state = self.write()?;
            state.widest_dimensions = state.widest_dimensions.max(record.dimensions);
            state.touch(&record.project_id);
            state.embeddings.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn get_project_stats(&self, project_id: &str) -> BoxFuture<'_, Result<ProjectStats>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let state = self.read()?;
            Ok(ProjectStats {
                total_chunks: state
                    .embeddings
                    .values()
                    .filter(|r| r.project_id == project_id)
                    .count(),
                total_files: state
                    .files
                    .values()
                    .filter(|f| f.project_id == project_id)
                    .count(),
                last_updated: state.last_updated.get(&project_id).copied(),
            })
        })
    }

    fn ensure_dimension_compatibility(&self, dimensions: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(limit) = self.dimension_limit
                && dimensions > limit
            {
                return Err(StoreError::DimensionUnsupported {
                    requested: dimensions,
                    limit,
                });
            }
            let mut state = self.write()?;
            if dimensions > state.widest_dimensions {
                tracing::info!(
                    from = state.widest_dimensions,
                    to = dimensions,
                    "widening in-memory vector schema"
                );
                state.widest_dimensions = dimensions;
            }
            Ok(())
        })
    }

    fn search_similar(
        &self,
        project_id: &str,
        vector: Vec<f32>,
        k: usize,
        min_score: f32,
    ) -> BoxFuture<'_, Result<Vec<ScoredRecord>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let state = self.read()?;
            let mut scored: Vec<ScoredRecord> = state
                .embeddings
                .values()
                .filter(|r| r.project_id == project_id && r.vector.len() == vector.len())
                .map(|r| ScoredRecord {
                    score: cosine_similarity(&vector, &r.vector),
                    record: r.clone(),
                })
                .filter(|s| s.score >= min_score)
                .collect();
            scored.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.record.id.cmp(&b.record.id))
            });
            scored.truncate(k);
            Ok(scored)
        })
    }

    fn check_model_change(
        &self,
        project_id: &str,
        current: &ModelSignature,
    ) -> BoxFuture<'_, Result<ModelChange>> {
        let project_id = project_id.to_owned();
        let current = current.clone();
        Box::pin(async move {
            let state = self.read()?;
            Ok(model_change(&state.signatures(&project_id), &current))
        })
    }

    fn project_model(&self, project_id: &str) -> BoxFuture<'_, Result<Option<ModelSignature>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let state = self.read()?;
            let distinct = state.signatures(&project_id);
            Ok(majority_signature(distinct.iter().map(|(s, c)| (s, *c))))
        })
    }

    fn clear_project_embeddings(&self, project_id: &str) -> BoxFuture<'_, Result<usize>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let mut state = self.write()?;
            let before = state.embeddings.len();
            state.embeddings.retain(|_, r| r.project_id != project_id);
            state.files.retain(|_, f| f.project_id != project_id);
            state.touch(&project_id);
            Ok(before - state.embeddings.len())
        })
    }

    fn project_records(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<EmbeddingRecord>>> {
        let project_id = project_id.to_owned();
        Box::pin(async move {
            let state = self.read()?;
            let mut records: Vec<EmbeddingRecord> = state
                .embeddings
                .values()
                .filter(|r| r.project_id == project_id)
                .cloned()
                .collect();
            records.sort_by(|a, b| {
                a.file_path
                    .cmp(&b.file_path)
                    .then(a.chunk_index.cmp(&b.chunk_index))
            });
            Ok(records)
        })
    }
}
