use std::future::Future;
use std::pin::Pin;

use quarry_llm::ModelSignature;

use crate::error::Result;
use crate::types::{EmbeddingRecord, FileMetadata, ModelChange, ProjectStats, ScoredRecord};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistent home for file metadata and chunk embeddings.
///
/// Implementations serialize conflicting writes themselves; callers
/// additionally run at most one writer per project at a time.
pub trait IndexStore: Send + Sync {
    /// Insert or replace metadata keyed by `meta.id`.
    fn store_file_metadata(&self, meta: FileMetadata) -> BoxFuture<'_, Result<()>>;

    fn get_file_metadata(
        &self,
        project_id: &str,
        path: &str,
    ) -> BoxFuture<'_, Result<Option<FileMetadata>>>;

    fn list_files(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<FileMetadata>>>;

    /// Remove a file's metadata together with its embeddings.
    fn delete_file(&self, file_id: &str) -> BoxFuture<'_, Result<()>>;

    /// Returns how many records were removed.
    fn delete_embeddings_by_file(&self, file_id: &str) -> BoxFuture<'_, Result<usize>>;

    /// Insert or overwrite the record keyed by `record.id`.
    fn store_embedding(&self, record: EmbeddingRecord) -> BoxFuture<'_, Result<()>>;

    fn get_project_stats(&self, project_id: &str) -> BoxFuture<'_, Result<ProjectStats>>;

    /// Make sure vectors of `dimensions` length can be stored, widening the
    /// schema when possible.
    fn ensure_dimension_compatibility(&self, dimensions: usize) -> BoxFuture<'_, Result<()>>;

    /// Cosine nearest neighbours among the project's records whose length
    /// matches `vector`, best first, keeping only `score >= min_score`.
    fn search_similar(
        &self,
        project_id: &str,
        vector: Vec<f32>,
        k: usize,
        min_score: f32,
    ) -> BoxFuture<'_, Result<Vec<ScoredRecord>>>;

    /// Compare the stored embedding space with `current`. Mixed signatures
    /// count as a change.
    fn check_model_change(
        &self,
        project_id: &str,
        current: &ModelSignature,
    ) -> BoxFuture<'_, Result<ModelChange>>;

    /// Signature most of the project's records were produced with.
    fn project_model(&self, project_id: &str) -> BoxFuture<'_, Result<Option<ModelSignature>>>;

    /// Drop every embedding and file record of the project so the next run
    /// regenerates everything. Returns the number of embeddings removed.
    fn clear_project_embeddings(&self, project_id: &str) -> BoxFuture<'_, Result<usize>>;

    /// All records of a project, ordered by path then chunk index.
    fn project_records(&self, project_id: &str) -> BoxFuture<'_, Result<Vec<EmbeddingRecord>>>;
}
