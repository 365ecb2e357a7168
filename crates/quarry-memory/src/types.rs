use std::path::PathBuf;

use chrono::{DateTime, Utc};
use quarry_llm::ModelSignature;
use serde::{Deserialize, Serialize};

/// Namespace for every id derived by this crate (uuid v5).
pub const ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6b1f_0c4e_93a2_4d7e_8f15_2c3b_9a40_d1e7);

/// Metadata for one indexed file.
///
/// `content_hash` is the fingerprint the coordinator compares against to skip
/// unchanged files. It is only written after the file's embeddings succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub project_id: String,
    /// Relative to the workspace root, `/`-separated.
    pub path: String,
    pub content_hash: String,
    pub language: String,
    pub size: u64,
    pub line_count: usize,
    pub last_modified: DateTime<Utc>,
}

/// One embedded chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub project_id: String,
    pub file_id: String,
    pub file_path: String,
    pub chunk_index: usize,
    pub content: String,
    pub vector: Vec<f32>,
    pub dimensions: usize,
    pub format: String,
    /// `name:model` of the embedder that produced `vector`.
    pub provider: String,
    /// Fingerprint of the whole file at embedding time.
    pub content_hash: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub symbol_type: Option<String>,
    pub language: String,
}

impl EmbeddingRecord {
    #[must_use]
    pub fn signature(&self) -> ModelSignature {
        ModelSignature::new(self.provider.clone(), self.dimensions, self.format.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelChange {
    pub changed: bool,
    pub migration_recommended: bool,
    /// Signature held by most of the project's records, if any exist.
    pub previous: Option<ModelSignature>,
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: EmbeddingRecord,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitInfo {
    pub remote: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub workspace_root: PathBuf,
    pub git: Option<GitInfo>,
}

/// Normalize a relative path to the form ids are derived from.
#[must_use]
pub fn normalize_rel_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches("./").trim_start_matches('/');
    trimmed.to_owned()
}

#[must_use]
pub fn file_id(project_id: &str, rel_path: &str) -> String {
    let key = format!("file:{project_id}:{}", normalize_rel_path(rel_path));
    uuid::Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

#[must_use]
pub fn embedding_id(project_id: &str, rel_path: &str, chunk_index: usize) -> String {
    let key = format!(
        "chunk:{project_id}:{}:{chunk_index}",
        normalize_rel_path(rel_path)
    );
    uuid::Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Signature held by the most records; ties go to the lexicographically
/// smallest provider so the choice is stable.
pub(crate) fn majority_signature<'a>(
    signatures: impl IntoIterator<Item = (&'a ModelSignature, usize)>,
) -> Option<ModelSignature> {
    signatures
        .into_iter()
        .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then_with(|| sb.provider.cmp(&sa.provider)))
        .map(|(s, _)| s.clone())
}

pub(crate) fn model_change(
    distinct: &[(ModelSignature, usize)],
    current: &ModelSignature,
) -> ModelChange {
    if distinct.is_empty() {
        return ModelChange::default();
    }
    let previous = majority_signature(distinct.iter().map(|(s, c)| (s, *c)));
    let changed = distinct.len() > 1 || distinct.iter().any(|(s, _)| s != current);
    ModelChange {
        changed,
        migration_recommended: changed,
        previous,
    }
}
