//! Storage and identity collaborators for the indexer.
//!
//! [`IndexStore`] persists file metadata and chunk embeddings;
//! [`ProjectIdentifier`] maps a directory to a stable project id.

pub mod error;
pub mod in_memory_store;
pub mod project;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use in_memory_store::InMemoryIndexStore;
pub use project::{ProjectIdentifier, WorkspaceIdentifier};
pub use sqlite::SqliteIndexStore;
pub use store::{BoxFuture, IndexStore};
pub use types::{
    EmbeddingRecord, FileMetadata, GitInfo, ModelChange, ProjectInfo, ProjectStats, ScoredRecord,
    embedding_id, file_id, normalize_rel_path,
};
