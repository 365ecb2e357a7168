//! Incremental code indexing and retrieval.
//!
//! Source files are split into symbol-aligned chunks with tree-sitter (line
//! windows when parsing is not possible), embedded through a provider chain
//! that survives rate limits and outages, persisted through an
//! [`IndexStore`](quarry_memory::IndexStore) and kept fresh by a debounced
//! file watcher. A lexical index over the same chunks serves as offline
//! fallback and as the second signal for hybrid retrieval.

pub mod chunker;
pub(crate) mod context;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod health;
pub mod languages;
pub mod lexical;
pub mod pipeline;
pub mod retriever;
pub mod session;
pub mod watcher;

pub use chunker::{Chunk, CodeChunker, ParseOutcome, Symbol, estimate_tokens};
pub use coordinator::{CoordinatorConfig, IndexOptions, ProjectIndexCoordinator, ProjectStatus};
pub use error::{IndexError, Result};
pub use filter::IgnoreRules;
pub use health::{CircuitState, HealthConfig, ProviderHealth, ProviderHealthRegistry};
pub use lexical::{LexicalHit, LexicalSearchIndex};
pub use pipeline::{EmbeddingPipeline, EmbeddingProgress, GenerateOptions, PipelineConfig};
pub use retriever::{
    CodeRetriever, RetrievalConfig, RetrievalStrategy, RetrievedChunk, RetrievedCode,
    format_as_context,
};
pub use session::{IndexingSession, SessionStatus};
pub use watcher::{ChangeWatcher, WatchConfig};
