//! Error types for quarry-index.

/// Errors that can occur during indexing and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistent store error.
    #[error("store error: {0}")]
    Store(#[from] quarry_memory::StoreError),

    /// Embedding provider error.
    #[error("embedding error: {0}")]
    Embed(#[from] quarry_llm::EmbedError),

    /// Tree-sitter parsing error. Always recovered by line chunking.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Unsupported or unrecognized language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// The project tree could not be enumerated.
    #[error("file discovery failed: {0}")]
    Discovery(String),

    /// The directory could not be resolved to a project.
    #[error("project identification failed: {0}")]
    ProjectIdentity(String),

    /// A fatal error ended an indexing session; the session is marked failed.
    #[error("indexing session failed: {source}")]
    SessionFailed {
        session: Box<crate::session::IndexingSession>,
        #[source]
        source: Box<IndexError>,
    },

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
