//! Embedding provider clients and the shared error taxonomy.
//!
//! Every client turns a batch of texts into vectors and reports failures as
//! [`EmbedError`], which separates transient conditions (rate limiting, 5xx,
//! unreachable endpoint) from permanent ones (auth, config, unknown model).

pub mod any;
pub mod error;
pub(crate) mod http;
pub mod local;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use any::AnyEmbedder;
pub use error::EmbedError;
pub use provider::{EmbeddingProvider, ModelSignature};
pub use retry::RetryPolicy;
