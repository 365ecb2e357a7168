use serde::{Deserialize, Serialize};

use crate::error::EmbedError;

/// Vector encoding every bundled provider produces.
pub const FORMAT_FLOAT32: &str = "float32";

/// Identity of the embedding space a vector belongs to.
///
/// Two vectors are only comparable when their signatures are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSignature {
    /// `name:model`, e.g. `openai:text-embedding-3-small`.
    pub provider: String,
    pub dimensions: usize,
    pub format: String,
}

impl ModelSignature {
    #[must_use]
    pub fn new(provider: impl Into<String>, dimensions: usize, format: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            dimensions,
            format: format.into(),
        }
    }
}

impl std::fmt::Display for ModelSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}d, {})", self.provider, self.dimensions, self.format)
    }
}

pub trait EmbeddingProvider: Send + Sync {
    /// Short provider name, used as the key for health tracking.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Dimensionality the provider is configured to return.
    fn dimensions(&self) -> usize;

    fn format(&self) -> &str {
        FORMAT_FLOAT32
    }

    /// Embed a batch of texts, returning one vector per input in order.
    ///
    /// # Errors
    ///
    /// Returns a transient [`EmbedError`] for rate limiting or server-side
    /// failures and a permanent one for auth, config or model errors.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, EmbedError>> + Send;

    fn signature(&self) -> ModelSignature {
        ModelSignature::new(
            format!("{}:{}", self.name(), self.model()),
            self.dimensions(),
            self.format(),
        )
    }
}
