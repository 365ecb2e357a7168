use crate::error::EmbedError;
use crate::local::LocalEmbedder;
#[cfg(feature = "mock")]
use crate::mock::MockEmbedder;
use crate::ollama::OllamaEmbedder;
use crate::openai::OpenAiEmbedder;
use crate::provider::EmbeddingProvider;

/// Generates a match over all `AnyEmbedder` variants, binding the inner
/// embedder and evaluating the given expression for each arm.
macro_rules! delegate_embedder {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::OpenAi($p) => $expr,
            AnyEmbedder::Ollama($p) => $expr,
            AnyEmbedder::Local($p) => $expr,
            #[cfg(feature = "mock")]
            AnyEmbedder::Mock($p) => $expr,
        }
    };
}

/// Closed set of embedders a provider chain can hold.
#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    OpenAi(OpenAiEmbedder),
    Ollama(OllamaEmbedder),
    Local(LocalEmbedder),
    #[cfg(feature = "mock")]
    Mock(MockEmbedder),
}

impl EmbeddingProvider for AnyEmbedder {
    fn name(&self) -> &str {
        delegate_embedder!(self, |p| p.name())
    }

    fn model(&self) -> &str {
        delegate_embedder!(self, |p| p.model())
    }

    fn dimensions(&self) -> usize {
        delegate_embedder!(self, |p| p.dimensions())
    }

    fn format(&self) -> &str {
        delegate_embedder!(self, |p| p.format())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        delegate_embedder!(self, |p| p.embed_batch(texts).await)
    }
}

impl From<OpenAiEmbedder> for AnyEmbedder {
    fn from(p: OpenAiEmbedder) -> Self {
        Self::OpenAi(p)
    }
}

impl From<OllamaEmbedder> for AnyEmbedder {
    fn from(p: OllamaEmbedder) -> Self {
        Self::Ollama(p)
    }
}

impl From<LocalEmbedder> for AnyEmbedder {
    fn from(p: LocalEmbedder) -> Self {
        Self::Local(p)
    }
}

#[cfg(feature = "mock")]
impl From<MockEmbedder> for AnyEmbedder {
    fn from(p: MockEmbedder) -> Self {
        Self::Mock(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegates_identity() {
        let any = AnyEmbedder::from(LocalEmbedder::new(48));
        assert_eq!(any.name(), "local");
        assert_eq!(any.dimensions(), 48);
        assert_eq!(any.signature().provider, "local:feature-hash-v1");
    }

    #[test]
    fn openai_variant_identity() {
        let any = AnyEmbedder::from(OpenAiEmbedder::new(
            "sk-test".into(),
            "https://api.openai.com/v1".into(),
            "text-embedding-3-small".into(),
            1536,
        ));
        assert_eq!(any.name(), "openai");
        assert_eq!(any.model(), "text-embedding-3-small");
    }

    #[tokio::test]
    async fn delegates_embedding() {
        let any = AnyEmbedder::from(LocalEmbedder::new(8));
        let out = any.embed_batch(&["x".to_owned()]).await.unwrap();
        assert_eq!(out[0].len(), 8);
    }
}
