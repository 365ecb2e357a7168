use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::EmbedError;
use crate::provider::EmbeddingProvider;

const PROVIDER_NAME: &str = "ollama";

/// Embeddings from a local Ollama daemon.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Ollama,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    #[must_use]
    pub fn new(base_url: &str, model: String, dimensions: usize) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
            dimensions,
        }
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = GenerateEmbeddingsRequest::new(
            self.model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| classify_ollama_error(&e.to_string()))?;

        if response.embeddings.is_empty() {
            return Err(EmbedError::EmptyResponse {
                provider: PROVIDER_NAME.into(),
            });
        }
        Ok(response.embeddings)
    }
}

/// Error text that no retry can fix: a missing model, a request the daemon
/// rejects or a response that does not decode.
const PERMANENT_MARKERS: &[&str] = &[
    "not found",
    "pull",
    "invalid",
    "bad request",
    "unsupported",
    "does not support",
    "decod",
    "deserializ",
    "missing field",
    "unknown variant",
    "expected",
];

/// The Ollama client only exposes error text. Anything not recognized as
/// permanent is treated as the daemon being temporarily unavailable.
fn classify_ollama_error(message: &str) -> EmbedError {
    let lower = message.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        EmbedError::Permanent {
            provider: PROVIDER_NAME.into(),
            message: message.to_owned(),
        }
    } else {
        EmbedError::Unavailable {
            provider: PROVIDER_NAME.into(),
            message: message.to_owned(),
        }
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), 11434)
}
