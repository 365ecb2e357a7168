//! Scripted embedder for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::EmbedError;
use crate::local::hash_embed;
use crate::provider::EmbeddingProvider;

/// What the next `embed_batch` call does. Once the script runs out every call
/// succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    Ok,
    RateLimited(Option<Duration>),
    Server(u16),
    Permanent,
    /// Return vectors of this length instead of the configured dimensions.
    WrongDimensions(usize),
    Empty,
}

#[derive(Debug, Clone)]
pub struct MockEmbedder {
    name: String,
    model: String,
    dimensions: usize,
    script: Arc<Mutex<VecDeque<MockOutcome>>>,
    calls: Arc<AtomicUsize>,
    texts_seen: Arc<AtomicUsize>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new("mock", 16)
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            model: "mock-embed".into(),
            dimensions,
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            texts_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.push(outcomes);
        self
    }

    /// Every call fails permanently.
    #[must_use]
    pub fn failing(name: impl Into<String>, dimensions: usize) -> Self {
        Self::new(name, dimensions).with_script(std::iter::repeat_n(MockOutcome::Permanent, 10_000))
    }

    pub fn push(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        let mut script = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        script.extend(outcomes);
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total number of texts passed across all calls.
    #[must_use]
    pub fn texts_seen(&self) -> usize {
        self.texts_seen.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(MockOutcome::Ok)
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);

        match self.next_outcome() {
            MockOutcome::Ok => Ok(texts
                .iter()
                .map(|t| hash_embed(t, self.dimensions))
                .collect()),
            MockOutcome::RateLimited(retry_after) => Err(EmbedError::RateLimited {
                provider: self.name.clone(),
                retry_after,
            }),
            MockOutcome::Server(status) => Err(EmbedError::Server {
                provider: self.name.clone(),
                status,
            }),
            MockOutcome::Permanent => Err(EmbedError::Permanent {
                provider: self.name.clone(),
                message: "mock permanent failure".into(),
            }),
            MockOutcome::WrongDimensions(n) => Ok(texts.iter().map(|t| hash_embed(t, n)).collect()),
            MockOutcome::Empty => Err(EmbedError::EmptyResponse {
                provider: self.name.clone(),
            }),
        }
    }
}
