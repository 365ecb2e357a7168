//! Hybrid code retrieval: vector search fused with lexical ranking.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use quarry_memory::IndexStore;

use crate::context::chunk_display_header;
use crate::error::{IndexError, Result};
use crate::lexical::LexicalSearchIndex;
use crate::pipeline::EmbeddingPipeline;

/// How a result set was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// Vector and lexical rankings fused.
    Hybrid,
    /// No provider could embed the query; keyword ranking only.
    LexicalOnly,
}

/// Retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Candidates fetched from each ranking before fusion.
    pub candidates: usize,
    /// Minimum cosine similarity for vector hits.
    pub score_threshold: f32,
    /// Reciprocal-rank-fusion constant.
    pub rrf_k: f32,
    pub semantic_weight: f32,
    pub lexical_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidates: 24,
            score_threshold: 0.2,
            rrf_k: 60.0,
            semantic_weight: 1.0,
            lexical_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub content: String,
    /// Fused score; only comparable within one result set.
    pub score: f32,
    pub semantic: bool,
    pub lexical: bool,
}

impl RetrievedChunk {
    /// One-line location label, e.g. `src/lib.rs :: parse (lines 4-18)`.
    #[must_use]
    pub fn header(&self) -> String {
        chunk_display_header(
            &self.file_path,
            self.symbol_name.as_deref(),
            self.start_line,
            self.end_line,
        )
    }
}

#[derive(Debug)]
pub struct RetrievedCode {
    pub chunks: Vec<RetrievedChunk>,
    pub strategy: RetrievalStrategy,
}

pub struct CodeRetriever {
    pipeline: Arc<EmbeddingPipeline>,
    store: Arc<dyn IndexStore>,
    lexical: Arc<LexicalSearchIndex>,
    config: RetrievalConfig,
}

impl CodeRetriever {
    #[must_use]
    pub fn new(
        pipeline: Arc<EmbeddingPipeline>,
        store: Arc<dyn IndexStore>,
        lexical: Arc<LexicalSearchIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pipeline,
            store,
            lexical,
            config,
        }
    }

    /// Top `k` chunks of `project_id` for `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store search fails. Embedding failures
    /// degrade to lexical-only results instead.
    pub async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<RetrievedCode> {
        let candidates = self.config.candidates.max(k);
        let lexical: Vec<RetrievedChunk> = self
            .lexical
            .search(project_id, query, candidates)
            .into_iter()
            .map(|hit| RetrievedChunk {
                file_path: hit.entry.file_path,
                start_line: hit.entry.start_line,
                end_line: hit.entry.end_line,
                symbol_name: hit.entry.symbol_name,
                content: hit.entry.content,
                score: hit.score,
                semantic: false,
                lexical: true,
            })
            .collect();

        let vector = match self.pipeline.embed_query(query, Some(project_id)).await {
            Ok(vector) => vector,
            Err(IndexError::Embed(e)) => {
                tracing::warn!(project = project_id, "query embedding failed, lexical only: {e}");
                let mut chunks = lexical;
                chunks.truncate(k);
                return Ok(RetrievedCode {
                    chunks,
                    strategy: RetrievalStrategy::LexicalOnly,
                });
            }
            Err(e) => return Err(e),
        };

        let semantic: Vec<RetrievedChunk> = self
            .store
            .search_similar(project_id, vector, candidates, self.config.score_threshold)
            .await?
            .into_iter()
            .map(|hit| RetrievedChunk {
                file_path: hit.record.file_path,
                start_line: hit.record.start_line,
                end_line: hit.record.end_line,
                symbol_name: hit.record.symbol_name,
                content: hit.record.content,
                score: hit.score,
                semantic: true,
                lexical: false,
            })
            .collect();

        let mut chunks = fuse(&self.config, semantic, lexical);
        chunks.truncate(k);
        Ok(RetrievedCode {
            chunks,
            strategy: RetrievalStrategy::Hybrid,
        })
    }
}

/// Reciprocal rank fusion: `score(d) = Σ weight / (k + rank + 1)`.
///
/// Results with the same file and line range merge; ties keep the order in
/// which results were first seen, vector hits first.
#[allow(clippy::cast_precision_loss)]
fn fuse(
    config: &RetrievalConfig,
    semantic: Vec<RetrievedChunk>,
    lexical: Vec<RetrievedChunk>,
) -> Vec<RetrievedChunk> {
    let mut merged: Vec<RetrievedChunk> = Vec::with_capacity(semantic.len() + lexical.len());
    let mut positions: HashMap<(String, usize, usize), usize> = HashMap::new();

    let ranked = semantic
        .into_iter()
        .enumerate()
        .map(|(rank, c)| (rank, config.semantic_weight, c))
        .chain(
            lexical
                .into_iter()
                .enumerate()
                .map(|(rank, c)| (rank, config.lexical_weight, c)),
        );

    for (rank, weight, chunk) in ranked {
        let contribution = weight / (config.rrf_k + rank as f32 + 1.0);
        let key = (chunk.file_path.clone(), chunk.start_line, chunk.end_line);
        if let Some(&pos) = positions.get(&key) {
            let existing = &mut merged[pos];
            existing.score += contribution;
            existing.semantic |= chunk.semantic;
            existing.lexical |= chunk.lexical;
            if existing.symbol_name.is_none() {
                existing.symbol_name = chunk.symbol_name;
            }
        } else {
            positions.insert(key, merged.len());
            merged.push(RetrievedChunk {
                score: contribution,
                ..chunk
            });
        }
    }

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged
}

/// Format retrieved chunks as XML for injection into a prompt.
#[must_use]
pub fn format_as_context(result: &RetrievedCode) -> String {
    if result.chunks.is_empty() {
        return String::new();
    }

    let mut out = String::from("<code_context>\n");

    for chunk in &result.chunks {
        let _ = write!(
            out,
            "  <chunk file=\"{}\" lines=\"{}-{}\"",
            chunk.file_path, chunk.start_line, chunk.end_line,
        );
        if let Some(name) = &chunk.symbol_name {
            let _ = write!(out, " name=\"{name}\"");
        }
        let _ = writeln!(out, " score=\"{:.3}\">", chunk.score);
        out.push_str(&chunk.content);
        out.push_str("\n  </chunk>\n");
    }

    out.push_str("</code_context>");
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use quarry_llm::mock::MockEmbedder;
    use quarry_memory::{FileMetadata, InMemoryIndexStore, file_id};

    use super::*;
    use crate::chunker::Chunk;
    use crate::health::ProviderHealthRegistry;
    use crate::pipeline::{GenerateOptions, PipelineConfig, PreparedFile};

    fn chunk(path: &str, start: usize, end: usize, name: Option<&str>) -> RetrievedChunk {
        RetrievedChunk {
            file_path: path.into(),
            start_line: start,
            end_line: end,
            symbol_name: name.map(str::to_owned),
            content: String::new(),
            score: 0.0,
            semantic: false,
            lexical: false,
        }
    }

    #[test]
    fn fusion_rewards_agreement() {
        let config = RetrievalConfig::default();
        let semantic = vec![
            RetrievedChunk { semantic: true, ..chunk("a.rs", 1, 10, None) },
            RetrievedChunk { semantic: true, ..chunk("b.rs", 1, 10, None) },
        ];
        let lexical = vec![
            RetrievedChunk { lexical: true, ..chunk("b.rs", 1, 10, Some("total")) },
            RetrievedChunk { lexical: true, ..chunk("c.rs", 5, 6, None) },
        ];

        let fused = fuse(&config, semantic, lexical);
        let order: Vec<_> = fused.iter().map(|c| c.file_path.as_str()).collect();
        assert_eq!(order, vec!["b.rs", "a.rs", "c.rs"]);
        assert!(fused[0].semantic && fused[0].lexical);
        assert_eq!(fused[0].symbol_name.as_deref(), Some("total"));
        assert!((fused[1].score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn fusion_scores_descend() {
        let config = RetrievalConfig::default();
        let lexical = (0..5).map(|i| chunk("x.rs", i, i, None)).collect();
        let fused = fuse(&config, Vec::new(), lexical);
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(fused[0].start_line, 0);
    }

    #[test]
    fn header_names_location() {
        assert_eq!(
            chunk("src/a.rs", 4, 18, Some("parse")).header(),
            "src/a.rs :: parse (lines 4-18)"
        );
        assert_eq!(chunk("a.py", 1, 2, None).header(), "a.py (lines 1-2)");
    }

    #[test]
    fn format_as_context_empty() {
        let result = RetrievedCode {
            chunks: vec![],
            strategy: RetrievalStrategy::Hybrid,
        };
        assert_eq!(format_as_context(&result), "");
    }

    #[test]
    fn format_as_context_xml() {
        let result = RetrievedCode {
            chunks: vec![RetrievedChunk {
                content: "fn hello() {}".into(),
                score: 0.0328,
                ..chunk("src/lib.rs", 1, 3, Some("hello"))
            }],
            strategy: RetrievalStrategy::Hybrid,
        };
        let xml = format_as_context(&result);
        assert!(xml.starts_with("<code_context>"));
        assert!(xml.ends_with("</code_context>"));
        assert!(xml.contains("file=\"src/lib.rs\" lines=\"1-3\" name=\"hello\" score=\"0.033\""));
        assert!(xml.contains("fn hello() {}"));
    }

    async fn indexed(providers: Vec<quarry_llm::AnyEmbedder>) -> (CodeRetriever, Arc<InMemoryIndexStore>) {
        let store = Arc::new(InMemoryIndexStore::new());
        let lexical = Arc::new(LexicalSearchIndex::new());
        let seed = EmbeddingPipeline::new(
            vec![MockEmbedder::new("local", 32).into()],
            store.clone(),
            Arc::new(ProviderHealthRegistry::default()),
            PipelineConfig::default(),
        );
        let chunks = vec![
            Chunk {
                content: "fn calculate_total(items: &[u32]) -> u32 { items.iter().sum() }".into(),
                start_line: 1,
                end_line: 1,
                token_estimate: 16,
                symbol_name: Some("calculate_total".into()),
                symbol_type: Some("function_item".into()),
                index: 0,
            },
            Chunk {
                content: "fn render_page() -> String { String::new() }".into(),
                start_line: 2,
                end_line: 2,
                token_estimate: 11,
                symbol_name: Some("render_page".into()),
                symbol_type: Some("function_item".into()),
                index: 1,
            },
        ];
        lexical.index_file("proj", "src/lib.rs", &chunks, &[]);
        seed.generate_for_project(
            "proj",
            vec![PreparedFile {
                metadata: FileMetadata {
                    id: file_id("proj", "src/lib.rs"),
                    project_id: "proj".into(),
                    path: "src/lib.rs".into(),
                    content_hash: "h".into(),
                    language: "rust".into(),
                    size: 10,
                    line_count: 2,
                    last_modified: Utc::now(),
                },
                chunks,
            }],
            GenerateOptions::default(),
        )
        .await
        .unwrap();

        let pipeline = Arc::new(EmbeddingPipeline::new(
            providers,
            store.clone(),
            Arc::new(ProviderHealthRegistry::default()),
            PipelineConfig {
                fallback_cooldown: std::time::Duration::ZERO,
                ..PipelineConfig::default()
            },
        ));
        let retriever = CodeRetriever::new(pipeline, store.clone(), lexical, RetrievalConfig {
            score_threshold: -1.0,
            ..RetrievalConfig::default()
        });
        (retriever, store)
    }

    #[tokio::test]
    async fn hybrid_retrieval_ranks_matching_chunk_first() {
        let (retriever, _) = indexed(vec![MockEmbedder::new("local", 32).into()]).await;
        let result = retriever.retrieve("proj", "calculate_total", 5).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::Hybrid);
        assert_eq!(result.chunks[0].symbol_name.as_deref(), Some("calculate_total"));
        assert!(result.chunks[0].semantic && result.chunks[0].lexical);
    }

    #[tokio::test]
    async fn falls_back_to_lexical_without_provider() {
        let (retriever, _) = indexed(vec![MockEmbedder::failing("remote", 32).into()]).await;
        let result = retriever.retrieve("proj", "calculate_total", 5).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::LexicalOnly);
        assert_eq!(result.chunks.len(), 1);
        assert!(result.chunks[0].lexical && !result.chunks[0].semantic);
    }

    #[tokio::test]
    async fn k_limits_results() {
        let (retriever, _) = indexed(vec![MockEmbedder::new("local", 32).into()]).await;
        let result = retriever.retrieve("proj", "calculate_total render_page", 1).await.unwrap();
        assert_eq!(result.chunks.len(), 1);
    }
}
