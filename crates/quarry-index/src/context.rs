//! Contextualized embedding text generation.
//!
//! Embedding raw code alone gives poor retrieval quality. Prepending the file
//! path, enclosing symbol and language tag helps conceptual queries like
//! "where is auth handled?" land on the right chunk. Only the embedded text
//! carries the header; stored chunk content stays raw.

use crate::chunker::Chunk;

/// Generate text optimized for embedding (not for display).
#[must_use]
pub fn contextualize_for_embedding(path: &str, language: &str, chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.content.len() + 128);

    text.push_str("# ");
    text.push_str(path);
    text.push('\n');

    if let Some(name) = &chunk.symbol_name {
        text.push_str("# Symbol: ");
        text.push_str(name);
        if let Some(kind) = &chunk.symbol_type {
            text.push_str(" (");
            text.push_str(kind);
            text.push(')');
        }
        text.push('\n');
    }

    text.push_str("# Language: ");
    text.push_str(language);
    text.push('\n');

    text.push_str(&chunk.content);
    text
}

/// Short header for display in retrieved results.
#[must_use]
pub fn chunk_display_header(
    path: &str,
    symbol_name: Option<&str>,
    start_line: usize,
    end_line: usize,
) -> String {
    match symbol_name {
        Some(name) => format!("{path} :: {name} (lines {start_line}-{end_line})"),
        None => format!("{path} (lines {start_line}-{end_line})"),
    }
}
