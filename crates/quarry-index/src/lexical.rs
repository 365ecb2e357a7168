//! In-memory keyword search over chunk and symbol text.
//!
//! Nothing here is persisted: the index is rebuilt from the store or by
//! re-indexing after a restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use quarry_memory::EmbeddingRecord;
use serde::Serialize;

use crate::chunker::{Chunk, Symbol};

pub const DEFAULT_LIMIT: usize = 12;
const MIN_TERM_LEN: usize = 3;
const PHRASE_BONUS: f32 = 1.0;
const TERM_WEIGHT: f32 = 0.3;
const NAME_TERM_BONUS: f32 = 0.5;
const NAME_EXACT_BONUS: f32 = 1.0;
const SYMBOL_BOOST: f32 = 0.2;
const MAX_LENGTH_PENALTY: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Chunk,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LexicalEntry {
    pub file_path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub symbol_kind: Option<String>,
    pub source: EntrySource,
}

#[derive(Debug, Clone, Serialize)]
pub struct LexicalHit {
    pub entry: LexicalEntry,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LexicalStats {
    pub files: usize,
    pub chunks: usize,
    pub symbols: usize,
}

#[derive(Default)]
struct ProjectEntries {
    /// Insertion order of paths, which is the tie-break order for ranking.
    order: Vec<String>,
    files: HashMap<String, Vec<LexicalEntry>>,
}

impl ProjectEntries {
    fn replace(&mut self, path: &str, entries: Vec<LexicalEntry>) {
        if self.files.insert(path.to_owned(), entries).is_none() {
            self.order.push(path.to_owned());
        }
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.files.remove(path).is_some() {
            self.order.retain(|p| p != path);
            true
        } else {
            false
        }
    }

    fn iter(&self) -> impl Iterator<Item = &LexicalEntry> {
        self.order
            .iter()
            .filter_map(|p| self.files.get(p))
            .flatten()
    }
}

/// Per-project keyword index.
#[derive(Default)]
pub struct LexicalSearchIndex {
    projects: RwLock<HashMap<String, ProjectEntries>>,
}

impl std::fmt::Debug for LexicalSearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalSearchIndex").finish_non_exhaustive()
    }
}

impl LexicalSearchIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything indexed for `path` with its chunks and symbols.
    pub fn index_file(&self, project_id: &str, path: &str, chunks: &[Chunk], symbols: &[Symbol]) {
        let mut entries: Vec<LexicalEntry> = chunks
            .iter()
            .filter(|c| !c.content.is_empty())
            .map(|c| LexicalEntry {
                file_path: path.to_owned(),
                content: c.content.clone(),
                start_line: c.start_line,
                end_line: c.end_line,
                symbol_name: c.symbol_name.clone(),
                symbol_kind: c.symbol_type.clone(),
                source: EntrySource::Chunk,
            })
            .collect();
        entries.extend(symbols.iter().map(|s| LexicalEntry {
            file_path: path.to_owned(),
            content: s.source.clone(),
            start_line: s.start_line,
            end_line: s.end_line,
            symbol_name: Some(s.name.clone()),
            symbol_kind: Some(s.kind.clone()),
            source: EntrySource::Symbol,
        }));

        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        projects
            .entry(project_id.to_owned())
            .or_default()
            .replace(path, entries);
    }

    /// Rebuild chunk entries from persisted records, one file at a time.
    /// Symbols are not persisted, so only chunk entries come back.
    pub fn index_records(&self, project_id: &str, records: &[EmbeddingRecord]) {
        let mut by_file: Vec<(String, Vec<LexicalEntry>)> = Vec::new();
        for rec in records {
            let entry = LexicalEntry {
                file_path: rec.file_path.clone(),
                content: rec.content.clone(),
                start_line: rec.start_line,
                end_line: rec.end_line,
                symbol_name: rec.symbol_name.clone(),
                symbol_kind: rec.symbol_type.clone(),
                source: EntrySource::Chunk,
            };
            match by_file.iter_mut().find(|(p, _)| *p == rec.file_path) {
                Some((_, entries)) => entries.push(entry),
                None => by_file.push((rec.file_path.clone(), vec![entry])),
            }
        }

        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        let project = projects.entry(project_id.to_owned()).or_default();
        for (path, entries) in by_file {
            project.replace(&path, entries);
        }
    }

    /// Returns whether anything was removed.
    pub fn remove_file(&self, project_id: &str, path: &str) -> bool {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        projects
            .get_mut(project_id)
            .is_some_and(|p| p.remove(path))
    }

    pub fn clear_project(&self, project_id: &str) {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        projects.remove(project_id);
    }

    #[must_use]
    pub fn contains_file(&self, project_id: &str, path: &str) -> bool {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        projects
            .get(project_id)
            .is_some_and(|p| p.files.contains_key(path))
    }

    /// Paths indexed for the project, in insertion order.
    #[must_use]
    pub fn files(&self, project_id: &str) -> Vec<String> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        projects
            .get(project_id)
            .map(|p| p.order.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self, project_id: &str) -> LexicalStats {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        let Some(project) = projects.get(project_id) else {
            return LexicalStats::default();
        };
        let mut stats = LexicalStats {
            files: project.files.len(),
            ..LexicalStats::default()
        };
        for entry in project.iter() {
            match entry.source {
                EntrySource::Chunk => stats.chunks += 1,
                EntrySource::Symbol => stats.symbols += 1,
            }
        }
        stats
    }

    /// Rank entries of `project_id` against `query`, best first, at most `k`.
    #[must_use]
    pub fn search(&self, project_id: &str, query: &str, k: usize) -> Vec<LexicalHit> {
        let phrase = query.trim().to_lowercase();
        let terms: Vec<&str> = phrase
            .split_whitespace()
            .filter(|t| t.chars().count() >= MIN_TERM_LEN)
            .collect();
        if terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        let Some(project) = projects.get(project_id) else {
            return Vec::new();
        };

        let mut hits: Vec<LexicalHit> = project
            .iter()
            .filter_map(|entry| {
                score_entry(entry, &phrase, &terms).map(|score| LexicalHit {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();

        // Stable sort keeps discovery order for equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }
}

/// `None` when nothing in the entry matched.
#[allow(clippy::cast_precision_loss)]
fn score_entry(entry: &LexicalEntry, phrase: &str, terms: &[&str]) -> Option<f32> {
    let content = entry.content.to_lowercase();
    let mut score = 0.0f32;

    if content.contains(phrase) {
        score += PHRASE_BONUS;
    }
    for term in terms {
        score += TERM_WEIGHT * content.matches(term).count() as f32;
    }
    if let Some(name) = &entry.symbol_name {
        let name = name.to_lowercase();
        for term in terms {
            if name.contains(term) {
                score += NAME_TERM_BONUS;
            }
            if name == *term {
                score += NAME_EXACT_BONUS;
            }
        }
    }
    if score <= 0.0 {
        return None;
    }

    let penalty = (entry.content.chars().count() as f32 / 1000.0).min(MAX_LENGTH_PENALTY);
    score = (score - penalty).max(0.0);
    if entry.source == EntrySource::Symbol {
        score += SYMBOL_BOOST;
    }
    Some(score)
}
