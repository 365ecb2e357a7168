//! Project indexing orchestrator: discover → fingerprint → chunk → embed → store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use quarry_memory::{
    FileMetadata, IndexStore, ProjectIdentifier, ProjectInfo, ProjectStats, file_id,
    normalize_rel_path,
};
use serde::Serialize;

use crate::chunker::CodeChunker;
use crate::error::{IndexError, Result};
use crate::filter::IgnoreRules;
use crate::languages::detect_language;
use crate::lexical::{LexicalHit, LexicalSearchIndex, LexicalStats};
use crate::pipeline::{EmbeddingPipeline, GenerateOptions, PreparedFile};
use crate::session::{IndexingSession, SessionStatus};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Extra gitignore-syntax patterns on top of the built-in denylist.
    pub ignore_patterns: Vec<String>,
    /// Larger files are left out of discovery.
    pub max_file_bytes: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            max_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    /// Re-embed files whose fingerprint is unchanged.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectStatus {
    pub store: ProjectStats,
    pub lexical: LexicalStats,
}

#[derive(Debug)]
struct DiscoveredFile {
    path: PathBuf,
    rel: String,
    size: u64,
    modified: Option<SystemTime>,
}

/// Serializes indexing work per project and drives chunking, embedding and
/// persistence.
///
/// Built once by the host and shared by reference; operations for the same
/// project queue behind each other, different projects run independently.
pub struct ProjectIndexCoordinator {
    identifier: Arc<dyn ProjectIdentifier>,
    store: Arc<dyn IndexStore>,
    pipeline: Arc<EmbeddingPipeline>,
    lexical: Arc<LexicalSearchIndex>,
    chunker: CodeChunker,
    config: CoordinatorConfig,
    queues: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectIndexCoordinator {
    #[must_use]
    pub fn new(
        identifier: Arc<dyn ProjectIdentifier>,
        store: Arc<dyn IndexStore>,
        pipeline: Arc<EmbeddingPipeline>,
        lexical: Arc<LexicalSearchIndex>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            identifier,
            store,
            pipeline,
            lexical,
            chunker: CodeChunker::new(),
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn lexical(&self) -> &Arc<LexicalSearchIndex> {
        &self.lexical
    }

    /// # Errors
    ///
    /// Returns [`IndexError::ProjectIdentity`] if `path` cannot be resolved.
    pub async fn identify(&self, path: &Path) -> Result<ProjectInfo> {
        self.identifier
            .identify(path)
            .await
            .map_err(|e| IndexError::ProjectIdentity(e.to_string()))
    }

    /// Ignore rules for a workspace root.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured pattern is invalid.
    pub fn ignore_rules(&self, root: &Path) -> Result<IgnoreRules> {
        IgnoreRules::new(root, &self.config.ignore_patterns)
    }

    fn queue(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(project_id.to_owned()).or_default())
    }

    /// Full or incremental run over the project containing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::SessionFailed`] when the project cannot be
    /// identified, its files cannot be enumerated or the store cannot be
    /// prepared. Per-file problems are recorded in the session instead.
    pub async fn index_project(&self, path: &Path, options: IndexOptions) -> Result<IndexingSession> {
        let mut session = IndexingSession::new(String::new());

        let project = match self.identify(path).await {
            Ok(project) => project,
            Err(e) => return Err(fail(session, e)),
        };
        session.project_id.clone_from(&project.id);

        let queue = self.queue(&project.id);
        let _turn = queue.lock().await;
        tracing::info!(
            project = %project.id,
            root = %project.workspace_root.display(),
            force = options.force,
            "indexing started"
        );

        session.transition(SessionStatus::Scanning);
        let files = match self.discover(&project.workspace_root).await {
            Ok(files) => files,
            Err(e) => return Err(fail(session, e)),
        };
        session.files_found = files.len();

        match self.pipeline.ensure_model_compatibility(&project.id).await {
            Ok(migrated) => session.migrated = migrated,
            Err(e) => return Err(fail(session, e)),
        }

        session.transition(SessionStatus::Processing);
        let mut prepared = Vec::new();
        for file in &files {
            match self.prepare(&project.id, file, options).await {
                Ok(Some(p)) => prepared.push(p),
                Ok(None) => session.files_skipped += 1,
                Err(e) => {
                    tracing::warn!(path = %file.rel, "skipping file: {e}");
                    session.record_error(Some(&file.rel), e.to_string());
                }
            }
        }
        session.symbols_extracted += prepared_symbols(&prepared);

        self.embed(&project.id, prepared.into_iter().map(|(p, _)| p).collect(), &mut session)
            .await;

        let live: HashSet<&str> = files.iter().map(|f| f.rel.as_str()).collect();
        match self.remove_orphans(&project.id, &live).await {
            Ok(removed) => session.files_removed = removed,
            Err(e) => session.record_error(None, format!("orphan cleanup: {e}")),
        }

        session.complete();
        tracing::info!(
            project = %project.id,
            found = session.files_found,
            processed = session.files_processed,
            skipped = session.files_skipped,
            removed = session.files_removed,
            chunks = session.chunks_created,
            embeddings = session.embeddings,
            errors = session.errors().len(),
            elapsed_ms = u64::try_from(session.start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            "indexing finished"
        );
        Ok(session)
    }

    /// Re-index one file with the same queueing and skip rules as a full run.
    /// A file that no longer exists is removed from the index. When the
    /// embedding model changed since the project was indexed, the whole
    /// project is re-indexed instead.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::SessionFailed`] if the path lies outside the
    /// project or the store cannot be prepared.
    pub async fn reindex_file(
        &self,
        project: &ProjectInfo,
        file: &Path,
        options: IndexOptions,
    ) -> Result<IndexingSession> {
        let mut session = IndexingSession::new(project.id.clone());
        let queue = self.queue(&project.id);
        let turn = queue.lock().await;

        match self.pipeline.needs_migration(&project.id).await {
            Ok(true) => {
                drop(turn);
                tracing::info!(
                    project = %project.id,
                    path = %file.display(),
                    "embedding model changed, re-indexing whole project"
                );
                return self.index_project(&project.workspace_root, options).await;
            }
            Ok(false) => {}
            Err(e) => return Err(fail(session, e)),
        }

        session.transition(SessionStatus::Scanning);
        let rel = match relative_path(&project.workspace_root, file) {
            Ok(rel) => rel,
            Err(e) => return Err(fail(session, e)),
        };

        let metadata = match tokio::fs::metadata(file).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                session.complete();
                return Ok(session);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match self.forget(&project.id, &rel).await {
                    Ok(removed) => session.files_removed = usize::from(removed),
                    Err(e) => session.record_error(Some(&rel), e.to_string()),
                }
                session.complete();
                return Ok(session);
            }
            Err(e) => {
                session.record_error(Some(&rel), e.to_string());
                session.complete();
                return Ok(session);
            }
        };

        let rules = match self.ignore_rules(&project.workspace_root) {
            Ok(rules) => rules,
            Err(e) => return Err(fail(session, e)),
        };
        if !rules.accepts(file) || metadata.len() > self.config.max_file_bytes {
            session.complete();
            return Ok(session);
        }
        session.files_found = 1;

        session.transition(SessionStatus::Processing);
        let discovered = DiscoveredFile {
            path: file.to_path_buf(),
            rel,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        };
        match self.prepare(&project.id, &discovered, options).await {
            Ok(Some((prepared, symbols))) => {
                session.symbols_extracted += symbols;
                self.embed(&project.id, vec![prepared], &mut session).await;
            }
            Ok(None) => session.files_skipped += 1,
            Err(e) => session.record_error(Some(&discovered.rel), e.to_string()),
        }

        session.complete();
        Ok(session)
    }

    /// Drop a file from the store and the lexical index.
    ///
    /// # Errors
    ///
    /// Returns an error if the path lies outside the project or the store
    /// fails.
    pub async fn remove_file(&self, project: &ProjectInfo, file: &Path) -> Result<bool> {
        let rel = relative_path(&project.workspace_root, file)?;
        let queue = self.queue(&project.id);
        let _turn = queue.lock().await;
        self.forget(&project.id, &rel).await
    }

    /// Whether `file`'s content differs from the fingerprint last recorded for
    /// it. Missing files count as changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path lies outside the project or the store
    /// fails.
    pub async fn file_changed(&self, project: &ProjectInfo, file: &Path) -> Result<bool> {
        let rel = relative_path(&project.workspace_root, file)?;
        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let recorded = self.recorded_fingerprint(&project.id, &rel).await?;
        Ok(recorded.as_deref() != Some(fingerprint(&bytes).as_str()))
    }

    /// Fingerprint stored with the file's metadata, if it has been embedded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn recorded_fingerprint(&self, project_id: &str, rel_path: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_file_metadata(project_id, rel_path)
            .await?
            .map(|m| m.content_hash))
    }

    /// Keyword search over the project's in-memory lexical index.
    #[must_use]
    pub fn search(&self, project_id: &str, query: &str, k: usize) -> Vec<LexicalHit> {
        self.lexical.search(project_id, query, k)
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stats(&self, project_id: &str) -> Result<ProjectStatus> {
        Ok(ProjectStatus {
            store: self.store.get_project_stats(project_id).await?,
            lexical: self.lexical.stats(project_id),
        })
    }

    /// Refill the lexical index from persisted records, e.g. after a restart.
    /// Returns the number of records loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn warm_lexical(&self, project_id: &str) -> Result<usize> {
        let records = self.store.project_records(project_id).await?;
        self.lexical.index_records(project_id, &records);
        Ok(records.len())
    }

    async fn discover(&self, root: &Path) -> Result<Vec<DiscoveredFile>> {
        let rules = self.ignore_rules(root)?;
        let root = root.to_path_buf();
        let max_bytes = self.config.max_file_bytes;
        tokio::task::spawn_blocking(move || discover_blocking(&root, &rules, max_bytes))
            .await
            .map_err(|e| IndexError::Discovery(format!("discovery task failed: {e}")))?
    }

    /// Read, fingerprint and chunk one file. `None` means unchanged.
    ///
    /// The lexical index is refreshed even for unchanged files it does not
    /// hold yet.
    async fn prepare(
        &self,
        project_id: &str,
        file: &DiscoveredFile,
        options: IndexOptions,
    ) -> Result<Option<(PreparedFile, usize)>> {
        let lang = detect_language(&file.path)
            .ok_or_else(|| IndexError::UnsupportedLanguage(file.rel.clone()))?;
        let bytes = tokio::fs::read(&file.path).await?;
        let hash = fingerprint(&bytes);

        let unchanged = !options.force
            && self
                .store
                .get_file_metadata(project_id, &file.rel)
                .await?
                .is_some_and(|m| m.content_hash == hash);
        if unchanged && self.lexical.contains_file(project_id, &file.rel) {
            tracing::debug!(path = %file.rel, "unchanged, skipping");
            return Ok(None);
        }

        let outcome = self.chunker.parse_bytes(&bytes, lang, &file.rel);
        self.lexical
            .index_file(project_id, &file.rel, &outcome.chunks, &outcome.symbols);
        if unchanged {
            tracing::debug!(path = %file.rel, "unchanged, lexical entries restored");
            return Ok(None);
        }

        let line_count = String::from_utf8_lossy(&bytes).lines().count();
        let metadata = FileMetadata {
            id: file_id(project_id, &file.rel),
            project_id: project_id.to_owned(),
            path: file.rel.clone(),
            content_hash: hash,
            language: lang.id().to_owned(),
            size: file.size,
            line_count,
            last_modified: DateTime::<Utc>::from(file.modified.unwrap_or_else(SystemTime::now)),
        };
        let symbols = outcome.symbols.len();
        Ok(Some((
            PreparedFile {
                metadata,
                chunks: outcome.chunks,
            },
            symbols,
        )))
    }

    async fn embed(&self, project_id: &str, files: Vec<PreparedFile>, session: &mut IndexingSession) {
        if files.is_empty() {
            return;
        }
        session.transition(SessionStatus::Embedding);
        let progress = match self
            .pipeline
            .generate_for_project(project_id, files, GenerateOptions::default())
            .await
        {
            Ok(progress) => progress,
            Err(e) => {
                session.record_error(None, e.to_string());
                return;
            }
        };

        for outcome in progress.files {
            match outcome.error {
                Some(e) => session.record_error(Some(&outcome.path), e.to_string()),
                None => {
                    session.files_processed += 1;
                    session.chunks_created += outcome.chunks;
                    session.embeddings += outcome.embedded;
                }
            }
        }
    }

    async fn forget(&self, project_id: &str, rel: &str) -> Result<bool> {
        let lexical = self.lexical.remove_file(project_id, rel);
        let stored = self.store.get_file_metadata(project_id, rel).await?.is_some();
        self.store.delete_file(&file_id(project_id, rel)).await?;
        if stored || lexical {
            tracing::debug!(path = rel, "removed from index");
        }
        Ok(stored || lexical)
    }

    async fn remove_orphans(&self, project_id: &str, live: &HashSet<&str>) -> Result<usize> {
        let mut gone: HashSet<String> = self
            .store
            .list_files(project_id)
            .await?
            .into_iter()
            .map(|m| m.path)
            .filter(|p| !live.contains(p.as_str()))
            .collect();
        gone.extend(
            self.lexical
                .files(project_id)
                .into_iter()
                .filter(|p| !live.contains(p.as_str())),
        );

        let mut removed = 0;
        for rel in &gone {
            if self.forget(project_id, rel).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(project = project_id, removed, "removed deleted files from index");
        }
        Ok(removed)
    }
}

fn prepared_symbols(prepared: &[(PreparedFile, usize)]) -> usize {
    prepared.iter().map(|(_, symbols)| symbols).sum()
}

fn fail(mut session: IndexingSession, error: IndexError) -> IndexError {
    session.fail(error.to_string());
    tracing::error!(
        session = %session.id,
        project = %session.project_id,
        "indexing failed: {error}"
    );
    IndexError::SessionFailed {
        session: Box::new(session),
        source: Box::new(error),
    }
}

/// Content fingerprint used for unchanged-file detection.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn relative_path(root: &Path, file: &Path) -> Result<String> {
    let rel = file.strip_prefix(root).map_err(|_| {
        IndexError::Discovery(format!(
            "{} is outside {}",
            file.display(),
            root.display()
        ))
    })?;
    Ok(normalize_rel_path(&rel.to_string_lossy()))
}

fn discover_blocking(root: &Path, rules: &IgnoreRules, max_bytes: u64) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        return Err(IndexError::Discovery(format!(
            "{} is not a readable directory",
            root.display()
        )));
    }
    std::fs::read_dir(root).map_err(|e| IndexError::Discovery(format!("{}: {e}", root.display())))?;

    let mut files = Vec::new();
    for entry in ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .build()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("discovery: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) || !rules.accepts(entry.path()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), "discovery: {e}");
                continue;
            }
        };
        if meta.len() > max_bytes {
            tracing::debug!(path = %entry.path().display(), bytes = meta.len(), "skipping oversized file");
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push(DiscoveredFile {
            path: entry.path().to_path_buf(),
            rel: normalize_rel_path(&rel.to_string_lossy()),
            size: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    Ok(files)
}
