use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quarry_index::lexical::EntrySource;
use quarry_index::{
    CoordinatorConfig, EmbeddingPipeline, IndexError, IndexOptions, LexicalSearchIndex,
    PipelineConfig, ProjectIndexCoordinator, ProviderHealthRegistry, SessionStatus,
};
use quarry_llm::mock::{MockEmbedder, MockOutcome};
use quarry_memory::{IndexStore, InMemoryIndexStore, WorkspaceIdentifier};

const RUST_SOURCE: &str = r#"use std::collections::HashMap;

/// Totals per customer.
pub fn totals(orders: &[(String, u32)]) -> HashMap<String, u32> {
    let mut out = HashMap::new();
    for (customer, amount) in orders {
        *out.entry(customer.clone()).or_insert(0) += amount;
    }
    out
}

pub struct Ledger {
    entries: Vec<u32>,
}

impl Ledger {
    pub fn push(&mut self, amount: u32) {
        self.entries.push(amount);
    }

    pub fn sum(&self) -> u32 {
        self.entries.iter().sum()
    }
}
"#;

const JS_SOURCE: &str = r"function calculateTotal(items) {
  let total = 0;
  for (const item of items) {
    total += item.price * item.quantity;
  }
  return total;
}
";

const PY_SOURCE: &str = r#"def greet(name):
    """Say hello."""
    message = "hello " + name
    print(message)
    return message
"#;

struct Harness {
    coordinator: Arc<ProjectIndexCoordinator>,
    store: Arc<InMemoryIndexStore>,
}

fn harness_with_store(mock: &MockEmbedder, store: Arc<InMemoryIndexStore>) -> Harness {
    let pipeline = EmbeddingPipeline::new(
        vec![mock.clone().into()],
        store.clone(),
        Arc::new(ProviderHealthRegistry::default()),
        PipelineConfig {
            fallback_cooldown: Duration::ZERO,
            ..PipelineConfig::default()
        },
    );
    let coordinator = ProjectIndexCoordinator::new(
        Arc::new(WorkspaceIdentifier),
        store.clone(),
        Arc::new(pipeline),
        Arc::new(LexicalSearchIndex::new()),
        CoordinatorConfig::default(),
    );
    Harness {
        coordinator: Arc::new(coordinator),
        store,
    }
}

fn harness(mock: &MockEmbedder) -> Harness {
    harness_with_store(mock, Arc::new(InMemoryIndexStore::new()))
}

fn write_tree(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join("web")).unwrap();
    std::fs::create_dir_all(root.join("node_modules/dep")).unwrap();
    std::fs::write(root.join("src/lib.rs"), RUST_SOURCE).unwrap();
    std::fs::write(root.join("web/cart.js"), JS_SOURCE).unwrap();
    std::fs::write(root.join("greet.py"), PY_SOURCE).unwrap();
    std::fs::write(root.join("node_modules/dep/index.js"), JS_SOURCE).unwrap();
    std::fs::write(root.join("logo.png"), [0u8, 159, 146, 150]).unwrap();
}

#[tokio::test]
async fn full_run_embeds_every_chunk() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let session = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(session.errors().is_empty(), "{:?}", session.errors());
    assert_eq!(session.files_found, 3);
    assert_eq!(session.files_processed, 3);
    assert!(session.chunks_created >= 3);
    assert!(session.symbols_extracted >= 4);
    assert_eq!(session.embeddings, session.chunks_created);

    let stats = h.store.get_project_stats(&session.project_id).await.unwrap();
    assert_eq!(stats.total_files, 3);
    assert_eq!(stats.total_chunks, session.embeddings);
    assert!(stats.last_updated.is_some());
}

#[tokio::test]
async fn unchanged_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let first = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    let calls = mock.calls();

    let second = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(second.embeddings, 0);
    assert_eq!(second.files_processed, 0);
    assert_eq!(second.files_skipped, first.files_found);
    assert_eq!(mock.calls(), calls);
}

#[tokio::test]
async fn force_reembeds_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let first = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    let forced = h
        .coordinator
        .index_project(dir.path(), IndexOptions { force: true })
        .await
        .unwrap();

    assert_eq!(forced.embeddings, first.embeddings);
    let stats = h.store.get_project_stats(&first.project_id).await.unwrap();
    assert_eq!(stats.total_chunks, first.embeddings);
}

#[tokio::test]
async fn edited_file_replaces_its_chunks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.py"), "total_value_accumulator = 1\n".repeat(120)).unwrap();
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let first = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    let id = first.project_id.clone();
    assert_eq!(h.store.get_project_stats(&id).await.unwrap().total_chunks, 3);

    std::fs::write(dir.path().join("big.py"), "total_value_accumulator = 1\n".repeat(30)).unwrap();
    let second = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(second.files_processed, 1);
    assert_eq!(h.store.get_project_stats(&id).await.unwrap().total_chunks, 1);
}

#[tokio::test]
async fn deleted_files_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let first = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    assert!(!h.coordinator.search(&first.project_id, "calculateTotal", 12).is_empty());

    std::fs::remove_file(dir.path().join("web/cart.js")).unwrap();
    let second = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(second.files_removed, 1);
    let stats = h.store.get_project_stats(&first.project_id).await.unwrap();
    assert_eq!(stats.total_files, 2);
    assert!(h.coordinator.search(&first.project_id, "calculateTotal", 12).is_empty());
}

#[tokio::test]
async fn file_failure_degrades_but_completes() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32).with_script([MockOutcome::Permanent]);
    let h = harness(&mock);

    let session = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(session.is_degraded());
    assert_eq!(session.errors().len(), 1);
    assert_eq!(session.files_processed, 2);

    // The failed file has no fingerprint yet, so the next run retries it.
    let retry = h
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(retry.files_processed, 1);
    assert!(retry.errors().is_empty());
}

#[tokio::test]
async fn unknown_project_fails_session() {
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let err = h
        .coordinator
        .index_project(Path::new("/nonexistent/quarry/project"), IndexOptions::default())
        .await
        .unwrap_err();

    match err {
        IndexError::SessionFailed { session, source } => {
            assert_eq!(session.status(), SessionStatus::Failed);
            assert!(matches!(*source, IndexError::ProjectIdentity(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn model_change_migrates_project() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let store = Arc::new(InMemoryIndexStore::new());

    let old = harness_with_store(&MockEmbedder::new("old", 16), store.clone());
    let first = old
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    let new_mock = MockEmbedder::new("new", 24);
    let new = harness_with_store(&new_mock, store.clone());
    let second = new
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert!(second.migrated);
    assert_eq!(second.files_processed, first.files_found);
    let records = store.project_records(&first.project_id).await.unwrap();
    assert_eq!(records.len(), second.embeddings);
    assert!(records.iter().all(|r| r.provider == "new:mock-embed" && r.dimensions == 24));
}

#[tokio::test]
async fn model_change_on_single_file_reindexes_whole_project() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let store = Arc::new(InMemoryIndexStore::new());

    let old = harness_with_store(&MockEmbedder::new("old", 16), store.clone());
    let first = old
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(
        store.get_project_stats(&first.project_id).await.unwrap().total_files,
        3
    );

    let new = harness_with_store(&MockEmbedder::new("new", 24), store.clone());
    let project = new.coordinator.identify(dir.path()).await.unwrap();
    let file = project.workspace_root.join("greet.py");
    std::fs::write(&file, "def greet(name):\n    return name\n").unwrap();

    let session = new
        .coordinator
        .reindex_file(&project, &file, IndexOptions::default())
        .await
        .unwrap();

    assert!(session.migrated);
    assert_eq!(session.files_found, 3);
    assert_eq!(session.files_processed, 3);
    let stats = store.get_project_stats(&project.id).await.unwrap();
    assert_eq!(stats.total_files, 3);
    let records = store.project_records(&project.id).await.unwrap();
    assert_eq!(records.len(), session.embeddings);
    assert!(records.iter().all(|r| r.provider == "new:mock-embed" && r.dimensions == 24));
}

#[tokio::test]
async fn runs_for_one_project_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);

    let (a, b) = tokio::join!(
        h.coordinator.index_project(dir.path(), IndexOptions::default()),
        h.coordinator.index_project(dir.path(), IndexOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.files_skipped + b.files_skipped, a.files_found);
    let stats = h.store.get_project_stats(&a.project_id).await.unwrap();
    assert_eq!(stats.total_chunks, a.embeddings + b.embeddings);
}

#[tokio::test]
async fn lexical_index_is_restored_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let store = Arc::new(InMemoryIndexStore::new());
    let mock = MockEmbedder::new("local", 32);

    let first = harness_with_store(&mock, store.clone())
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();
    let calls = mock.calls();

    let restarted = harness_with_store(&mock, store);
    let session = restarted
        .coordinator
        .index_project(dir.path(), IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(session.files_skipped, first.files_found);
    assert_eq!(mock.calls(), calls);

    let hits = restarted
        .coordinator
        .search(&first.project_id, "calculateTotal", 12);
    assert!(hits.len() >= 2);
    let symbol = hits
        .iter()
        .find(|h| h.entry.source == EntrySource::Symbol)
        .unwrap();
    let chunk = hits
        .iter()
        .find(|h| h.entry.source == EntrySource::Chunk)
        .unwrap();
    assert!(symbol.score > chunk.score);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn reindex_file_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());
    let mock = MockEmbedder::new("local", 32);
    let h = harness(&mock);
    let project = h.coordinator.identify(dir.path()).await.unwrap();
    let file = project.workspace_root.join("greet.py");

    let session = h
        .coordinator
        .reindex_file(&project, &file, IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(session.files_processed, 1);
    assert!(!h.coordinator.file_changed(&project, &file).await.unwrap());

    std::fs::write(&file, "def greet(name):\n    return name\n").unwrap();
    assert!(h.coordinator.file_changed(&project, &file).await.unwrap());

    std::fs::remove_file(&file).unwrap();
    let session = h
        .coordinator
        .reindex_file(&project, &file, IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(session.files_removed, 1);
    assert_eq!(
        h.store.get_project_stats(&project.id).await.unwrap().total_files,
        0
    );
}
