use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, Debouncer, new_debouncer};
use quarry_memory::ProjectInfo;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{IndexOptions, ProjectIndexCoordinator};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period after the last event for a file before it is re-indexed.
    pub debounce: Duration,
    /// Interval of the incremental safety-net run over the whole project.
    pub sweep_interval: Duration,
    /// Window in which raw filesystem events are coalesced.
    pub coalesce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(300),
            coalesce: Duration::from_secs(1),
        }
    }
}

struct ActiveWatch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

/// Keeps watched projects in sync with the filesystem.
///
/// Raw events are filtered by the project's ignore rules, then each file gets
/// its own debounce timer that restarts on every event. Only when a timer runs
/// out, and the file's fingerprint actually changed, is the file re-indexed.
pub struct ChangeWatcher {
    coordinator: Arc<ProjectIndexCoordinator>,
    config: WatchConfig,
    watches: tokio::sync::Mutex<HashMap<PathBuf, ActiveWatch>>,
}

impl ChangeWatcher {
    #[must_use]
    pub fn new(coordinator: Arc<ProjectIndexCoordinator>, config: WatchConfig) -> Self {
        Self {
            coordinator,
            config,
            watches: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Start watching the project containing `project_path`. Watching an
    /// already watched project is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be identified or the
    /// filesystem watcher cannot be initialized.
    pub async fn watch(&self, project_path: &Path) -> Result<ProjectInfo> {
        let project = self.coordinator.identify(project_path).await?;
        let root = project.workspace_root.clone();

        let mut watches = self.watches.lock().await;
        if watches.contains_key(&root) {
            return Ok(project);
        }

        let rules = self.coordinator.ignore_rules(&root)?;
        let (event_tx, event_rx) = mpsc::channel::<PathBuf>(256);

        let mut debouncer = new_debouncer(
            self.config.coalesce,
            move |events: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let paths: HashSet<PathBuf> = events
                    .into_iter()
                    .filter(|e| {
                        matches!(
                            e.kind,
                            DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                        )
                    })
                    .filter(|e| rules.accepts(&e.path))
                    .map(|e| e.path)
                    .collect();

                for path in paths {
                    match event_tx.try_send(path) {
                        Ok(()) | Err(TrySendError::Closed(_)) => {}
                        Err(TrySendError::Full(path)) => tracing::warn!(
                            path = %path.display(),
                            "watch queue full, leaving change to the next sweep"
                        ),
                    }
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let task = spawn_watch_loop(
            Arc::clone(&self.coordinator),
            project.clone(),
            event_rx,
            cancel.clone(),
            self.config.clone(),
        );
        watches.insert(
            root.clone(),
            ActiveWatch {
                cancel,
                task,
                _debouncer: debouncer,
            },
        );
        tracing::info!(project = %project.id, root = %root.display(), "watching project");
        Ok(project)
    }

    /// Stop watching. Pending debounce timers and the sweep are cancelled; a
    /// re-index already running is allowed to finish first.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be identified.
    pub async fn unwatch(&self, project_path: &Path) -> Result<bool> {
        let project = self.coordinator.identify(project_path).await?;
        let Some(active) = self.watches.lock().await.remove(&project.workspace_root) else {
            return Ok(false);
        };
        stop(active).await;
        tracing::info!(project = %project.id, "stopped watching project");
        Ok(true)
    }

    /// Workspace roots currently watched.
    pub async fn watched(&self) -> Vec<PathBuf> {
        self.watches.lock().await.keys().cloned().collect()
    }

    /// Stop every watch.
    pub async fn shutdown(&self) {
        let active: Vec<_> = self.watches.lock().await.drain().map(|(_, a)| a).collect();
        for watch in active {
            stop(watch).await;
        }
    }
}

async fn stop(active: ActiveWatch) {
    active.cancel.cancel();
    if let Err(e) = active.task.await
        && !e.is_cancelled()
    {
        tracing::warn!("watch task ended abnormally: {e}");
    }
}

/// Run the debounce and sweep loop for one project until `cancel` fires.
///
/// Re-index and sweep runs are spawned so the loop keeps draining events
/// while they wait on the project queue or on providers.
pub(crate) fn spawn_watch_loop(
    coordinator: Arc<ProjectIndexCoordinator>,
    project: ProjectInfo,
    mut events: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
    config: WatchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<(PathBuf, u64)>();
        let mut timers: HashMap<PathBuf, (u64, JoinHandle<()>)> = HashMap::new();
        let mut generation = 0u64;
        let mut work = JoinSet::new();
        let mut sweep_task: Option<JoinHandle<()>> = None;

        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + config.sweep_interval,
            config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(path) = event else { break };
                    generation += 1;
                    let fire = fire_tx.clone();
                    let key = path.clone();
                    let delay = config.debounce;
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = fire.send((key, generation));
                    });
                    if let Some((_, previous)) = timers.insert(path, (generation, timer)) {
                        previous.abort();
                    }
                }
                Some((path, fired)) = fire_rx.recv() => {
                    // A newer event may have replaced the timer that fired.
                    if timers.get(&path).is_some_and(|(current, _)| *current == fired) {
                        timers.remove(&path);
                        let coordinator = Arc::clone(&coordinator);
                        let project = project.clone();
                        work.spawn(async move { process_change(&coordinator, &project, &path).await });
                    }
                }
                Some(joined) = work.join_next(), if !work.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(project = %project.id, "re-index task ended abnormally: {e}");
                    }
                }
                _ = sweep.tick() => {
                    if sweep_task.as_ref().is_some_and(|t| !t.is_finished()) {
                        tracing::debug!(project = %project.id, "previous sweep still running, skipping tick");
                    } else {
                        sweep_task = Some(tokio::spawn(run_sweep(
                            Arc::clone(&coordinator),
                            project.clone(),
                        )));
                    }
                }
            }
        }

        for (_, (_, timer)) in timers.drain() {
            timer.abort();
        }
        if let Some(task) = sweep_task
            && let Err(e) = task.await
        {
            tracing::warn!(project = %project.id, "sweep task ended abnormally: {e}");
        }
        while work.join_next().await.is_some() {}
    })
}

async fn run_sweep(coordinator: Arc<ProjectIndexCoordinator>, project: ProjectInfo) {
    tracing::debug!(project = %project.id, "periodic sweep");
    match coordinator
        .index_project(&project.workspace_root, IndexOptions::default())
        .await
    {
        Ok(session) if !session.errors().is_empty() => tracing::warn!(
            project = %project.id,
            errors = session.errors().len(),
            "sweep finished with errors"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(project = %project.id, "sweep failed: {e}"),
    }
}

async fn process_change(coordinator: &ProjectIndexCoordinator, project: &ProjectInfo, path: &Path) {
    if !path.exists() {
        if let Err(e) = coordinator.remove_file(project, path).await {
            tracing::warn!(path = %path.display(), "removing file from index failed: {e}");
        }
        return;
    }

    match coordinator.file_changed(project, path).await {
        Ok(false) => {
            tracing::debug!(path = %path.display(), "fingerprint unchanged, ignoring event");
            return;
        }
        Ok(true) => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), "fingerprint check failed: {e}");
            return;
        }
    }

    match coordinator
        .reindex_file(project, path, IndexOptions::default())
        .await
    {
        Ok(session) => {
            for error in session.errors() {
                tracing::warn!(path = %path.display(), "reindex error: {error}");
            }
        }
        Err(e) => tracing::warn!(path = %path.display(), "reindex failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use quarry_llm::mock::{MockEmbedder, MockOutcome};
    use quarry_memory::{IndexStore, InMemoryIndexStore, WorkspaceIdentifier};

    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::health::ProviderHealthRegistry;
    use crate::lexical::LexicalSearchIndex;
    use crate::pipeline::{EmbeddingPipeline, PipelineConfig};

    fn coordinator(mock: &MockEmbedder) -> (Arc<ProjectIndexCoordinator>, Arc<InMemoryIndexStore>) {
        let store = Arc::new(InMemoryIndexStore::new());
        let pipeline = EmbeddingPipeline::new(
            vec![mock.clone().into()],
            store.clone(),
            Arc::new(ProviderHealthRegistry::default()),
            PipelineConfig::default(),
        );
        let coordinator = ProjectIndexCoordinator::new(
            Arc::new(WorkspaceIdentifier),
            store.clone(),
            Arc::new(pipeline),
            Arc::new(LexicalSearchIndex::new()),
            CoordinatorConfig::default(),
        );
        (Arc::new(coordinator), store)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn watch_nonexistent_directory_fails() {
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, _) = coordinator(&mock);
        let watcher = ChangeWatcher::new(coordinator, WatchConfig::default());
        assert!(watcher.watch(Path::new("/nonexistent/path/xyz")).await.is_err());
    }

    #[tokio::test]
    async fn watch_and_unwatch() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, _) = coordinator(&mock);
        let watcher = ChangeWatcher::new(coordinator, WatchConfig::default());

        let project = watcher.watch(dir.path()).await.unwrap();
        assert_eq!(watcher.watched().await, vec![project.workspace_root.clone()]);
        watcher.watch(dir.path()).await.unwrap();
        assert_eq!(watcher.watched().await.len(), 1);

        assert!(watcher.unwatch(dir.path()).await.unwrap());
        assert!(!watcher.unwatch(dir.path()).await.unwrap());
        assert!(watcher.watched().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_triggers_one_reindex_after_last_event() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, store) = coordinator(&mock);
        let project = coordinator.identify(dir.path()).await.unwrap();
        let file = project.workspace_root.join("lib.rs");
        std::fs::write(&file, "fn edited() {}\n").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let config = WatchConfig {
            sweep_interval: Duration::from_secs(100_000),
            ..WatchConfig::default()
        };
        let task = spawn_watch_loop(coordinator, project.clone(), rx, cancel.clone(), config);

        tx.send(file.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(file.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(mock.calls(), 0, "timer restarts on every event");

        tokio::time::sleep(Duration::from_secs(40)).await;
        wait_for(|| mock.calls() > 0).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(store.get_project_stats(&project.id).await.unwrap().total_files, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_timers() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, _) = coordinator(&mock);
        let project = coordinator.identify(dir.path()).await.unwrap();
        let file = project.workspace_root.join("lib.rs");
        std::fs::write(&file, "fn pending() {}\n").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = spawn_watch_loop(coordinator, project, rx, cancel.clone(), WatchConfig::default());

        tx.send(file).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_fingerprint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, _) = coordinator(&mock);
        let project = coordinator.identify(dir.path()).await.unwrap();
        let file = project.workspace_root.join("lib.rs");
        std::fs::write(&file, "fn same() {}\n").unwrap();
        coordinator
            .reindex_file(&project, &file, IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(mock.calls(), 1);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = spawn_watch_loop(coordinator, project, rx, cancel.clone(), WatchConfig::default());

        // A touch without a content change.
        tx.send(file).await.unwrap();
        tokio::time::sleep(Duration::from_secs(210)).await;
        assert_eq!(mock.calls(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_picks_up_files_without_events() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEmbedder::new("local", 8);
        let (coordinator, store) = coordinator(&mock);
        let project = coordinator.identify(dir.path()).await.unwrap();
        std::fs::write(project.workspace_root.join("lib.rs"), "fn missed() {}\n").unwrap();

        let (_tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let config = WatchConfig {
            sweep_interval: Duration::from_secs(300),
            ..WatchConfig::default()
        };
        let task = spawn_watch_loop(coordinator, project.clone(), rx, cancel.clone(), config);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(mock.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        wait_for(|| mock.calls() > 0).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(store.get_project_stats(&project.id).await.unwrap().total_files, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_drained_while_sweep_runs() {
        let dir = tempfile::tempdir().unwrap();
        let backoff = MockOutcome::RateLimited(Some(Duration::from_secs(30)));
        let mock = MockEmbedder::new("local", 8).with_script([backoff.clone(), backoff]);
        let (coordinator, store) = coordinator(&mock);
        let project = coordinator.identify(dir.path()).await.unwrap();
        let file = project.workspace_root.join("lib.rs");
        std::fs::write(&file, "fn slow() {}\n").unwrap();

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let config = WatchConfig {
            sweep_interval: Duration::from_secs(5),
            ..WatchConfig::default()
        };
        let task = spawn_watch_loop(coordinator, project.clone(), rx, cancel.clone(), config);

        // The sweep is now backing off on the rate-limited provider.
        wait_for(|| mock.calls() > 0).await;
        assert_eq!(mock.calls(), 1);
        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(1), tx.send(file.clone()))
                .await
                .expect("watch loop stopped draining events")
                .unwrap();
        }

        // Cancelling lets the running sweep finish.
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(mock.calls(), 3);
        assert_eq!(store.get_project_stats(&project.id).await.unwrap().total_files, 1);
    }
}
