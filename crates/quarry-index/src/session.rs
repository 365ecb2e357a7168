//! Progress and result record for one indexing run.

use std::time::Instant;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Scanning,
    Processing,
    Embedding,
    Uploading,
    Completed,
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Scanning => "scanning",
            Self::Processing => "processing",
            Self::Embedding => "embedding",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded against a session without failing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub path: Option<String>,
    pub message: String,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexingSession {
    pub id: Uuid,
    pub project_id: String,
    pub start_time: Instant,
    pub files_found: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub chunks_created: usize,
    pub symbols_extracted: usize,
    pub embeddings: usize,
    /// Set when a model or dimension change forced a full re-embed.
    pub migrated: bool,
    status: SessionStatus,
    errors: Vec<SessionError>,
}

impl IndexingSession {
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            start_time: Instant::now(),
            files_found: 0,
            files_processed: 0,
            files_skipped: 0,
            files_removed: 0,
            chunks_created: 0,
            symbols_extracted: 0,
            embeddings: 0,
            migrated: false,
            status: SessionStatus::Starting,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn errors(&self) -> &[SessionError] {
        &self.errors
    }

    /// Move to `status`. Ignored once the session is completed or failed.
    pub fn transition(&mut self, status: SessionStatus) {
        if self.status.is_terminal() {
            tracing::debug!(
                session = %self.id,
                from = %self.status,
                to = %status,
                "ignoring transition of finished session"
            );
            return;
        }
        tracing::debug!(session = %self.id, from = %self.status, to = %status, "session transition");
        self.status = status;
    }

    pub fn record_error(&mut self, path: Option<&str>, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.errors.push(SessionError {
            path: path.map(str::to_owned),
            message: message.into(),
        });
    }

    pub fn complete(&mut self) {
        self.transition(SessionStatus::Completed);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.errors.push(SessionError {
            path: None,
            message: message.into(),
        });
        self.status = SessionStatus::Failed;
    }

    /// Completed with at least one recorded error.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.status == SessionStatus::Completed && !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting() {
        let session = IndexingSession::new("p");
        assert_eq!(session.status(), SessionStatus::Starting);
        assert!(session.errors().is_empty());
    }

    #[test]
    fn finished_session_is_immutable() {
        let mut session = IndexingSession::new("p");
        session.transition(SessionStatus::Scanning);
        session.complete();
        session.transition(SessionStatus::Processing);
        session.record_error(Some("a.rs"), "late");
        session.fail("late");
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.errors().is_empty());
    }

    #[test]
    fn failed_from_any_state() {
        let mut session = IndexingSession::new("p");
        session.transition(SessionStatus::Embedding);
        session.fail("discovery failed");
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.errors().len(), 1);
        session.complete();
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[test]
    fn file_errors_leave_session_completable() {
        let mut session = IndexingSession::new("p");
        session.transition(SessionStatus::Processing);
        session.record_error(Some("src/a.rs"), "unreadable");
        session.complete();
        assert!(session.is_degraded());
        assert_eq!(session.errors()[0].to_string(), "src/a.rs: unreadable");
    }
}
