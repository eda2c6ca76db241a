//! Session Manager
//!
//! Owns every generation session for its whole lifetime. A session moves through
//! `Pending → Running → {Complete, Failed}` (or `Pending → Failed`) and never back.
//! Progress events are appended under the session's write lock and pushed to
//! subscribers in the same critical section, which keeps per-session delivery FIFO.

use crate::artifact::{ArtifactIndex, ArtifactSet, ArtifactStore};
use crate::document::missing_documents;
use crate::error::{ErrorKind, Result, WorkflowError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Complete => write!(f, "complete"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_grade_level() -> String {
    "Grade 9".to_string()
}

/// A user's request for an experiment guide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub description: String,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default = "default_grade_level")]
    pub grade_level: String,
    /// Chat model override; the service default is used when absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Number of illustrations to generate after the documents are written.
    #[serde(default)]
    pub image_count: u32,
}

impl GenerationRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            student_name: None,
            grade_level: default_grade_level(),
            model: None,
            image_count: 0,
        }
    }
}

/// Named phases a generation run reports progress under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Research,
    Draft,
    Critique,
    Finalize,
    Images,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Queued => "queued",
            Stage::Research => "research",
            Stage::Draft => "draft",
            Stage::Critique => "critique",
            Stage::Finalize => "finalize",
            Stage::Images => "images",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Position in the session's event log, starting at 0.
    pub seq: u64,
    pub stage: Stage,
    pub message: String,
    /// Set when the event announces a written document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

/// What a subscriber receives. The channel closes right after a terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(ProgressEvent),
    Completed {
        session_id: SessionId,
        artifacts: ArtifactIndex,
    },
    Failed {
        session_id: SessionId,
        error: ErrorRecord,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Progress(_))
    }
}

/// A point-in-time copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: GenerationRequest,
    pub events: Vec<ProgressEvent>,
    /// Empty until the session is complete.
    pub artifacts: ArtifactIndex,
    pub error: Option<ErrorRecord>,
    /// Text files that existed when an incomplete run was rejected.
    pub partial_files: Vec<String>,
}

/// Limits applied by the [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_description_len: usize,
    /// Sessions older than this are treated as gone. `None` keeps them forever.
    pub ttl: Option<chrono::Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_description_len: 2000,
            ttl: Some(chrono::Duration::hours(24)),
        }
    }
}

struct SessionEntry {
    session: Session,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn require(&self, allowed: &[SessionStatus], action: &'static str) -> Result<()> {
        if allowed.contains(&self.session.status) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTransition {
                id: self.session.id,
                from: self.session.status,
                action,
            })
        }
    }

    fn broadcast(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Sends the terminal event and drops every subscriber, closing their channels.
    fn finish(&mut self, event: SessionEvent) {
        self.broadcast(event);
        self.subscribers.clear();
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        let error = ErrorRecord { kind, message };
        self.session.status = SessionStatus::Failed;
        self.session.updated_at = self.next_timestamp();
        self.session.error = Some(error.clone());
        let session_id = self.session.id;
        self.finish(SessionEvent::Failed { session_id, error });
    }

    /// Stops the session before it is dropped. Live subscribers get a terminal
    /// `Cancelled` failure so their streams never end silently.
    fn retire(&mut self, reason: &str) {
        self.cancel.cancel();
        if self.terminal_event().is_none() {
            self.fail(ErrorKind::Cancelled, reason.to_string());
        }
    }

    /// Wall-clock now, clamped so it never precedes the last recorded event.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.session.events.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }

    fn terminal_event(&self) -> Option<SessionEvent> {
        let session_id = self.session.id;
        match self.session.status {
            SessionStatus::Complete => Some(SessionEvent::Completed {
                session_id,
                artifacts: self.session.artifacts.clone(),
            }),
            SessionStatus::Failed => Some(SessionEvent::Failed {
                session_id,
                error: self.session.error.clone().unwrap_or(ErrorRecord {
                    kind: ErrorKind::Internal,
                    message: "session failed without an error record".to_string(),
                }),
            }),
            _ => None,
        }
    }
}

const PREVIEW_CHARS: usize = 200;

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Creates, tracks and retires generation sessions.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<RwLock<SessionEntry>>>,
    store: Arc<ArtifactStore>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(store: Arc<ArtifactStore>, settings: SessionSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        self.settings
            .ttl
            .is_some_and(|ttl| now - session.created_at > ttl)
    }

    fn entry(&self, id: SessionId) -> Result<Arc<RwLock<SessionEntry>>> {
        let entry = self
            .sessions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| WorkflowError::not_found("Session", id))?;
        if self.is_expired(&entry.read().session, Utc::now()) {
            return Err(WorkflowError::not_found("Session", id));
        }
        Ok(entry)
    }

    /// Validates the request and registers a new `Pending` session.
    pub fn create(&self, mut request: GenerationRequest) -> Result<SessionId> {
        request.description = request.description.trim().to_string();
        if request.description.is_empty() {
            return Err(WorkflowError::InvalidRequest(
                "Experiment description is required".to_string(),
            ));
        }
        let length = request.description.chars().count();
        if length > self.settings.max_description_len {
            return Err(WorkflowError::InvalidRequest(format!(
                "Experiment description is {length} characters; the limit is {}",
                self.settings.max_description_len
            )));
        }

        let now = Utc::now();
        let mut id = Uuid::new_v4();
        while self.sessions.contains_key(&id) {
            id = Uuid::new_v4();
        }
        let session = Session {
            id,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            request,
            events: Vec::new(),
            artifacts: ArtifactIndex::new(),
            error: None,
            partial_files: Vec::new(),
        };
        self.sessions.insert(
            id,
            Arc::new(RwLock::new(SessionEntry {
                session,
                subscribers: Vec::new(),
                cancel: CancellationToken::new(),
            })),
        );
        info!(session_id = %id, "Session created");
        Ok(id)
    }

    pub fn begin(&self, id: SessionId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.write();
        guard.require(&[SessionStatus::Pending], "begin")?;
        guard.session.status = SessionStatus::Running;
        guard.session.updated_at = guard.next_timestamp();
        debug!(session_id = %id, "Session running");
        Ok(())
    }

    pub fn record_progress(
        &self,
        id: SessionId,
        stage: Stage,
        message: impl Into<String>,
    ) -> Result<()> {
        self.push_event(id, stage, message.into(), None)
    }

    /// Records that a document was written; streamed to clients as a file update.
    pub fn record_file(
        &self,
        id: SessionId,
        stage: Stage,
        filename: &str,
        content: &str,
    ) -> Result<()> {
        let file = (filename.to_string(), preview(content));
        self.push_event(id, stage, format!("Wrote {filename}"), Some(file))
    }

    fn push_event(
        &self,
        id: SessionId,
        stage: Stage,
        message: String,
        file: Option<(String, String)>,
    ) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.write();
        guard.require(&[SessionStatus::Running], "record progress for")?;
        let timestamp = guard.next_timestamp();
        let (filename, preview) = file.unzip();
        let event = ProgressEvent {
            seq: guard.session.events.len() as u64,
            stage,
            message,
            filename,
            preview,
            timestamp,
        };
        guard.session.events.push(event.clone());
        guard.session.updated_at = timestamp;
        guard.broadcast(SessionEvent::Progress(event));
        Ok(())
    }

    /// Installs the artifacts and completes the session.
    ///
    /// All seven documents must be present. Otherwise the session fails with
    /// `IncompleteArtifacts`, the partial set is kept in the store for diagnosis, and
    /// the same error is returned.
    pub fn complete(&self, id: SessionId, artifacts: ArtifactSet) -> Result<ArtifactIndex> {
        let entry = self.entry(id)?;
        let mut guard = entry.write();
        guard.require(&[SessionStatus::Running], "complete")?;

        let missing = missing_documents(artifacts.texts().keys().map(String::as_str));
        if !missing.is_empty() {
            let err = WorkflowError::IncompleteArtifacts {
                present: 7 - missing.len(),
                missing: missing.iter().map(|d| d.file_name().to_string()).collect(),
            };
            warn!(session_id = %id, error = %err, "Rejecting incomplete artifact set");
            guard.session.partial_files = artifacts.texts().keys().cloned().collect();
            self.store.insert(id, artifacts);
            guard.fail(err.kind(), err.to_string());
            return Err(err);
        }

        let index = artifacts.index();
        self.store.insert(id, artifacts);
        guard.session.status = SessionStatus::Complete;
        guard.session.updated_at = guard.next_timestamp();
        guard.session.artifacts = index.clone();
        guard.finish(SessionEvent::Completed {
            session_id: id,
            artifacts: index.clone(),
        });
        info!(session_id = %id, artifacts = index.len(), "Session complete");
        Ok(index)
    }

    pub fn fail(&self, id: SessionId, kind: ErrorKind, message: impl Into<String>) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.write();
        guard.require(&[SessionStatus::Pending, SessionStatus::Running], "fail")?;
        let message = message.into();
        warn!(session_id = %id, %kind, %message, "Session failed");
        guard.fail(kind, message);
        Ok(())
    }

    /// Fails a live session with `Cancelled` and trips its cancellation token.
    pub fn cancel(&self, id: SessionId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.write();
        guard.require(&[SessionStatus::Pending, SessionStatus::Running], "cancel")?;
        guard.cancel.cancel();
        info!(session_id = %id, "Session cancelled");
        guard.fail(ErrorKind::Cancelled, WorkflowError::Cancelled.to_string());
        Ok(())
    }

    pub fn cancellation_token(&self, id: SessionId) -> Result<CancellationToken> {
        Ok(self.entry(id)?.read().cancel.clone())
    }

    pub fn get(&self, id: SessionId) -> Result<Session> {
        Ok(self.entry(id)?.read().session.clone())
    }

    /// Snapshots of all live sessions, newest first.
    pub fn list(&self) -> Vec<Session> {
        let now = Utc::now();
        let entries: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut sessions: Vec<Session> = entries
            .iter()
            .map(|entry| entry.read().session.clone())
            .filter(|session| !self.is_expired(session, now))
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Opens an ordered event stream for a session.
    ///
    /// Already-recorded events are replayed first. For a session that has already
    /// finished, the terminal event follows immediately and the channel closes.
    pub fn subscribe(&self, id: SessionId) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let entry = self.entry(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = entry.write();
        for event in &guard.session.events {
            let _ = tx.send(SessionEvent::Progress(event.clone()));
        }
        match guard.terminal_event() {
            Some(terminal) => {
                let _ = tx.send(terminal);
            }
            None => guard.subscribers.push(tx),
        }
        Ok(rx)
    }

    /// Removes a session and its artifacts, stopping any generation still running.
    pub fn delete(&self, id: SessionId) -> Result<()> {
        let (_, entry) = self
            .sessions
            .remove(&id)
            .ok_or_else(|| WorkflowError::not_found("Session", id))?;
        entry.write().retire("Session was deleted");
        self.store.remove(id);
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Evicts sessions past their time-to-live. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| self.is_expired(&e.value().read().session, now))
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            if let Some((_, entry)) = self.sessions.remove(id) {
                entry.write().retire("Session expired");
                self.store.remove(*id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Purged expired sessions");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
