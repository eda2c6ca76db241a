//! Defines the WebSocket message protocol between the browser client and the API server.

use chrono::{DateTime, Utc};
use labguide_core::{
    ErrorKind, SessionId,
    artifact::{ArtifactIndex, ArtifactKind},
    session::{SessionEvent, Stage},
};
use serde::{Deserialize, Serialize};

use crate::models::GenerateExperimentPayload;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Starts a new generation. Either this or `subscribe` must be the first message.
    #[serde(rename = "generate")]
    Generate(GenerateExperimentPayload),
    /// Follows the progress of an existing session.
    #[serde(rename = "subscribe")]
    Subscribe { session_id: SessionId },
    /// Cancels the session this connection is attached to.
    #[serde(rename = "cancel")]
    Cancel,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A progress update.
    Status {
        session_id: SessionId,
        stage: Stage,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A document was written or rewritten.
    FileUpdate {
        session_id: SessionId,
        filename: String,
        preview: String,
        timestamp: DateTime<Utc>,
    },
    /// The guide is ready. Terminal.
    Completion {
        session_id: SessionId,
        files: Vec<String>,
        images: usize,
    },
    /// Generation failed or the request was rejected. Terminal.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        message: String,
    },
}

impl ServerMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerMessage::Completion { .. } | ServerMessage::Error { .. }
        )
    }

    /// An error that is not tied to any session, e.g. a malformed first message.
    pub fn rejected(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            session_id: None,
            kind: Some(ErrorKind::InvalidRequest),
            message: message.into(),
        }
    }

    /// Translates a session event into what the client sees.
    pub fn from_event(session_id: SessionId, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Progress(progress) => match (progress.filename, progress.preview) {
                (Some(filename), preview) => ServerMessage::FileUpdate {
                    session_id,
                    filename,
                    preview: preview.unwrap_or_default(),
                    timestamp: progress.timestamp,
                },
                (None, _) => ServerMessage::Status {
                    session_id,
                    stage: progress.stage,
                    message: progress.message,
                    timestamp: progress.timestamp,
                },
            },
            SessionEvent::Completed { artifacts, .. } => {
                let (files, images) = split_index(&artifacts);
                ServerMessage::Completion {
                    session_id,
                    files,
                    images,
                }
            }
            SessionEvent::Failed { error, .. } => ServerMessage::Error {
                session_id: Some(session_id),
                kind: Some(error.kind),
                message: error.message,
            },
        }
    }
}

fn split_index(index: &ArtifactIndex) -> (Vec<String>, usize) {
    let files = index
        .values()
        .filter(|h| h.kind == ArtifactKind::Text)
        .map(|h| h.name.clone())
        .collect();
    let images = index
        .values()
        .filter(|h| h.kind == ArtifactKind::Image)
        .count();
    (files, images)
}
