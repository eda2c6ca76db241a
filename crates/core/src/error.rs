//! Error taxonomy for the generation workflow.

use crate::session::{SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The serializable classification of a workflow failure, stored on failed sessions
/// and sent to streaming clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidTransition,
    NotFound,
    IncompleteArtifacts,
    BudgetExceeded,
    ProviderUnavailable,
    Cancelled,
    SessionNotReady,
    EngineError,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IncompleteArtifacts => "incomplete_artifacts",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SessionNotReady => "session_not_ready",
            ErrorKind::EngineError => "engine_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cannot {action} session {id} while it is {from}")]
    InvalidTransition {
        id: SessionId,
        from: SessionStatus,
        action: &'static str,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error(
        "Generation produced {present} of 7 required documents; missing: {}",
        .missing.join(", ")
    )]
    IncompleteArtifacts { present: usize, missing: Vec<String> },

    #[error("Step budget of {budget} exhausted before the guide was finished")]
    BudgetExceeded { budget: u32 },

    #[error("No provider available: {0}")]
    ProviderUnavailable(String),

    #[error("Session was cancelled")]
    Cancelled,

    #[error("Session is {status}; exports require a complete session")]
    SessionNotReady { status: SessionStatus },

    #[error("Reasoning engine failed: {0}")]
    Engine(String),

    #[error("Generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            WorkflowError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::IncompleteArtifacts { .. } => ErrorKind::IncompleteArtifacts,
            WorkflowError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            WorkflowError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            WorkflowError::Cancelled => ErrorKind::Cancelled,
            WorkflowError::SessionNotReady { .. } => ErrorKind::SessionNotReady,
            WorkflowError::Engine(_) => ErrorKind::EngineError,
            WorkflowError::Timeout(_) => ErrorKind::Timeout,
            WorkflowError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;
