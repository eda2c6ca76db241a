//! Reasoning-engine boundary.
//!
//! The orchestrator hands an engine a [`EngineJob`] (what to produce) and an
//! [`EngineContext`] (tools, step budget, progress sink, cancellation) and gets back the
//! text files it wrote. How the engine plans its work is its own business.

use crate::document::Document;
use crate::error::{Result, WorkflowError};
use crate::session::{GenerationRequest, SessionId, SessionManager, Stage};
use crate::tools::Toolbox;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EngineJob {
    pub session_id: SessionId,
    pub request: GenerationRequest,
    pub targets: Vec<Document>,
    pub step_budget: u32,
}

impl EngineJob {
    pub fn new(session_id: SessionId, request: GenerationRequest, step_budget: u32) -> Self {
        Self {
            session_id,
            request,
            targets: Document::ALL.to_vec(),
            step_budget,
        }
    }

    pub fn target_names(&self) -> Vec<&'static str> {
        self.targets.iter().map(|d| d.file_name()).collect()
    }
}

/// Counts engine steps against a fixed budget.
#[derive(Debug)]
pub struct StepMeter {
    budget: u32,
    used: AtomicU32,
}

impl StepMeter {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            used: AtomicU32::new(0),
        }
    }

    /// Consumes one step. Fails once more steps are taken than the budget allows.
    pub fn step(&self) -> Result<u32> {
        let taken = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if taken > self.budget {
            Err(WorkflowError::BudgetExceeded {
                budget: self.budget,
            })
        } else {
            Ok(taken)
        }
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst).min(self.budget)
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }
}

/// Everything an engine may touch while it runs.
#[derive(Clone)]
pub struct EngineContext {
    session_id: SessionId,
    sessions: Arc<SessionManager>,
    tools: Arc<Toolbox>,
    meter: Arc<StepMeter>,
    cancel: CancellationToken,
    stage: Arc<Mutex<Stage>>,
}

impl EngineContext {
    pub fn new(
        session_id: SessionId,
        sessions: Arc<SessionManager>,
        tools: Arc<Toolbox>,
        meter: Arc<StepMeter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            sessions,
            tools,
            meter,
            cancel,
            stage: Arc::new(Mutex::new(Stage::Queued)),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn tools(&self) -> &Arc<Toolbox> {
        &self.tools
    }

    pub fn meter(&self) -> &StepMeter {
        &self.meter
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Takes one step of the budget; checked before every model call.
    pub fn step(&self) -> Result<u32> {
        if self.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        self.meter.step()
    }

    pub fn current_stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Announces a new stage to the session's progress stream.
    pub fn stage(&self, stage: Stage, message: impl Into<String>) {
        *self.stage.lock() = stage;
        self.progress(message);
    }

    pub fn progress(&self, message: impl Into<String>) {
        let stage = self.current_stage();
        if let Err(e) = self
            .sessions
            .record_progress(self.session_id, stage, message)
        {
            // The session was cancelled or deleted underneath us.
            debug!(session_id = %self.session_id, error = %e, "Progress not recorded");
        }
    }

    pub fn file_written(&self, filename: &str, content: &str) {
        let stage = self.current_stage();
        if let Err(e) = self
            .sessions
            .record_file(self.session_id, stage, filename, content)
        {
            debug!(session_id = %self.session_id, error = %e, "File update not recorded");
        }
    }
}

/// Text files produced by an engine run, by file name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub files: BTreeMap<String, String>,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, job: &EngineJob, ctx: &EngineContext) -> Result<EngineOutput>;
}
