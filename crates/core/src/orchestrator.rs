//! Generation Orchestrator
//!
//! Runs one session from `Running` to a terminal state. The orchestrator never returns an
//! error: whatever goes wrong ends up recorded on the session via `fail`.

use crate::artifact::{ArtifactSet, ImageArtifact};
use crate::engine::{EngineContext, EngineJob, EngineOutput, ReasoningEngine, StepMeter};
use crate::error::{ErrorKind, WorkflowError};
use crate::image::{ImageService, ImageStyle};
use crate::search::SearchChain;
use crate::session::{GenerationRequest, SessionId, SessionManager, Stage};
use crate::tools::Toolbox;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Limits applied to every generation run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Reasoning steps the engine may take before the run fails with `BudgetExceeded`.
    pub step_budget: u32,
    /// Wall-clock limit for the engine phase.
    pub generation_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_budget: 50,
            generation_timeout: Duration::from_secs(900),
        }
    }
}

/// Drives one session from `Pending` to a terminal state.
///
/// The orchestrator owns no session state itself. Every transition goes through the
/// [`SessionManager`], so subscribers see the same event stream whether a run completes,
/// fails, times out or is cancelled.
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    engine: Arc<dyn ReasoningEngine>,
    search: Arc<SearchChain>,
    images: Arc<ImageService>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Wires the session registry, the reasoning engine and the provider adapters together.
    pub fn new(
        sessions: Arc<SessionManager>,
        engine: Arc<dyn ReasoningEngine>,
        search: Arc<SearchChain>,
        images: Arc<ImageService>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            sessions,
            engine,
            search,
            images,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Runs the session on its own task.
    pub fn spawn(self: &Arc<Self>, id: SessionId) -> JoinHandle<()> {
        let this = self.clone();
        let span = tracing::info_span!("generation", session_id = %id, engine = this.engine.name());
        tokio::spawn(async move { this.run(id).await }.instrument(span))
    }

    /// Runs a pending session to completion on the current task.
    ///
    /// Never returns an error. Every failure is recorded on the session as a `Failed`
    /// transition with its error kind; a session that was deleted or cancelled before the
    /// run started is left untouched.
    pub async fn run(&self, id: SessionId) {
        let request = match self.sessions.get(id) {
            Ok(session) => session.request,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Session vanished before generation");
                return;
            }
        };
        if let Err(e) = self.sessions.begin(id) {
            // Typically a cancel that arrived before the task started.
            warn!(session_id = %id, error = %e, "Session could not start");
            return;
        }
        let cancel = match self.sessions.cancellation_token(id) {
            Ok(token) => token,
            Err(e) => return self.abort(id, e),
        };
        let _ = self
            .sessions
            .record_progress(id, Stage::Queued, "Generation started");

        let toolbox = Arc::new(Toolbox::new(
            self.search.clone(),
            self.images.clone(),
            cancel.clone(),
        ));
        let ctx = EngineContext::new(
            id,
            self.sessions.clone(),
            toolbox.clone(),
            Arc::new(StepMeter::new(self.settings.step_budget)),
            cancel.clone(),
        );
        let job = EngineJob::new(id, request.clone(), self.settings.step_budget);
        info!(
            session_id = %id,
            budget = job.step_budget,
            images = request.image_count,
            "Generation running"
        );

        let timeout = self.settings.generation_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
            run = tokio::time::timeout(timeout, self.engine.run(&job, &ctx)) => {
                run.unwrap_or(Err(WorkflowError::Timeout(timeout)))
            }
        };

        match result {
            Ok(output) => self.finish(id, &request, output, &toolbox, &cancel).await,
            Err(e) => self.abort(id, e),
        }
    }

    async fn finish(
        &self,
        id: SessionId,
        request: &GenerationRequest,
        output: EngineOutput,
        toolbox: &Toolbox,
        cancel: &CancellationToken,
    ) {
        let _ = self.sessions.record_progress(
            id,
            Stage::Finalize,
            format!("Assembling {} documents", output.files.len()),
        );
        let mut set = ArtifactSet::new();
        for (name, content) in output.files {
            set.insert_text(name, content);
        }

        if request.image_count > 0 {
            let _ = self.sessions.record_progress(
                id,
                Stage::Images,
                format!("Generating {} images", request.image_count),
            );
            for i in 0..request.image_count as usize {
                let style = ImageStyle::ALL[i % ImageStyle::ALL.len()];
                let topic = format!("{} - Image {}", request.description, i + 1);
                match toolbox.generate_image(&topic, style, None).await {
                    Ok(outcome) if outcome.is_success() => {
                        let _ = self.sessions.record_progress(
                            id,
                            Stage::Images,
                            format!("Image {} ({}) generated", i + 1, style.as_str()),
                        );
                    }
                    Ok(outcome) => {
                        let reason = outcome.error.unwrap_or_default();
                        warn!(session_id = %id, image = i + 1, %reason, "Image generation failed");
                        let _ = self.sessions.record_progress(
                            id,
                            Stage::Images,
                            format!("Image {} failed: {reason}", i + 1),
                        );
                    }
                    Err(_) => {
                        debug!(session_id = %id, "Cancelled during image generation");
                        return;
                    }
                }
            }
        }

        for outcome in toolbox.take_generated_images() {
            set.push_image(ImageArtifact::generated(outcome));
        }
        for url in toolbox.take_searched_images() {
            set.push_image(ImageArtifact::searched(url));
        }

        if cancel.is_cancelled() {
            debug!(session_id = %id, "Discarding results of a cancelled session");
            return;
        }
        match self.sessions.complete(id, set) {
            Ok(index) => info!(session_id = %id, artifacts = index.len(), "Guide generated"),
            Err(e) => warn!(session_id = %id, error = %e, "Generation did not complete"),
        }
    }

    fn abort(&self, id: SessionId, err: WorkflowError) {
        match self.sessions.fail(id, err.kind(), err.to_string()) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::InvalidTransition | ErrorKind::NotFound) => {
                // Cancelled or deleted while the engine was running.
                debug!(session_id = %id, error = %err, "Session already finished");
            }
            Err(e) => error!(session_id = %id, error = %e, "Could not record failure"),
        }
    }
}
