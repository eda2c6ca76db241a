//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable handles to the session registry and the generation services.

use crate::config::Config;
use labguide_core::{image::ImageService, orchestrator::Orchestrator, session::SessionManager};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub images: Arc<ImageService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the state around an orchestrator, sharing its session registry.
    pub fn new(orchestrator: Arc<Orchestrator>, images: Arc<ImageService>, config: Config) -> Self {
        Self {
            sessions: orchestrator.sessions().clone(),
            orchestrator,
            images,
            config: Arc::new(config),
        }
    }
}
