//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, static UI, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ArtifactView, ErrorResponse, ErrorView, ExamplesResponse, ExperimentExample, FileContent,
        FilesResponse, GenerateExperimentPayload, GenerationResult, HealthResponse,
        ImageGenerationPayload, ImageGenerationResponse, ImageInfo, ImagesResponse,
        MultipleImagesPayload, MultipleImagesResponse, ProgressView, SessionCreated, SessionSummary, SessionView,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::{path::Path, sync::Arc};
use tower_http::services::{ServeDir, ServeFile};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::experiment_examples,
        handlers::create_session,
        handlers::generate_experiment,
        handlers::list_sessions,
        handlers::get_session,
        handlers::delete_session,
        handlers::cancel_session,
        handlers::list_files,
        handlers::get_file,
        handlers::download_file,
        handlers::list_images,
        handlers::get_image,
        handlers::download_zip,
        handlers::download_html,
        handlers::generate_image,
        handlers::generate_multiple_images,
    ),
    components(
        schemas(
            GenerateExperimentPayload, SessionCreated, SessionView, SessionSummary,
            ProgressView, ArtifactView, ErrorView, GenerationResult, FilesResponse,
            FileContent, ImageInfo, ImagesResponse, ImageGenerationPayload,
            ImageGenerationResponse, MultipleImagesPayload, MultipleImagesResponse,
            ExperimentExample, ExamplesResponse, HealthResponse,
            ErrorResponse
        )
    ),
    tags(
        (name = "LabGuide API", description = "Generation of physics lab guides")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>, static_dir: &Path) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/experiment-examples", get(handlers::experiment_examples))
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/api/generate-experiment", post(handlers::generate_experiment))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/sessions/{id}/cancel", post(handlers::cancel_session))
        .route("/api/sessions/{id}/files", get(handlers::list_files))
        .route(
            "/api/sessions/{id}/files/{filename}",
            get(handlers::get_file),
        )
        .route(
            "/api/sessions/{id}/download/{filename}",
            get(handlers::download_file),
        )
        .route("/api/sessions/{id}/images", get(handlers::list_images))
        .route(
            "/api/sessions/{id}/images/{ordinal}",
            get(handlers::get_image),
        )
        .route("/api/sessions/{id}/download-zip", get(handlers::download_zip))
        .route(
            "/api/sessions/{id}/download-html",
            get(handlers::download_html),
        )
        .route("/api/generate-image", post(handlers::generate_image))
        .route(
            "/api/generate-multiple-images",
            post(handlers::generate_multiple_images),
        )
        .route("/ws/generate-experiment", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
}
