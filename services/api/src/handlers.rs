//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for session intake,
//! inspection, artifact retrieval and export. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Redirect, Response},
};
use labguide_core::{
    ErrorKind, SessionId, WorkflowError, artifact::ArtifactSet, export, session::Session,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{
        EXPERIMENT_EXAMPLES, ErrorResponse, ExamplesResponse, FileContent, FilesResponse,
        GenerateExperimentPayload, GenerationResult, HealthResponse, ImageGenerationPayload,
        ImageGenerationResponse, ImageInfo, ImagesResponse, MAX_BATCH_IMAGES,
        MultipleImagesPayload, MultipleImagesResponse, SessionCreated, SessionSummary,
        SessionView, parse_style, parse_styles,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl ApiError {
    /// Maps a workflow failure onto the HTTP status that describes it.
    pub fn workflow(err: WorkflowError) -> Self {
        match err.kind() {
            ErrorKind::InvalidRequest => ApiError::BadRequest(err.to_string()),
            ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
            ErrorKind::InvalidTransition
            | ErrorKind::SessionNotReady
            | ErrorKind::IncompleteArtifacts => ApiError::Conflict(err.to_string()),
            ErrorKind::ProviderUnavailable => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::InternalServerError(err.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::ServiceUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse { message }),
            )
                .into_response(),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn session_snapshot(state: &AppState, id: SessionId) -> Result<Session, ApiError> {
    state.sessions.get(id).map_err(ApiError::workflow)
}

/// A session together with its stored artifacts. Sessions that never produced any
/// are reported as not ready.
fn session_artifacts(
    state: &AppState,
    id: SessionId,
) -> Result<(Session, Arc<ArtifactSet>), ApiError> {
    let session = session_snapshot(state, id)?;
    let artifacts = state.sessions.store().get(id).ok_or_else(|| {
        ApiError::workflow(WorkflowError::SessionNotReady {
            status: session.status,
        })
    })?;
    Ok((session, artifacts))
}

fn attachment(content_type: &'static str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn export_name(id: SessionId, extension: &str) -> String {
    let short: String = id.simple().to_string().chars().take(8).collect();
    format!("experiment_guide_{short}.{extension}")
}

/// Service health and readiness.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "labguide",
        message: "Ready to help with physics experiments!",
        model: state.config.chat_model.clone(),
        sessions: state.sessions.len(),
        image_generation: state.images.is_available(),
    })
}

/// Example experiment topics for inspiration.
#[utoipa::path(
    get,
    path = "/api/experiment-examples",
    responses((status = 200, description = "Example topics", body = ExamplesResponse))
)]
pub async fn experiment_examples() -> Json<ExamplesResponse> {
    Json(ExamplesResponse {
        examples: EXPERIMENT_EXAMPLES.to_vec(),
    })
}

/// Start generating a lab guide in the background.
#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = GenerateExperimentPayload,
    responses(
        (status = 202, description = "Session accepted; generation is running", body = SessionCreated),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GenerateExperimentPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .sessions
        .create(payload.into_request())
        .map_err(ApiError::workflow)?;
    let session = session_snapshot(&state, id)?;
    state.orchestrator.spawn(id);
    info!(session_id = %id, "Generation queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(SessionCreated {
            session_id: id,
            status: session.status,
        }),
    ))
}

/// Generate a lab guide and wait for the outcome.
#[utoipa::path(
    post,
    path = "/api/generate-experiment",
    request_body = GenerateExperimentPayload,
    responses(
        (status = 200, description = "Generation finished (complete or failed)", body = GenerationResult),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn generate_experiment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GenerateExperimentPayload>,
) -> Result<Json<GenerationResult>, ApiError> {
    let id = state
        .sessions
        .create(payload.into_request())
        .map_err(ApiError::workflow)?;
    state.orchestrator.spawn(id).await?;
    let session = session_snapshot(&state, id)?;
    Ok(Json(GenerationResult::from(session)))
}

/// List live sessions, newest first.
#[utoipa::path(
    get,
    path = "/api/sessions",
    responses((status = 200, description = "List of sessions", body = [SessionSummary]))
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .sessions
            .list()
            .iter()
            .map(SessionSummary::from)
            .collect(),
    )
}

/// Get a snapshot of a session.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(session_snapshot(&state, id)?.into()))
}

/// Delete a session and its artifacts, stopping generation if it is still running.
#[utoipa::path(
    delete,
    path = "/api/sessions/{id}",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(id).map_err(ApiError::workflow)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Cancel a pending or running generation.
#[utoipa::path(
    post,
    path = "/api/sessions/{id}/cancel",
    responses(
        (status = 200, description = "Session cancelled", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session already finished", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    state.sessions.cancel(id).map_err(ApiError::workflow)?;
    Ok(Json(session_snapshot(&state, id)?.into()))
}

/// All text documents of a session.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/files",
    responses(
        (status = 200, description = "File name to content", body = FilesResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "No artifacts yet", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<FilesResponse>, ApiError> {
    let (_, artifacts) = session_artifacts(&state, id)?;
    Ok(Json(FilesResponse {
        session_id: id,
        files: artifacts.texts().clone(),
    }))
}

/// One text document of a session.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/files/{filename}",
    responses(
        (status = 200, description = "File content", body = FileContent),
        (status = 404, description = "Session or file not found", body = ErrorResponse),
        (status = 409, description = "No artifacts yet", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("filename" = String, Path, description = "Document file name, e.g. methodology.md")
    )
)]
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((id, filename)): Path<(Uuid, String)>,
) -> Result<Json<FileContent>, ApiError> {
    let (_, artifacts) = session_artifacts(&state, id)?;
    let content = artifacts
        .text(&filename)
        .ok_or_else(|| ApiError::NotFound(format!("File '{filename}' not found")))?;
    Ok(Json(FileContent {
        filename,
        content: content.to_string(),
    }))
}

/// One text document as a markdown attachment.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/download/{filename}",
    responses(
        (status = 200, description = "Markdown file", content_type = "text/markdown"),
        (status = 404, description = "Session or file not found", body = ErrorResponse),
        (status = 409, description = "No artifacts yet", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("filename" = String, Path, description = "Document file name")
    )
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((id, filename)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let (_, artifacts) = session_artifacts(&state, id)?;
    let content = artifacts
        .text(&filename)
        .ok_or_else(|| ApiError::NotFound(format!("File '{filename}' not found")))?;
    let download_name = filename.rsplit('/').next().unwrap_or(&filename);
    Ok(attachment(
        "text/markdown; charset=utf-8",
        download_name,
        content.as_bytes().to_vec(),
    ))
}

/// Metadata for every image of a session.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/images",
    responses(
        (status = 200, description = "Image metadata", body = ImagesResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "No artifacts yet", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn list_images(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImagesResponse>, ApiError> {
    let (_, artifacts) = session_artifacts(&state, id)?;
    Ok(Json(ImagesResponse {
        session_id: id,
        images: artifacts.images().iter().map(ImageInfo::from).collect(),
    }))
}

/// Image bytes, or a redirect to where a searched image lives.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/images/{ordinal}",
    responses(
        (status = 200, description = "Image bytes", content_type = "image/*"),
        (status = 307, description = "Redirect to the image's source URL"),
        (status = 404, description = "Session or image not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("ordinal" = u32, Path, description = "1-based image number")
    )
)]
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path((id, ordinal)): Path<(Uuid, u32)>,
) -> Result<Response, ApiError> {
    let (_, artifacts) = session_artifacts(&state, id)?;
    let image = artifacts
        .image(ordinal)
        .ok_or_else(|| ApiError::NotFound(format!("Image {ordinal} not found")))?;

    match (&image.bytes, &image.source_url) {
        (Some(bytes), _) if !bytes.is_empty() => {
            let mime = image
                .mime_type
                .clone()
                .unwrap_or_else(|| "image/jpeg".to_string());
            Ok(([(header::CONTENT_TYPE, mime)], bytes.clone()).into_response())
        }
        (_, Some(url)) => Ok(Redirect::temporary(url).into_response()),
        _ => Err(ApiError::NotFound(format!(
            "Image {ordinal} has no content"
        ))),
    }
}

/// Download the complete guide as a ZIP archive.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/download-zip",
    responses(
        (status = 200, description = "ZIP archive", content_type = "application/zip"),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session is not complete", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn download_zip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (session, artifacts) = session_artifacts(&state, id)?;
    let bytes = export::to_zip(&session, &artifacts).map_err(ApiError::workflow)?;
    Ok(attachment("application/zip", &export_name(id, "zip"), bytes))
}

/// Download the complete guide as a single self-contained HTML page.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/download-html",
    responses(
        (status = 200, description = "HTML document", content_type = "text/html"),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session is not complete", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn download_html(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (session, artifacts) = session_artifacts(&state, id)?;
    let bytes = export::to_html(&session, &artifacts).map_err(ApiError::workflow)?;
    Ok(attachment(
        "text/html; charset=utf-8",
        &export_name(id, "html"),
        bytes,
    ))
}

/// Generate a single illustration outside of any session.
#[utoipa::path(
    post,
    path = "/api/generate-image",
    request_body = ImageGenerationPayload,
    responses(
        (status = 200, description = "Generation attempted", body = ImageGenerationResponse),
        (status = 400, description = "Unknown style", body = ErrorResponse),
        (status = 503, description = "No image provider configured", body = ErrorResponse)
    )
)]
pub async fn generate_image(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImageGenerationPayload>,
) -> Result<Json<ImageGenerationResponse>, ApiError> {
    if !state.images.is_available() {
        return Err(ApiError::workflow(WorkflowError::ProviderUnavailable(
            "image generation is not configured".to_string(),
        )));
    }
    let topic = payload.experiment_topic.trim();
    if topic.is_empty() {
        return Err(ApiError::BadRequest(
            "experiment_topic is required".to_string(),
        ));
    }
    let style = parse_style(payload.style.as_deref()).map_err(ApiError::BadRequest)?;
    let prompt = payload
        .custom_prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let outcome = state.images.generate(topic, style, prompt).await;
    Ok(Json(outcome.into()))
}

/// Generate a batch of illustrations for one topic, cycling through the requested styles.
#[utoipa::path(
    post,
    path = "/api/generate-multiple-images",
    request_body = MultipleImagesPayload,
    responses(
        (status = 200, description = "Batch attempted", body = MultipleImagesResponse),
        (status = 400, description = "Invalid topic, count or style", body = ErrorResponse),
        (status = 503, description = "No image provider configured", body = ErrorResponse)
    )
)]
pub async fn generate_multiple_images(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MultipleImagesPayload>,
) -> Result<Json<MultipleImagesResponse>, ApiError> {
    if !state.images.is_available() {
        return Err(ApiError::workflow(WorkflowError::ProviderUnavailable(
            "image generation is not configured".to_string(),
        )));
    }
    let topic = payload.experiment_topic.trim();
    if topic.is_empty() {
        return Err(ApiError::BadRequest(
            "experiment_topic is required".to_string(),
        ));
    }
    if payload.count == 0 || payload.count > MAX_BATCH_IMAGES {
        return Err(ApiError::BadRequest(format!(
            "count must be between 1 and {MAX_BATCH_IMAGES}"
        )));
    }
    let styles = parse_styles(payload.styles.as_deref()).map_err(ApiError::BadRequest)?;

    info!(topic, count = payload.count, "Generating image batch");
    let outcomes = state
        .images
        .generate_many(topic, payload.count as usize, &styles)
        .await;
    let generated_count = outcomes.iter().filter(|o| o.is_success()).count();
    Ok(Json(MultipleImagesResponse {
        success: generated_count > 0,
        experiment_topic: topic.to_string(),
        generated_count,
        total_requested: payload.count,
        images: outcomes.into_iter().map(Into::into).collect(),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, Provider};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use labguide_core::{
        SessionStatus,
        artifact::{ArtifactStore, ImageArtifact},
        document::Document,
        engine::{EngineContext, EngineJob, EngineOutput, ReasoningEngine},
        image::{GeneratedImage, ImageProvider, ImageService},
        orchestrator::{Orchestrator, OrchestratorSettings},
        search::SearchChain,
        session::{SessionManager, SessionSettings, Stage},
    };
    use std::time::Duration;

    /// Writes every required document in one step.
    pub(crate) struct InstantWriter;

    #[async_trait]
    impl ReasoningEngine for InstantWriter {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn run(
            &self,
            job: &EngineJob,
            ctx: &EngineContext,
        ) -> labguide_core::error::Result<EngineOutput> {
            ctx.step()?;
            ctx.stage(Stage::Draft, "Drafting");
            let mut output = EngineOutput::default();
            for doc in &job.targets {
                let content = format!("# {}\n\n{}\n", doc.title(), job.request.description);
                ctx.file_written(doc.file_name(), &content);
                output.files.insert(doc.file_name().to_string(), content);
            }
            Ok(output)
        }
    }

    /// Returns a tiny PNG header for every prompt.
    struct PngProvider;

    #[async_trait]
    impl ImageProvider for PngProvider {
        fn name(&self) -> &'static str {
            "png"
        }

        async fn generate(&self, _prompt: &str) -> anyhow::Result<GeneratedImage> {
            Ok(GeneratedImage {
                bytes: vec![0x89, 0x50, 0x4E, 0x47],
                mime_type: "image/png".into(),
                url: None,
            })
        }
    }

    pub(crate) fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            provider: Provider::OpenAI,
            openai_api_key: Some("test".into()),
            gemini_api_key: None,
            chat_model: "gpt-4o".into(),
            log_level: tracing::Level::INFO,
            prompts_path: "./prompts".into(),
            static_dir: "./static".into(),
            serpapi_api_key: None,
            tavily_api_key: None,
            duckduckgo_enabled: false,
            replicate_api_token: None,
            replicate_model: None,
            image_dir: None,
            step_budget: 10,
            provider_timeout: Duration::from_secs(1),
            generation_timeout: Duration::from_secs(10),
            max_description_len: 2000,
            session_ttl: Duration::from_secs(3600),
        }
    }

    pub(crate) fn test_state(images: ImageService) -> Arc<AppState> {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(ArtifactStore::new()),
            SessionSettings::default(),
        ));
        let images = Arc::new(images);
        let orchestrator = Arc::new(Orchestrator::new(
            sessions,
            Arc::new(InstantWriter),
            Arc::new(SearchChain::new(Vec::new(), Duration::from_secs(1))),
            images.clone(),
            OrchestratorSettings {
                step_budget: 10,
                generation_timeout: Duration::from_secs(10),
            },
        ));
        Arc::new(AppState::new(orchestrator, images, test_config()))
    }

    fn payload(description: &str) -> GenerateExperimentPayload {
        GenerateExperimentPayload {
            description: description.to_string(),
            student_name: Some("Ada".into()),
            grade_level: None,
            model: None,
            image_count: 0,
        }
    }

    async fn completed_session(state: &Arc<AppState>) -> Uuid {
        let Json(result) = generate_experiment(
            State(state.clone()),
            Json(payload("pendulum length vs period")),
        )
        .await
        .unwrap();
        assert_eq!(result.status, SessionStatus::Complete);
        result.session_id
    }

    #[test]
    fn test_workflow_error_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (
                WorkflowError::InvalidRequest("empty".into()),
                StatusCode::BAD_REQUEST,
            ),
            (WorkflowError::not_found("Session", id), StatusCode::NOT_FOUND),
            (
                WorkflowError::InvalidTransition {
                    id,
                    from: SessionStatus::Complete,
                    action: "cancel",
                },
                StatusCode::CONFLICT,
            ),
            (
                WorkflowError::SessionNotReady {
                    status: SessionStatus::Running,
                },
                StatusCode::CONFLICT,
            ),
            (
                WorkflowError::ProviderUnavailable("none".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                WorkflowError::Internal("zip writer".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::workflow(err).into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_health_reports_configured_model() {
        let state = test_state(ImageService::disabled());
        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.model, "gpt-4o");
        assert_eq!(health.sessions, 0);
        assert!(!health.image_generation);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = ApiError::from(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("secret detail"));
    }

    #[tokio::test]
    async fn test_create_session_rejects_empty_description() {
        let state = test_state(ImageService::disabled());
        let err = create_session(State(state), Json(payload("   ")))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_session_returns_accepted() {
        let state = test_state(ImageService::disabled());
        let response = create_session(State(state.clone()), Json(payload("Ohm's law")))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_experiment_lists_all_documents() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;

        let Json(files) = list_files(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(files.files.len(), Document::ALL.len());

        for doc in Document::ALL {
            let Json(file) =
                get_file(State(state.clone()), Path((id, doc.file_name().to_string())))
                    .await
                    .unwrap();
            assert!(file.content.starts_with(&format!("# {}", doc.title())));
            assert!(file.content.contains("pendulum length vs period"));
        }
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let state = test_state(ImageService::disabled());
        let err = get_session(State(state), Path(Uuid::new_v4()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_files_of_pending_session_are_not_ready() {
        let state = test_state(ImageService::disabled());
        let id = state
            .sessions
            .create(payload("Lens focal length").into_request())
            .unwrap();

        let err = list_files(State(state.clone()), Path(id)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
        let err = download_zip(State(state), Path(id)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;
        let err = download_file(State(state), Path((id, "secrets.md".to_string())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_file_is_markdown_attachment() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;
        let filename = Document::Methodology.file_name().to_string();
        let response = download_file(State(state), Path((id, filename)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(
            headers[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/markdown")
        );
        assert_eq!(
            headers[header::CONTENT_DISPOSITION].to_str().unwrap(),
            "attachment; filename=\"methodology.md\""
        );
    }

    #[tokio::test]
    async fn test_exports_of_complete_session() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;

        let zip = download_zip(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(zip.status(), StatusCode::OK);
        assert_eq!(zip.headers()[header::CONTENT_TYPE], "application/zip");

        let html = download_html(State(state), Path(id)).await.unwrap();
        let body = to_bytes(html.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("pendulum length vs period"));
    }

    #[tokio::test]
    async fn test_cancel_finished_session_conflicts() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;
        let err = cancel_session(State(state), Path(id)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let state = test_state(ImageService::disabled());
        let id = completed_session(&state).await;

        let status = delete_session(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = get_session(State(state), Path(id)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_generate_image_without_provider_is_unavailable() {
        let state = test_state(ImageService::disabled());
        let err = generate_image(
            State(state),
            Json(ImageGenerationPayload {
                experiment_topic: "Pendulum".into(),
                style: None,
                custom_prompt: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_generate_image_rejects_unknown_style() {
        let state = test_state(ImageService::new(
            Arc::new(PngProvider),
            Duration::from_secs(1),
        ));
        let err = generate_image(
            State(state),
            Json(ImageGenerationPayload {
                experiment_topic: "Pendulum".into(),
                style: Some("watercolor".into()),
                custom_prompt: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate_multiple_images_cycles_styles() {
        let state = test_state(ImageService::new(
            Arc::new(PngProvider),
            Duration::from_secs(1),
        ));
        let Json(batch) = generate_multiple_images(
            State(state),
            Json(MultipleImagesPayload {
                experiment_topic: " Projectile motion ".into(),
                count: 4,
                styles: Some(vec!["diagram".into(), "scientific".into()]),
            }),
        )
        .await
        .unwrap();

        assert!(batch.success);
        assert_eq!(batch.experiment_topic, "Projectile motion");
        assert_eq!(batch.total_requested, 4);
        assert_eq!(batch.generated_count, 4);
        let styles: Vec<&str> = batch.images.iter().map(|i| i.style.as_str()).collect();
        assert_eq!(styles, vec!["diagram", "scientific", "diagram", "scientific"]);
        assert_eq!(batch.images[2].experiment_topic, "Projectile motion - Image 3");
    }

    #[tokio::test]
    async fn test_generate_multiple_images_validates_input() {
        let payload = |count, styles: Option<Vec<String>>| MultipleImagesPayload {
            experiment_topic: "Pendulum".into(),
            count,
            styles,
        };

        let state = test_state(ImageService::disabled());
        let err = generate_multiple_images(State(state), Json(payload(3, None)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let state = test_state(ImageService::new(
            Arc::new(PngProvider),
            Duration::from_secs(1),
        ));
        for bad in [
            payload(0, None),
            payload(MAX_BATCH_IMAGES + 1, None),
            payload(2, Some(vec!["watercolor".into()])),
        ] {
            let err = generate_multiple_images(State(state.clone()), Json(bad))
                .await
                .err()
                .unwrap();
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_generated_image_is_served_and_searched_image_redirects() {
        let state = test_state(ImageService::new(
            Arc::new(PngProvider),
            Duration::from_secs(1),
        ));
        let mut request = payload("Mirror reflection angles");
        request.image_count = 1;
        let Json(result) = generate_experiment(State(state.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(result.images, 1);

        let response = get_image(State(state.clone()), Path((result.session_id, 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let err = get_image(State(state.clone()), Path((result.session_id, 9)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        // A searched image carries only its URL.
        let mut set = (*state.sessions.store().get(result.session_id).unwrap()).clone();
        let ordinal = set.push_image(ImageArtifact::searched("https://img.example/m.jpg"));
        state.sessions.store().insert(result.session_id, set);
        let response = get_image(State(state), Path((result.session_id, ordinal)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://img.example/m.jpg"
        );
    }
}
