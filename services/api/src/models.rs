//! API Models
//!
//! Request and response bodies for the REST API, documented with `utoipa`.
//! Core types are converted into these views at the handler boundary.

use chrono::{DateTime, Utc};
use labguide_core::{
    ErrorKind, GenerationRequest, SessionStatus,
    artifact::{ArtifactKind, ImageArtifact},
    image::{ImageOutcome, ImageStyle},
    session::{ErrorRecord, ProgressEvent, Session, Stage},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Intake body shared by `POST /api/sessions` and `POST /api/generate-experiment`.
#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct GenerateExperimentPayload {
    #[serde(alias = "experiment_description")]
    #[schema(example = "Investigate how the length of a pendulum affects its period")]
    pub description: String,
    pub student_name: Option<String>,
    #[schema(example = "Grade 9")]
    pub grade_level: Option<String>,
    /// Overrides the configured chat model for this run.
    #[serde(alias = "model_name")]
    pub model: Option<String>,
    #[serde(default)]
    pub image_count: u32,
}

impl GenerateExperimentPayload {
    pub fn into_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.description);
        request.student_name = self.student_name.filter(|s| !s.trim().is_empty());
        if let Some(grade) = self.grade_level.filter(|g| !g.trim().is_empty()) {
            request.grade_level = grade;
        }
        request.model = self.model.filter(|m| !m.trim().is_empty());
        request.image_count = self.image_count;
        request
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionCreated {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "pending")]
    pub status: SessionStatus,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub seq: u64,
    #[schema(value_type = String, example = "research")]
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<ProgressEvent> for ProgressView {
    fn from(event: ProgressEvent) -> Self {
        Self {
            seq: event.seq,
            stage: event.stage,
            message: event.message,
            filename: event.filename,
            preview: event.preview,
            timestamp: event.timestamp,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorView {
    #[schema(value_type = String, example = "budget_exceeded")]
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ErrorRecord> for ErrorView {
    fn from(record: ErrorRecord) -> Self {
        Self {
            kind: record.kind,
            message: record.message,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ArtifactView {
    pub name: String,
    #[schema(value_type = String, example = "text")]
    pub kind: ArtifactKind,
    pub size_bytes: usize,
    pub canonical: bool,
}

/// A full snapshot of one session.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionView {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "running")]
    pub status: SessionStatus,
    pub description: String,
    pub student_name: Option<String>,
    pub grade_level: String,
    pub image_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<ProgressView>,
    pub artifacts: Vec<ArtifactView>,
    pub error: Option<ErrorView>,
    pub partial_files: Vec<String>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            status: session.status,
            description: session.request.description,
            student_name: session.request.student_name,
            grade_level: session.request.grade_level,
            image_count: session.request.image_count,
            created_at: session.created_at,
            updated_at: session.updated_at,
            events: session.events.into_iter().map(ProgressView::from).collect(),
            artifacts: session
                .artifacts
                .into_values()
                .map(|handle| ArtifactView {
                    name: handle.name,
                    kind: handle.kind,
                    size_bytes: handle.size_bytes,
                    canonical: handle.canonical,
                })
                .collect(),
            error: session.error.map(ErrorView::from),
            partial_files: session.partial_files,
        }
    }
}

/// One row of `GET /api/sessions`.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionSummary {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "complete")]
    pub status: SessionStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            status: session.status,
            description: session.request.description.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// The outcome of a blocking `POST /api/generate-experiment`.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct GenerationResult {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "complete")]
    pub status: SessionStatus,
    pub message: String,
    pub files: Vec<String>,
    pub images: usize,
    pub error: Option<ErrorView>,
}

impl From<Session> for GenerationResult {
    fn from(session: Session) -> Self {
        let (files, images): (Vec<_>, Vec<_>) = session
            .artifacts
            .values()
            .partition(|handle| handle.kind == ArtifactKind::Text);
        let message = match (&session.status, &session.error) {
            (_, Some(error)) => format!("Generation failed: {}", error.message),
            (SessionStatus::Complete, None) => {
                format!("Generated {} documents", files.len())
            }
            (status, None) => format!("Session is {status}"),
        };
        Self {
            session_id: session.id,
            status: session.status,
            message,
            files: files.into_iter().map(|h| h.name.clone()).collect(),
            images: images.len(),
            error: session.error.map(ErrorView::from),
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct FilesResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    /// File name → markdown content.
    pub files: BTreeMap<String, String>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct FileContent {
    pub filename: String,
    pub content: String,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub ordinal: u32,
    pub file_name: String,
    /// `generated` or `searched`.
    pub source: String,
    pub mime_type: Option<String>,
    pub source_url: Option<String>,
    pub prompt: Option<String>,
    pub style: Option<String>,
    pub has_bytes: bool,
}

impl From<&ImageArtifact> for ImageInfo {
    fn from(image: &ImageArtifact) -> Self {
        Self {
            ordinal: image.ordinal,
            file_name: image.file_name(),
            source: image.source.as_str().to_string(),
            mime_type: image.mime_type.clone(),
            source_url: image.source_url.clone(),
            prompt: image.prompt.clone(),
            style: image.style.map(|s| s.as_str().to_string()),
            has_bytes: image.has_bytes(),
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ImagesResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub images: Vec<ImageInfo>,
}

#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct ImageGenerationPayload {
    #[schema(example = "Simple pendulum")]
    pub experiment_topic: String,
    #[schema(example = "scientific")]
    pub style: Option<String>,
    pub custom_prompt: Option<String>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ImageGenerationResponse {
    pub success: bool,
    pub image_url: Option<String>,
    pub local_path: Option<String>,
    pub message: String,
    pub experiment_topic: String,
    pub style: String,
}

impl From<ImageOutcome> for ImageGenerationResponse {
    fn from(outcome: ImageOutcome) -> Self {
        let success = outcome.is_success();
        let message = if success {
            format!("Generated {} image", outcome.style.as_str())
        } else {
            outcome
                .error
                .unwrap_or_else(|| "Image generation failed".to_string())
        };
        Self {
            success,
            image_url: outcome.url,
            local_path: outcome.local_path.map(|p| p.display().to_string()),
            message,
            experiment_topic: outcome.topic,
            style: outcome.style.as_str().to_string(),
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ExperimentExample {
    #[schema(value_type = String)]
    pub title: &'static str,
    #[schema(value_type = String)]
    pub description: &'static str,
    #[schema(value_type = String)]
    pub category: &'static str,
    #[schema(value_type = String)]
    pub difficulty: &'static str,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ExamplesResponse {
    pub examples: Vec<ExperimentExample>,
}

pub const EXPERIMENT_EXAMPLES: [ExperimentExample; 8] = [
    ExperimentExample {
        title: "Simple Pendulum Period",
        description: "Investigate how the length of a pendulum affects its period of oscillation",
        category: "Mechanics",
        difficulty: "Beginner",
    },
    ExperimentExample {
        title: "Projectile Motion",
        description: "Study the trajectory of projectiles launched at different angles",
        category: "Mechanics",
        difficulty: "Intermediate",
    },
    ExperimentExample {
        title: "Friction on Different Surfaces",
        description: "Compare the coefficient of friction for various surface materials",
        category: "Mechanics",
        difficulty: "Beginner",
    },
    ExperimentExample {
        title: "Ohm's Law Verification",
        description: "Verify the relationship between voltage, current, and resistance",
        category: "Electricity",
        difficulty: "Intermediate",
    },
    ExperimentExample {
        title: "Heat Transfer and Insulation",
        description: "Test the insulating properties of different materials",
        category: "Thermal Physics",
        difficulty: "Beginner",
    },
    ExperimentExample {
        title: "Sound Frequency and Pitch",
        description: "Explore the relationship between frequency and perceived pitch",
        category: "Waves",
        difficulty: "Intermediate",
    },
    ExperimentExample {
        title: "Mirror Reflection Angles",
        description: "Verify the law of reflection using plane mirrors",
        category: "Optics",
        difficulty: "Beginner",
    },
    ExperimentExample {
        title: "Lens Focal Length",
        description: "Determine the focal length of convex and concave lenses",
        category: "Optics",
        difficulty: "Intermediate",
    },
];

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct HealthResponse {
    #[schema(value_type = String)]
    pub status: &'static str,
    #[schema(value_type = String)]
    pub service: &'static str,
    #[schema(value_type = String)]
    pub message: &'static str,
    /// Chat model used when a request does not name one.
    pub model: String,
    pub sessions: usize,
    pub image_generation: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

/// Parses an optional style name, defaulting to `scientific`.
/// Largest batch accepted by the multiple-image endpoint.
pub const MAX_BATCH_IMAGES: u32 = 10;

fn default_batch_count() -> u32 {
    3
}

#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct MultipleImagesPayload {
    #[schema(example = "Simple pendulum")]
    pub experiment_topic: String,
    #[serde(default = "default_batch_count")]
    #[schema(example = 3, minimum = 1, maximum = 10)]
    pub count: u32,
    /// Styles to cycle through; all three when omitted.
    pub styles: Option<Vec<String>>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct MultipleImagesResponse {
    pub success: bool,
    pub experiment_topic: String,
    pub generated_count: usize,
    pub total_requested: u32,
    pub images: Vec<ImageGenerationResponse>,
}

/// Parses every requested style, or falls back to the full rotation.
pub fn parse_styles(styles: Option<&[String]>) -> Result<Vec<ImageStyle>, String> {
    match styles {
        Some(names) if !names.is_empty() => names.iter().map(|n| n.parse::<ImageStyle>()).collect(),
        _ => Ok(ImageStyle::ALL.to_vec()),
    }
}

pub fn parse_style(style: Option<&str>) -> Result<ImageStyle, String> {
    match style.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => name.parse::<ImageStyle>(),
        None => Ok(ImageStyle::Scientific),
    }
}
