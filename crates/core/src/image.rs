//! Image Provider Adapter
//!
//! Generates illustrative images for an experiment through a hosted image model.
//! Every failure (missing credential, transport error, timeout) is converted into a
//! structured [`ImageOutcome`] so that one bad image never takes a session down.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Visual style of a generated image. Only affects how the prompt is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStyle {
    #[default]
    Scientific,
    Educational,
    Diagram,
}

impl ImageStyle {
    pub const ALL: [ImageStyle; 3] = [
        ImageStyle::Scientific,
        ImageStyle::Educational,
        ImageStyle::Diagram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStyle::Scientific => "scientific",
            ImageStyle::Educational => "educational",
            ImageStyle::Diagram => "diagram",
        }
    }

    /// Builds the model prompt for an experiment topic in this style.
    pub fn compose_prompt(self, topic: &str) -> String {
        let base = format!("Generate an image for the science experiment: {topic}");
        match self {
            ImageStyle::Scientific => format!(
                "{base}. Scientific illustration style, clean and professional, showing equipment, setup, or results. High quality, detailed, educational."
            ),
            ImageStyle::Educational => format!(
                "{base}. Educational diagram style, clear and simple, suitable for Grade 9 students. Colorful, engaging, easy to understand."
            ),
            ImageStyle::Diagram => format!(
                "{base}. Technical diagram style, showing step-by-step process, labeled components, scientific accuracy. Black and white or minimal colors."
            ),
        }
    }
}

impl FromStr for ImageStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scientific" => Ok(ImageStyle::Scientific),
            "educational" => Ok(ImageStyle::Educational),
            "diagram" => Ok(ImageStyle::Diagram),
            other => Err(format!("unknown image style '{other}'")),
        }
    }
}

/// Raw output of an image provider.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Where the provider hosts the image, if it exposes a URL.
    pub url: Option<String>,
}

/// A hosted image-generation backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, prompt: &str) -> Result<GeneratedImage>;
}

/// Image generation through the Replicate predictions API.
pub struct ReplicateImageProvider {
    client: reqwest::Client,
    api_token: String,
    model: String,
    poll_interval: Duration,
}

impl ReplicateImageProvider {
    /// Used when `REPLICATE_MODEL` is not set.
    pub const DEFAULT_MODEL: &'static str = "google/nano-banana";

    pub fn new(api_token: String, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_token,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            poll_interval: Duration::from_secs(2),
        }
    }

    async fn wait_for_prediction(&self, mut prediction: Prediction) -> Result<Prediction> {
        loop {
            match prediction.status.as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => {
                    return Err(anyhow!(
                        "prediction {}: {}",
                        prediction.status,
                        prediction.error.unwrap_or_else(|| "no error detail".into())
                    ));
                }
                _ => {}
            }
            let poll_url = prediction
                .urls
                .as_ref()
                .and_then(|u| u.get.clone())
                .context("Prediction is pending but has no polling URL")?;
            tokio::time::sleep(self.poll_interval).await;
            prediction = self
                .client
                .get(&poll_url)
                .bearer_auth(&self.api_token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
        }
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

/// Extracts the first image URL from a prediction's `output`, which is either a
/// single URL string or a list of them depending on the model.
fn prediction_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items.iter().find_map(prediction_output_url),
        _ => None,
    }
}

#[async_trait]
impl ImageProvider for ReplicateImageProvider {
    fn name(&self) -> &'static str {
        "replicate"
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedImage> {
        let url = format!(
            "https://api.replicate.com/v1/models/{}/predictions",
            self.model
        );
        let body = serde_json::json!({
            "input": {
                "prompt": prompt,
                "aspect_ratio": "16:9",
                "output_format": "jpg",
            }
        });
        let prediction: Prediction = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .context("Failed to reach Replicate")?
            .error_for_status()?
            .json()
            .await
            .context("Malformed Replicate prediction")?;

        let prediction = self.wait_for_prediction(prediction).await?;
        let image_url = prediction
            .output
            .as_ref()
            .and_then(prediction_output_url)
            .context("Prediction succeeded without an output URL")?;

        let response = self
            .client
            .get(&image_url)
            .send()
            .await?
            .error_for_status()?;
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?.to_vec();

        Ok(GeneratedImage {
            bytes,
            mime_type,
            url: Some(image_url),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Success,
    Failure,
}

/// The result of a single image request. Never an error: failures carry `error`.
#[derive(Debug, Clone, Serialize)]
pub struct ImageOutcome {
    pub status: ImageStatus,
    pub topic: String,
    pub style: ImageStyle,
    pub prompt: String,
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub local_path: Option<PathBuf>,
    pub error: Option<String>,
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
}

impl ImageOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ImageStatus::Success
    }

    fn failure(topic: &str, style: ImageStyle, prompt: String, error: String) -> Self {
        Self {
            status: ImageStatus::Failure,
            topic: topic.to_string(),
            style,
            prompt,
            url: None,
            mime_type: None,
            local_path: None,
            error: Some(error),
            bytes: None,
        }
    }
}

/// Wraps an optional [`ImageProvider`] with a timeout and optional on-disk copies.
pub struct ImageService {
    provider: Option<Arc<dyn ImageProvider>>,
    timeout: Duration,
    output_dir: Option<PathBuf>,
}

impl ImageService {
    pub fn new(provider: Arc<dyn ImageProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
            output_dir: None,
        }
    }

    /// A service with no provider configured; every request yields a failure outcome.
    pub fn disabled() -> Self {
        Self {
            provider: None,
            timeout: Duration::from_secs(30),
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn generate(
        &self,
        topic: &str,
        style: ImageStyle,
        prompt: Option<&str>,
    ) -> ImageOutcome {
        let prompt = prompt
            .map(str::to_string)
            .unwrap_or_else(|| style.compose_prompt(topic));

        let Some(provider) = &self.provider else {
            return ImageOutcome::failure(
                topic,
                style,
                prompt,
                "Image generation is not configured".to_string(),
            );
        };

        let generated =
            match tokio::time::timeout(self.timeout, provider.generate(&prompt)).await {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "Image generation failed");
                    return ImageOutcome::failure(topic, style, prompt, format!("{e:#}"));
                }
                Err(_) => {
                    warn!(provider = provider.name(), "Image generation timed out");
                    return ImageOutcome::failure(
                        topic,
                        style,
                        prompt,
                        format!("timed out after {}s", self.timeout.as_secs()),
                    );
                }
            };

        let local_path = match &self.output_dir {
            Some(dir) => match save_image(dir, topic, &generated).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Could not save generated image to disk");
                    None
                }
            },
            None => None,
        };

        info!(provider = provider.name(), style = style.as_str(), "Image generated");
        ImageOutcome {
            status: ImageStatus::Success,
            topic: topic.to_string(),
            style,
            prompt,
            url: generated.url,
            mime_type: Some(generated.mime_type),
            local_path,
            error: None,
            bytes: Some(generated.bytes),
        }
    }

    /// Generates `count` images one after another, cycling through `styles`.
    pub async fn generate_many(
        &self,
        topic: &str,
        count: usize,
        styles: &[ImageStyle],
    ) -> Vec<ImageOutcome> {
        let styles = if styles.is_empty() {
            &ImageStyle::ALL[..]
        } else {
            styles
        };
        let mut outcomes = Vec::with_capacity(count);
        for i in 0..count {
            let style = styles[i % styles.len()];
            let numbered = format!("{topic} - Image {}", i + 1);
            outcomes.push(self.generate(&numbered, style, None).await);
        }
        outcomes
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Reduces a topic to a filesystem-safe stem of at most 50 characters.
fn safe_stem(topic: &str) -> String {
    let cleaned: String = topic
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let stem: String = cleaned.trim().replace(' ', "_").chars().take(50).collect();
    if stem.is_empty() {
        "experiment".to_string()
    } else {
        stem
    }
}

async fn save_image(dir: &Path, topic: &str, image: &GeneratedImage) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let file_name = format!(
        "{}_{}.{}",
        safe_stem(topic),
        &suffix[..8],
        extension_for_mime(&image.mime_type)
    );
    let path = dir.join(file_name);
    tokio::fs::write(&path, &image.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
