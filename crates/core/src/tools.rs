//! Tools available to the reasoning engine.
//!
//! [`Toolbox`] wraps the search and image adapters with cancellation checks and call
//! accounting. [`LabToolService`] exposes the toolbox and a per-run virtual file system to
//! a language model as MCP tools.

use crate::engine::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::image::{ImageOutcome, ImageService, ImageStyle};
use crate::search::{SearchChain, SearchOutcome};
use parking_lot::Mutex;
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;

const MAX_SEARCHED_IMAGES: usize = 5;

/// Search and image adapters for one generation run.
pub struct Toolbox {
    search: Arc<SearchChain>,
    images: Arc<ImageService>,
    cancel: CancellationToken,
    calls: AtomicUsize,
    searched_images: Mutex<Vec<String>>,
    generated_images: Mutex<Vec<ImageOutcome>>,
}

impl Toolbox {
    /// Builds a toolbox for one run. Once `cancel` trips, every tool call fails with
    /// `Cancelled` before reaching a provider.
    pub fn new(
        search: Arc<SearchChain>,
        images: Arc<ImageService>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            search,
            images,
            cancel,
            calls: AtomicUsize::new(0),
            searched_images: Mutex::new(Vec::new()),
            generated_images: Mutex::new(Vec::new()),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs a web search through the fallback chain.
    ///
    /// Image URLs found along the way are remembered, up to five per run, so they can be
    /// attached to the session as reference images.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<SearchOutcome> {
        self.ensure_live()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.search.search(query, max_results).await;
        let mut seen = self.searched_images.lock();
        for url in &outcome.image_urls {
            if seen.len() < MAX_SEARCHED_IMAGES && !seen.contains(url) {
                seen.push(url.clone());
            }
        }
        Ok(outcome)
    }

    /// Generates one image. Successful images are kept for the session's artifacts.
    pub async fn generate_image(
        &self,
        topic: &str,
        style: ImageStyle,
        prompt: Option<&str>,
    ) -> Result<ImageOutcome> {
        self.ensure_live()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.images.generate(topic, style, prompt).await;
        if outcome.is_success() {
            self.generated_images.lock().push(outcome.clone());
        }
        Ok(outcome)
    }

    /// Number of provider calls issued so far.
    pub fn provider_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Drains the image URLs collected from searches, in discovery order.
    pub fn take_searched_images(&self) -> Vec<String> {
        std::mem::take(&mut *self.searched_images.lock())
    }

    /// Drains the successfully generated images, in generation order.
    pub fn take_generated_images(&self) -> Vec<ImageOutcome> {
        std::mem::take(&mut *self.generated_images.lock())
    }
}

/// Scratch directory for engine notes; never part of the output.
pub const NOTES_DIR: &str = "notes/";

/// Reserved for image artifacts in exports.
pub const IMAGES_DIR: &str = "images/";

/// In-memory files written by the engine during one run.
#[derive(Clone, Default)]
pub struct VirtualFs {
    files: Arc<Mutex<BTreeMap<String, String>>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalises a model-supplied path: leading `/` and `./` are dropped, `..` is refused.
    pub fn normalize(path: &str) -> std::result::Result<String, String> {
        let trimmed = path.trim().trim_start_matches("./").trim_start_matches('/');
        if trimmed.is_empty() {
            return Err("File path must not be empty".to_string());
        }
        if trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(format!("Invalid file path '{path}'"));
        }
        Ok(trimmed.to_string())
    }

    /// Creates or replaces a file. Paths under `images/` are refused.
    pub fn write(&self, path: &str, content: &str) -> std::result::Result<String, String> {
        let path = Self::normalize(path)?;
        if path.starts_with(IMAGES_DIR) {
            return Err(format!(
                "'{IMAGES_DIR}' is reserved for images; use generate_image instead of writing '{path}'"
            ));
        }
        self.files.lock().insert(path.clone(), content.to_string());
        Ok(path)
    }

    pub fn read(&self, path: &str) -> std::result::Result<String, String> {
        let path = Self::normalize(path)?;
        self.files
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| format!("File '{path}' not found"))
    }

    /// Replaces exactly one occurrence of `old` with `new`.
    pub fn edit(&self, path: &str, old: &str, new: &str) -> std::result::Result<String, String> {
        let path = Self::normalize(path)?;
        let mut files = self.files.lock();
        let content = files
            .get_mut(&path)
            .ok_or_else(|| format!("File '{path}' not found"))?;
        match content.matches(old).count() {
            0 => Err(format!("Text to replace was not found in '{path}'")),
            1 => {
                *content = content.replacen(old, new, 1);
                Ok(path)
            }
            n => Err(format!(
                "Text to replace occurs {n} times in '{path}'; include more context"
            )),
        }
    }

    /// Every file with its size in bytes, notes included.
    pub fn list(&self) -> Vec<(String, usize)> {
        self.files
            .lock()
            .iter()
            .map(|(name, content)| (name.clone(), content.len()))
            .collect()
    }

    /// Every file outside the notes directory.
    pub fn output_files(&self) -> BTreeMap<String, String> {
        self.files
            .lock()
            .iter()
            .filter(|(name, _)| !name.starts_with(NOTES_DIR))
            .map(|(name, content)| (name.clone(), content.clone()))
            .collect()
    }
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct SearchArgs {
    /// What to look up on the web.
    pub query: String,
    #[schemars(description = "Maximum number of results (default 5)")]
    pub max_results: Option<u32>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct WriteFileArgs {
    #[schemars(description = "File name, e.g. 'methodology.md'")]
    pub file_path: String,
    /// Full markdown content; replaces any existing file.
    pub content: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ReadFileArgs {
    pub file_path: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct EditFileArgs {
    pub file_path: String,
    #[schemars(description = "Exact text to replace; must occur exactly once")]
    pub old_string: String,
    pub new_string: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct GenerateImageArgs {
    /// What the image should show.
    pub topic: String,
    #[schemars(description = "One of 'scientific', 'educational' or 'diagram'")]
    pub style: Option<String>,
}

/// MCP server giving a language model web search, image generation and a scratch file system.
pub struct LabToolService {
    ctx: EngineContext,
    fs: VirtualFs,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for LabToolService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl LabToolService {
    pub fn new(ctx: EngineContext, fs: VirtualFs) -> Self {
        Self {
            ctx,
            fs,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Search the web for physics concepts, experiment procedures, safety information and educational resources."
    )]
    pub async fn internet_search(&self, args: Parameters<SearchArgs>) -> Result<String, String> {
        info!(query = %args.0.query, "Executing tool 'internet_search'");
        let max_results = args.0.max_results.unwrap_or(5).clamp(1, 10) as usize;
        self.ctx
            .tools()
            .search(&args.0.query, max_results)
            .await
            .map(|outcome| outcome.to_tool_text())
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Generate an illustrative image for the experiment.")]
    pub async fn generate_image(
        &self,
        args: Parameters<GenerateImageArgs>,
    ) -> Result<String, String> {
        info!(topic = %args.0.topic, "Executing tool 'generate_image'");
        let style = match args.0.style.as_deref() {
            Some(s) => s.parse::<ImageStyle>()?,
            None => ImageStyle::default(),
        };
        let outcome = self
            .ctx
            .tools()
            .generate_image(&args.0.topic, style, None)
            .await
            .map_err(|e| e.to_string())?;
        if outcome.is_success() {
            Ok(format!(
                "OK. Generated a {} image for '{}'. It will be attached to the guide.",
                style.as_str(),
                outcome.topic
            ))
        } else {
            Ok(format!(
                "Image generation failed: {}. Continue without it.",
                outcome.error.unwrap_or_default()
            ))
        }
    }

    #[tool(description = "Write a file, replacing it entirely if it already exists.")]
    pub async fn write_file(&self, args: Parameters<WriteFileArgs>) -> Result<String, String> {
        let path = self.fs.write(&args.0.file_path, &args.0.content)?;
        info!(file = %path, bytes = args.0.content.len(), "Executing tool 'write_file'");
        if !path.starts_with(NOTES_DIR) {
            self.ctx.file_written(&path, &args.0.content);
        }
        Ok(format!("OK. Wrote '{path}'."))
    }

    #[tool(description = "Read a previously written file.")]
    pub async fn read_file(&self, args: Parameters<ReadFileArgs>) -> Result<String, String> {
        self.fs.read(&args.0.file_path)
    }

    #[tool(description = "List all files written so far with their sizes.")]
    pub async fn ls(&self) -> Result<String, String> {
        let files = self.fs.list();
        if files.is_empty() {
            return Ok("No files written yet.".to_string());
        }
        Ok(files
            .into_iter()
            .map(|(name, size)| format!("{name} ({size} bytes)"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    #[tool(description = "Replace one exact occurrence of text inside an existing file.")]
    pub async fn edit_file(&self, args: Parameters<EditFileArgs>) -> Result<String, String> {
        let path = self
            .fs
            .edit(&args.0.file_path, &args.0.old_string, &args.0.new_string)?;
        info!(file = %path, "Executing tool 'edit_file'");
        if !path.starts_with(NOTES_DIR) {
            if let Ok(content) = self.fs.read(&path) {
                self.ctx.file_written(&path, &content);
            }
        }
        Ok(format!("OK. Edited '{path}'."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::engine::StepMeter;
    use crate::search::{MockSearchProvider, ProviderResults, SearchHit};
    use crate::session::{GenerationRequest, SessionManager, SessionSettings, Stage};
    use std::time::Duration;

    fn search_chain() -> Arc<SearchChain> {
        let mut provider = MockSearchProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_search().returning(|query, _| {
            Ok(ProviderResults {
                hits: vec![SearchHit {
                    title: format!("About {query}"),
                    url: "https://example.org".into(),
                    snippet: "snippet".into(),
                }],
                image_urls: vec!["https://img.example/a.jpg".into()],
            })
        });
        Arc::new(SearchChain::new(
            vec![Arc::new(provider)],
            Duration::from_secs(1),
        ))
    }

    fn service() -> (LabToolService, Arc<SessionManager>, uuid::Uuid) {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(ArtifactStore::new()),
            SessionSettings::default(),
        ));
        let id = sessions
            .create(GenerationRequest::new("pendulum"))
            .unwrap();
        sessions.begin(id).unwrap();
        let cancel = sessions.cancellation_token(id).unwrap();
        let toolbox = Arc::new(Toolbox::new(
            search_chain(),
            Arc::new(ImageService::disabled()),
            cancel.clone(),
        ));
        let ctx = EngineContext::new(
            id,
            sessions.clone(),
            toolbox,
            Arc::new(StepMeter::new(10)),
            cancel,
        );
        (LabToolService::new(ctx, VirtualFs::new()), sessions, id)
    }

    #[test]
    fn test_normalize_paths() {
        assert_eq!(VirtualFs::normalize("/methodology.md").unwrap(), "methodology.md");
        assert_eq!(VirtualFs::normalize("./notes/a.md").unwrap(), "notes/a.md");
        assert!(VirtualFs::normalize("../etc/passwd").is_err());
        assert!(VirtualFs::normalize("a//b.md").is_err());
        assert!(VirtualFs::normalize("  ").is_err());
    }

    #[test]
    fn test_write_refuses_image_directory() {
        let fs = VirtualFs::new();
        assert!(fs.write("images/sources.txt", "list").is_err());
        assert!(fs.write("./images/image_001_generated.png", "x").is_err());
        assert!(fs.list().is_empty());
        fs.write("images_notes.md", "fine").unwrap();
    }

    #[test]
    fn test_edit_requires_unique_match() {
        let fs = VirtualFs::new();
        fs.write("a.md", "one two two").unwrap();
        assert!(fs.edit("a.md", "three", "3").is_err());
        assert!(fs.edit("a.md", "two", "2").is_err());
        fs.edit("a.md", "one", "1").unwrap();
        assert_eq!(fs.read("a.md").unwrap(), "1 two two");
        assert!(fs.edit("missing.md", "a", "b").is_err());
    }

    #[test]
    fn test_output_files_skip_notes() {
        let fs = VirtualFs::new();
        fs.write("notes/research.md", "sources").unwrap();
        fs.write("methodology.md", "steps").unwrap();
        let output = fs.output_files();
        assert_eq!(output.len(), 1);
        assert!(output.contains_key("methodology.md"));
        assert_eq!(fs.list().len(), 2);
    }

    #[tokio::test]
    async fn test_write_file_emits_file_update() {
        let (service, sessions, id) = service();
        service.ctx.stage(Stage::Draft, "Drafting");
        service
            .write_file(Parameters(WriteFileArgs {
                file_path: "/methodology.md".into(),
                content: "## Materials".into(),
            }))
            .await
            .unwrap();
        service
            .write_file(Parameters(WriteFileArgs {
                file_path: "notes/research.md".into(),
                content: "scratch".into(),
            }))
            .await
            .unwrap();

        let events = sessions.get(id).unwrap().events;
        let files: Vec<_> = events.iter().filter_map(|e| e.filename.clone()).collect();
        assert_eq!(files, vec!["methodology.md"]);
        assert_eq!(events.last().unwrap().stage, Stage::Draft);

        let listing = service.ls().await.unwrap();
        assert!(listing.contains("methodology.md (12 bytes)"));
    }

    #[tokio::test]
    async fn test_search_tool_records_image_urls_and_counts_calls() {
        let (service, _, _) = service();
        let text = service
            .internet_search(Parameters(SearchArgs {
                query: "pendulum period".into(),
                max_results: None,
            }))
            .await
            .unwrap();
        assert!(text.contains("About pendulum period"));
        let toolbox = service.ctx.tools();
        assert_eq!(toolbox.provider_calls(), 1);
        assert_eq!(toolbox.take_searched_images(), vec!["https://img.example/a.jpg"]);
        assert!(toolbox.take_searched_images().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_toolbox_makes_no_provider_calls() {
        let (service, sessions, id) = service();
        sessions.cancel(id).unwrap();
        let err = service
            .internet_search(Parameters(SearchArgs {
                query: "anything".into(),
                max_results: Some(3),
            }))
            .await
            .unwrap_err();
        assert_eq!(err, "Session was cancelled");
        assert_eq!(service.ctx.tools().provider_calls(), 0);
    }

    #[tokio::test]
    async fn test_image_tool_reports_unconfigured_provider() {
        let (service, _, _) = service();
        let text = service
            .generate_image(Parameters(GenerateImageArgs {
                topic: "pendulum setup".into(),
                style: Some("diagram".into()),
            }))
            .await
            .unwrap();
        assert!(text.starts_with("Image generation failed"));
        assert!(service.ctx.tools().take_generated_images().is_empty());

        let err = service
            .generate_image(Parameters(GenerateImageArgs {
                topic: "pendulum setup".into(),
                style: Some("watercolor".into()),
            }))
            .await
            .unwrap_err();
        assert!(err.contains("unknown image style"));
    }
}
