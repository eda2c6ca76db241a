//! Main Entrypoint for the LabGuide API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the stage prompts.
//! 3. Initializing shared services (LLM client, search chain, image service, sessions).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use labguide_api::{
    config::{Config, Provider},
    router::create_router,
    state::AppState,
};
use labguide_core::{
    artifact::ArtifactStore,
    image::{ImageService, ReplicateImageProvider},
    llm_client::{GEMINI_API_BASE, LLMClient, OPENAI_API_BASE, OpenAICompatibleClient},
    llm_engine::{LlmEngine, PromptSet},
    orchestrator::{Orchestrator, OrchestratorSettings},
    search::{DuckDuckGoProvider, SearchChain, SearchProvider, SerpApiProvider, TavilyProvider},
    session::{SessionManager, SessionSettings},
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)
        .with_context(|| format!("Cannot read prompts directory {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

/// Builds the search fallback chain from whichever providers have credentials.
fn search_chain(config: &Config) -> SearchChain {
    let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
    if let Some(key) = &config.serpapi_api_key {
        providers.push(Arc::new(SerpApiProvider::new(key.clone())));
    }
    if let Some(key) = &config.tavily_api_key {
        providers.push(Arc::new(TavilyProvider::new(key.clone())));
    }
    if config.duckduckgo_enabled {
        providers.push(Arc::new(DuckDuckGoProvider::new()));
    }
    let chain = SearchChain::new(providers, config.provider_timeout);
    if chain.provider_names().is_empty() {
        warn!("No search provider configured; research will run without web results.");
    } else {
        info!(providers = ?chain.provider_names(), "Search chain ready.");
    }
    chain
}

fn image_service(config: &Config) -> ImageService {
    let Some(token) = &config.replicate_api_token else {
        warn!("REPLICATE_API_TOKEN not set; image generation is disabled.");
        return ImageService::disabled();
    };
    let provider = ReplicateImageProvider::new(token.clone(), config.replicate_model.clone());
    // Image models are slower than text search.
    let service = ImageService::new(Arc::new(provider), config.provider_timeout * 4);
    match &config.image_dir {
        Some(dir) => service.with_output_dir(dir),
        None => service,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Load Prompts ---
    let prompts = load_prompts(&config.prompts_path)?;
    let prompts = Arc::new(PromptSet::from_map(&prompts)?);

    // --- 4. Initialize Shared Services ---
    let (api_key, api_base) = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            (config.openai_api_key.as_deref(), OPENAI_API_BASE)
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            (config.gemini_api_key.as_deref(), GEMINI_API_BASE)
        }
    };
    let api_key = api_key.context("LLM API key missing for the selected provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_base);
    let llm_client: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));

    let images = Arc::new(image_service(&config));
    let ttl = chrono::Duration::from_std(config.session_ttl)
        .context("SESSION_TTL_SECS is out of range")?;
    let sessions = Arc::new(SessionManager::new(
        Arc::new(ArtifactStore::new()),
        SessionSettings {
            max_description_len: config.max_description_len,
            ttl: Some(ttl),
        },
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        sessions.clone(),
        Arc::new(LlmEngine::new(llm_client, prompts)),
        Arc::new(search_chain(&config)),
        images.clone(),
        OrchestratorSettings {
            step_budget: config.step_budget,
            generation_timeout: config.generation_timeout,
        },
    ));

    // Expired sessions are evicted at a fraction of their lifetime.
    let purge_every = (config.session_ttl / 10).max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            sessions.purge_expired();
        }
    });

    let static_dir = config.static_dir.clone();
    let app_state = Arc::new(AppState::new(orchestrator, images, config.clone()));

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state, &static_dir).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        step_budget = config.step_budget,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
