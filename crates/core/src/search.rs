//! Search Provider Adapter
//!
//! Web search with a fixed-priority fallback chain. Providers are tried in order; an
//! error or a timeout moves on to the next one. When nothing answers, the caller gets an
//! empty [`SearchOutcome`] carrying a diagnostic instead of an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One web result, normalised across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// What a single provider returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResults {
    pub hits: Vec<SearchHit>,
    pub image_urls: Vec<String>,
}

/// A web search backend. Errors are reported to the chain, which falls through to the
/// next provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: usize) -> Result<ProviderResults>;
}

/// The answer to one search. An empty outcome carries a diagnostic instead of an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    /// The provider that answered; `None` when every provider failed.
    pub provider: Option<String>,
    pub hits: Vec<SearchHit>,
    pub image_urls: Vec<String>,
    pub diagnostic: Option<String>,
}

impl SearchOutcome {
    fn empty(query: &str, diagnostic: String) -> Self {
        Self {
            query: query.to_string(),
            provider: None,
            hits: Vec::new(),
            image_urls: Vec::new(),
            diagnostic: Some(diagnostic),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Renders the outcome as plain text for a language model to read.
    pub fn to_tool_text(&self) -> String {
        if let Some(diagnostic) = &self.diagnostic {
            return diagnostic.clone();
        }
        if self.hits.is_empty() {
            return format!(
                "No results found for '{}'. Continue with general physics knowledge.",
                self.query
            );
        }
        let mut out = format!(
            "Search results for '{}' (via {}):\n",
            self.query,
            self.provider.as_deref().unwrap_or("unknown")
        );
        for (i, hit) in self.hits.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. {}\n   {}\n   {}\n",
                i + 1,
                hit.title,
                hit.url,
                hit.snippet
            ));
        }
        if !self.image_urls.is_empty() {
            out.push_str("\nRelated images:\n");
            for url in &self.image_urls {
                out.push_str(&format!("- {url}\n"));
            }
        }
        out
    }
}

/// Providers in priority order, each call bounded by `timeout`.
pub struct SearchChain {
    providers: Vec<Arc<dyn SearchProvider>>,
    timeout: Duration,
}

impl SearchChain {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Asks each provider in turn and returns the first successful answer.
    ///
    /// Errors and timeouts fall through to the next provider. When nothing answers, the
    /// outcome is empty and its diagnostic lists why each provider was skipped.
    pub async fn search(&self, query: &str, max_results: usize) -> SearchOutcome {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match tokio::time::timeout(self.timeout, provider.search(query, max_results)).await
            {
                Ok(Ok(mut results)) => {
                    results.hits.truncate(max_results);
                    info!(
                        provider = provider.name(),
                        hits = results.hits.len(),
                        "Search answered"
                    );
                    return SearchOutcome {
                        query: query.to_string(),
                        provider: Some(provider.name().to_string()),
                        hits: results.hits,
                        image_urls: results.image_urls,
                        diagnostic: None,
                    };
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "Search provider failed");
                    failures.push(format!("{}: {e}", provider.name()));
                }
                Err(_) => {
                    warn!(provider = provider.name(), "Search provider timed out");
                    failures.push(format!("{}: timed out", provider.name()));
                }
            }
        }

        let diagnostic = if failures.is_empty() {
            "Web search is not configured. Proceed with general physics knowledge.".to_string()
        } else {
            format!(
                "Web search is unavailable ({}). Proceed with general physics knowledge.",
                failures.join("; ")
            )
        };
        debug!(query, "Search degraded to empty outcome");
        SearchOutcome::empty(query, diagnostic)
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// SerpAPI Google results.
pub struct SerpApiProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SerpApiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

fn parse_serpapi(body: &Value, max_results: usize) -> Result<ProviderResults> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        anyhow::bail!("SerpAPI error: {error}");
    }
    let hits = body
        .get("organic_results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .take(max_results)
                .map(|r| SearchHit {
                    title: str_field(r, "title").to_string(),
                    url: str_field(r, "link").to_string(),
                    snippet: str_field(r, "snippet").to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let image_urls = body
        .get("inline_images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|i| i.get("original").or_else(|| i.get("thumbnail")))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .take(3)
                .collect()
        })
        .unwrap_or_default();
    Ok(ProviderResults { hits, image_urls })
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    fn name(&self) -> &'static str {
        "serpapi"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<ProviderResults> {
        let num = max_results.to_string();
        let body: Value = self
            .client
            .get("https://serpapi.com/search.json")
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("num", num.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach SerpAPI")?
            .error_for_status()?
            .json()
            .await?;
        parse_serpapi(&body, max_results)
    }
}

/// Tavily search API.
pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
}

impl TavilyProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

fn parse_tavily(body: &Value, max_results: usize) -> ProviderResults {
    let hits = body
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .take(max_results)
                .map(|r| SearchHit {
                    title: str_field(r, "title").to_string(),
                    url: str_field(r, "url").to_string(),
                    snippet: str_field(r, "content").to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    // Tavily returns images either as bare URLs or as `{url, description}` objects.
    let image_urls = body
        .get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|i| i.as_str().or_else(|| i.get("url").and_then(Value::as_str)))
                .map(str::to_string)
                .take(3)
                .collect()
        })
        .unwrap_or_default();
    ProviderResults { hits, image_urls }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<ProviderResults> {
        let body: Value = self
            .client
            .post("https://api.tavily.com/search")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "query": query,
                "max_results": max_results,
                "include_images": true,
            }))
            .send()
            .await
            .context("Failed to reach Tavily")?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_tavily(&body, max_results))
    }
}

/// DuckDuckGo's keyless instant-answer API. Coverage is thin but it needs no credential.
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
}

impl DuckDuckGoProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DuckDuckGoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_related(topics: &[Value], hits: &mut Vec<SearchHit>, max_results: usize) {
    for topic in topics {
        if hits.len() >= max_results {
            return;
        }
        // Grouped topics nest their entries one level down.
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_related(nested, hits, max_results);
            continue;
        }
        let text = str_field(topic, "Text");
        let url = str_field(topic, "FirstURL");
        if text.is_empty() || url.is_empty() {
            continue;
        }
        let title = text.split(" - ").next().unwrap_or(text);
        hits.push(SearchHit {
            title: title.to_string(),
            url: url.to_string(),
            snippet: text.to_string(),
        });
    }
}

fn parse_duckduckgo(body: &Value, max_results: usize) -> ProviderResults {
    let mut hits = Vec::new();
    let abstract_text = str_field(body, "AbstractText");
    if !abstract_text.is_empty() && max_results > 0 {
        let heading = str_field(body, "Heading");
        hits.push(SearchHit {
            title: if heading.is_empty() {
                "Summary".to_string()
            } else {
                heading.to_string()
            },
            url: str_field(body, "AbstractURL").to_string(),
            snippet: abstract_text.to_string(),
        });
    }
    if let Some(related) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_related(related, &mut hits, max_results);
    }

    let image = str_field(body, "Image");
    let image_urls = if image.is_empty() {
        Vec::new()
    } else if image.starts_with('/') {
        vec![format!("https://duckduckgo.com{image}")]
    } else {
        vec![image.to_string()]
    };
    ProviderResults { hits, image_urls }
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<ProviderResults> {
        let body: Value = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .context("Failed to reach DuckDuckGo")?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_duckduckgo(&body, max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            url: format!("https://example.org/{title}"),
            snippet: "snippet".into(),
        }
    }

    fn failing(name: &'static str) -> Arc<dyn SearchProvider> {
        let mut provider = MockSearchProvider::new();
        provider.expect_name().return_const(name);
        provider
            .expect_search()
            .returning(|_, _| Err(anyhow!("503 Service Unavailable")));
        Arc::new(provider)
    }

    #[tokio::test]
    async fn test_all_providers_failing_yields_empty_outcome() {
        let chain = SearchChain::new(
            vec![failing("serpapi"), failing("tavily"), failing("duckduckgo")],
            Duration::from_secs(1),
        );
        let outcome = chain.search("pendulum period", 5).await;
        assert!(outcome.is_empty());
        assert!(outcome.provider.is_none());
        let diagnostic = outcome.diagnostic.unwrap();
        assert!(diagnostic.contains("general physics knowledge"));
        assert!(diagnostic.contains("tavily"));
    }

    #[tokio::test]
    async fn test_no_providers_yields_not_configured_diagnostic() {
        let chain = SearchChain::new(Vec::new(), Duration::from_secs(1));
        let outcome = chain.search("ohm's law", 5).await;
        assert!(outcome.diagnostic.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let mut second = MockSearchProvider::new();
        second.expect_name().return_const("tavily");
        second.expect_search().times(1).returning(|_, _| {
            Ok(ProviderResults {
                hits: vec![hit("a"), hit("b"), hit("c")],
                image_urls: vec!["https://img.example/1.jpg".into()],
            })
        });
        let chain = SearchChain::new(
            vec![failing("serpapi"), Arc::new(second)],
            Duration::from_secs(1),
        );

        let outcome = chain.search("lens focal length", 2).await;
        assert_eq!(outcome.provider.as_deref(), Some("tavily"));
        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.image_urls.len(), 1);
        assert!(outcome.diagnostic.is_none());
        assert!(outcome.to_tool_text().contains("1. a"));
    }

    #[tokio::test]
    async fn test_zero_hits_is_success_not_fallback() {
        let mut first = MockSearchProvider::new();
        first.expect_name().return_const("serpapi");
        first
            .expect_search()
            .returning(|_, _| Ok(ProviderResults::default()));
        let mut second = MockSearchProvider::new();
        second.expect_name().return_const("tavily");
        second.expect_search().never();

        let chain = SearchChain::new(
            vec![Arc::new(first), Arc::new(second)],
            Duration::from_secs(1),
        );
        let outcome = chain.search("obscure query", 5).await;
        assert_eq!(outcome.provider.as_deref(), Some("serpapi"));
        assert!(outcome.is_empty());
        assert!(outcome.to_tool_text().starts_with("No results found"));
    }

    struct SlowProvider;

    #[async_trait]
    impl SearchProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn search(&self, _query: &str, _max: usize) -> Result<ProviderResults> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ProviderResults::default())
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let chain = SearchChain::new(vec![Arc::new(SlowProvider)], Duration::from_millis(20));
        let outcome = chain.search("heat capacity", 5).await;
        assert!(outcome.provider.is_none());
        assert!(outcome.diagnostic.unwrap().contains("slow: timed out"));
    }

    #[test]
    fn test_parse_serpapi() {
        let body = json!({
            "organic_results": [
                {"title": "Simple pendulum", "link": "https://a.example", "snippet": "T = 2π√(L/g)"},
                {"title": "Second", "link": "https://b.example"}
            ],
            "inline_images": [{"original": "https://img.example/p.jpg"}]
        });
        let results = parse_serpapi(&body, 5).unwrap();
        assert_eq!(results.hits.len(), 2);
        assert_eq!(results.hits[0].url, "https://a.example");
        assert_eq!(results.hits[1].snippet, "");
        assert_eq!(results.image_urls, vec!["https://img.example/p.jpg"]);

        assert!(parse_serpapi(&json!({"error": "Invalid API key"}), 5).is_err());
    }

    #[test]
    fn test_parse_tavily() {
        let body = json!({
            "results": [
                {"title": "Hooke's law", "url": "https://t.example", "content": "F = -kx"}
            ],
            "images": ["https://img.example/a.png", {"url": "https://img.example/b.png"}]
        });
        let results = parse_tavily(&body, 5);
        assert_eq!(results.hits[0].snippet, "F = -kx");
        assert_eq!(results.image_urls.len(), 2);
        assert_eq!(parse_tavily(&json!({}), 5), ProviderResults::default());
    }

    #[test]
    fn test_parse_duckduckgo() {
        let body = json!({
            "Heading": "Pendulum",
            "AbstractText": "A pendulum is a weight suspended from a pivot.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Pendulum",
            "Image": "/i/pendulum.png",
            "RelatedTopics": [
                {"Text": "Foucault pendulum - demonstrates Earth's rotation", "FirstURL": "https://duckduckgo.com/Foucault"},
                {"Name": "Physics", "Topics": [
                    {"Text": "Simple harmonic motion", "FirstURL": "https://duckduckgo.com/SHM"}
                ]},
                {"Text": "", "FirstURL": ""}
            ]
        });
        let results = parse_duckduckgo(&body, 10);
        assert_eq!(results.hits.len(), 3);
        assert_eq!(results.hits[0].title, "Pendulum");
        assert_eq!(results.hits[1].title, "Foucault pendulum");
        assert_eq!(results.hits[2].url, "https://duckduckgo.com/SHM");
        assert_eq!(
            results.image_urls,
            vec!["https://duckduckgo.com/i/pendulum.png"]
        );

        assert_eq!(parse_duckduckgo(&body, 2).hits.len(), 2);
    }
}
