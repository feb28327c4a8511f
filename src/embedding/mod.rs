//! Embedding provider implementations and the provider registry.
//!
//! Concrete implementations of the core
//! [`EmbeddingProvider`](telemikiya_core::embedding::EmbeddingProvider) trait:
//! - **[`OllamaProvider`]**: a self-hosted Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAIProvider`]**: the OpenAI (or compatible) `/embeddings` endpoint.
//! - **[`GoogleProvider`]**: the Gemini `batchEmbedContents` endpoint.
//!
//! # Provider Selection
//!
//! Providers are built by name through a [`ProviderRegistry`]. The registry
//! is an explicit map, filled by [`ProviderRegistry::builtin`] at startup;
//! an unknown name fails with
//! [`Error::UnknownProvider`](telemikiya_core::Error::UnknownProvider)
//! before any network or database work.
//!
//! # Retry Strategy
//!
//! All providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use telemikiya_core::embedding::{embed_checked, EmbeddingProvider};
use telemikiya_core::Error;

use crate::config::{Config, ProviderConfig};

/// Everything a provider factory needs.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: ProviderConfig,
    pub dims: usize,
}

impl ProviderSettings {
    fn model(&self, name: &str) -> Result<String> {
        self.provider
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("providers.{}.model required", name))
    }

    fn client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.provider.timeout_secs))
            .build()?)
    }
}

pub type ProviderFactory = fn(&ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>>;

/// Name → factory map for embedding providers.
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `ollama`, `openai`, and `google`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("ollama", |s| Ok(Arc::new(OllamaProvider::new(s)?)));
        registry.register("openai", |s| Ok(Arc::new(OpenAIProvider::new(s)?)));
        registry.register("google", |s| Ok(Arc::new(GoogleProvider::new(s)?)));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ProviderFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Build the provider named by `embedding.provider`.
    pub fn create(&self, config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
        let name = config.embedding.provider.as_str();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        let settings = ProviderSettings {
            provider: config.providers.get(name),
            dims: config.embedding.dims,
        };
        let provider = factory(&settings)
            .with_context(|| format!("Failed to create embedding provider '{}'", name))?;
        tracing::info!(
            provider = name,
            model = provider.model_name(),
            dims = provider.dims(),
            "embedding provider ready"
        );
        Ok(provider)
    }
}

/// Embed a probe text and check that the provider really produces
/// vectors of the configured length.
///
/// # Errors
///
/// [`Error::DimensionMismatch`] if the model's output length differs.
pub async fn verify_dimensions(provider: &dyn EmbeddingProvider) -> Result<()> {
    embed_checked(provider, &["dimension probe".to_string()])
        .await
        .with_context(|| {
            format!(
                "Embedding provider '{}' failed the dimension check",
                provider.name()
            )
        })?;
    Ok(())
}

// ============ Shared HTTP ============

/// Send the request built by `request`, retrying transient failures, and
/// return the JSON response.
async fn post_with_retry(
    label: &str,
    max_retries: u32,
    request: impl Fn() -> reqwest::RequestBuilder,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        match request().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

fn json_to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using an Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default:
/// `http://localhost:11434`). The model must already be pulled.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    keep_alive: Option<String>,
    options: serde_json::Map<String, serde_json::Value>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let cfg = &settings.provider;
        Ok(Self {
            model: settings.model("ollama")?,
            dims: settings.dims,
            url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            keep_alive: cfg.keep_alive.clone(),
            options: cfg
                .model_parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            max_retries: cfg.max_retries,
            client: settings.client()?,
        })
    }

    fn body(&self, texts: &[String]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(keep_alive) = &self.keep_alive {
            body["keep_alive"] = serde_json::json!(keep_alive);
        }
        if !self.options.is_empty() {
            body["options"] = serde_json::Value::Object(self.options.clone());
        }
        body
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let body = self.body(texts);
        let json = post_with_retry("Ollama", self.max_retries, || {
            self.client.post(&url).json(&body)
        })
        .await
        .with_context(|| format!("Is Ollama running at {}?", self.url))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| json_to_vec(values))
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API, or any server that speaks it.
///
/// Requests `dimensions` explicitly so models that support shortening
/// return vectors of the configured length. The API key comes from
/// `providers.openai.api_key` or the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    organization: Option<String>,
    project: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let cfg = &settings.provider;
        let api_key = match &cfg.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?,
        };
        Ok(Self {
            model: settings.model("openai")?,
            dims: settings.dims,
            url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            organization: cfg.organization.clone(),
            project: cfg.project.clone(),
            max_retries: cfg.max_retries,
            client: settings.client()?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
            "encoding_format": "float",
        });
        let json = post_with_retry("OpenAI", self.max_retries, || {
            let mut req = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body);
            if let Some(org) = &self.organization {
                req = req.header("OpenAI-Organization", org);
            }
            if let Some(project) = &self.project {
                req = req.header("OpenAI-Project", project);
            }
            req
        })
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, placed by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(pos, |i| i as usize);
        embeddings.push((index, json_to_vec(embedding)));
    }

    embeddings.sort_by_key(|(index, _)| *index);
    Ok(embeddings.into_iter().map(|(_, v)| v).collect())
}

// ============ Google Provider ============

/// Embedding provider using the Gemini API's `batchEmbedContents`.
///
/// The API key comes from `providers.google.api_key` or `GOOGLE_API_KEY`.
pub struct GoogleProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    quota_project: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let cfg = &settings.provider;
        let api_key = match &cfg.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => std::env::var("GOOGLE_API_KEY")
                .map_err(|_| anyhow::anyhow!("GOOGLE_API_KEY environment variable not set"))?,
        };
        let model = settings.model("google")?;
        Ok(Self {
            model: model
                .strip_prefix("models/")
                .map(str::to_string)
                .unwrap_or(model),
            dims: settings.dims,
            url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            quota_project: cfg.quota_project.clone(),
            max_retries: cfg.max_retries,
            client: settings.client()?,
        })
    }

    fn body(&self, texts: &[String]) -> serde_json::Value {
        let model = format!("models/{}", self.model);
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": model,
                    "content": { "parts": [{ "text": t }] },
                    "outputDimensionality": self.dims,
                })
            })
            .collect();
        serde_json::json!({ "requests": requests })
    }
}

#[async_trait]
impl EmbeddingProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.url.trim_end_matches('/'),
            self.model
        );
        let body = self.body(texts);
        let json = post_with_retry("Google", self.max_retries, || {
            let mut req = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body);
            if let Some(project) = &self.quota_project {
                req = req.header("x-goog-user-project", project);
            }
            req
        })
        .await?;
        parse_google_response(&json)
    }
}

fn parse_google_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Google response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            e.get("values")
                .and_then(|v| v.as_array())
                .map(|values| json_to_vec(values))
                .ok_or_else(|| anyhow::anyhow!("Invalid Google response: missing values"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> Config {
        let toml = format!(
            r#"
[database]
url = "postgres://localhost/t"

[embedding]
provider = "{}"
dims = 3

[providers.ollama]
model = "nomic-embed-text"
keep_alive = "5m"

[providers.openai]
model = "text-embedding-3-small"
api_key = "sk-test"

[providers.google]
model = "models/text-embedding-004"
api_key = "g-test"
"#,
            provider
        );
        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn test_unknown_provider_is_named_error() {
        let err = ProviderRegistry::builtin()
            .create(&config("cohere"))
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::UnknownProvider("cohere".into()))
        );
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(
            ProviderRegistry::builtin().names(),
            vec!["google", "ollama", "openai"]
        );
    }

    #[test]
    fn test_builtin_providers_construct() {
        let registry = ProviderRegistry::builtin();
        for name in ["ollama", "openai", "google"] {
            let provider = registry.create(&config(name)).unwrap();
            assert_eq!(provider.name(), name);
            assert_eq!(provider.dims(), 3);
        }
        let google = registry.create(&config("google")).unwrap();
        assert_eq!(google.model_name(), "text-embedding-004");
    }

    #[test]
    fn test_missing_model_fails() {
        let mut cfg = config("ollama");
        cfg.providers.ollama = None;
        let err = ProviderRegistry::builtin().create(&cfg).err().unwrap();
        assert!(format!("{:#}", err).contains("providers.ollama.model required"));
    }

    #[test]
    fn test_registry_accepts_custom_factory() {
        let mut registry = ProviderRegistry::empty();
        registry.register("ollama", |s| Ok(Arc::new(OllamaProvider::new(s)?)));
        assert!(registry.create(&config("ollama")).is_ok());
        assert!(registry.create(&config("openai")).is_err());
    }

    #[test]
    fn test_ollama_body_carries_options() {
        let mut cfg = config("ollama");
        if let Some(ollama) = cfg.providers.ollama.as_mut() {
            ollama
                .model_parameters
                .insert("num_ctx".into(), serde_json::json!(2048));
        }
        let settings = ProviderSettings {
            provider: cfg.providers.get("ollama"),
            dims: 3,
        };
        let provider = OllamaProvider::new(&settings).unwrap();
        let body = provider.body(&["a".to_string()]);
        assert_eq!(body["keep_alive"], "5m");
        assert_eq!(body["options"]["num_ctx"], 2048);
        assert_eq!(body["input"][0], "a");
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let out = parse_ollama_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[1][0] - 0.3).abs() < 1e-6);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]},
        ]});
        assert_eq!(parse_openai_response(&json).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_parse_google() {
        let json = serde_json::json!({"embeddings": [{"values": [0.5, 0.25]}]});
        assert_eq!(parse_google_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        let bad = serde_json::json!({"embeddings": [{}]});
        assert!(parse_google_response(&bad).is_err());
    }

    #[test]
    fn test_google_body_shape() {
        let settings = ProviderSettings {
            provider: config("google").providers.get("google"),
            dims: 3,
        };
        let provider = GoogleProvider::new(&settings).unwrap();
        let body = provider.body(&["x".to_string(), "y".to_string()]);
        assert_eq!(body["requests"].as_array().unwrap().len(), 2);
        assert_eq!(body["requests"][0]["model"], "models/text-embedding-004");
        assert_eq!(body["requests"][1]["content"]["parts"][0]["text"], "y");
        assert_eq!(body["requests"][0]["outputDimensionality"], 3);
    }
}
