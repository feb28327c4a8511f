//! Configuration loading and validation.
//!
//! Telemikiya reads a single TOML file (default `./config/telemikiya.toml`).
//! Every section except `[database]` has defaults; a minimal file only
//! needs a database URL and an embedding provider.
//!
//! ```toml
//! [database]
//! url = "postgres://telemikiya@localhost/telemikiya"
//!
//! [telegram]
//! observed_dialog_ids = []
//! dialog_update_interval_secs = 3600
//! bot_token = "123456:ABC"
//!
//! [embedding]
//! provider = "ollama"
//! dims = 768
//! batch_size = 64
//!
//! [providers.ollama]
//! base_url = "http://localhost:11434"
//! model = "nomic-embed-text"
//! ```
//!
//! Secrets may come from the environment instead of the file:
//! `TELEMIKIYA_DATABASE_URL`, `OPENAI_API_KEY`, `GOOGLE_API_KEY`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Only record these dialogs. Empty means record everything.
    #[serde(default)]
    pub observed_dialog_ids: Vec<i64>,
    #[serde(default = "default_dialog_update_interval_secs")]
    pub dialog_update_interval_secs: u64,
    /// Messages in the bot's own dialog are excluded from search.
    #[serde(default)]
    pub bot_token: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            observed_dialog_ids: Vec::new(),
            dialog_update_interval_secs: default_dialog_update_interval_secs(),
            bot_token: String::new(),
        }
    }
}

impl TelegramConfig {
    pub fn dialog_update_interval(&self) -> Duration {
        Duration::from_secs(self.dialog_update_interval_secs)
    }

    /// Numeric account id prefix of the bot token, if it parses.
    pub fn bot_id(&self) -> Option<i64> {
        self.bot_token.split(':').next()?.trim().parse().ok()
    }
}

fn default_dialog_update_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_idle_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            idle_interval_secs: default_idle_interval_secs(),
            retry_interval_secs: default_idle_interval_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    64
}
fn default_idle_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_count")]
    pub default_count: usize,
    /// Drop semantic matches farther than this cosine distance.
    #[serde(default)]
    pub max_distance: Option<f64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_count: default_count(),
            max_distance: None,
        }
    }
}

fn default_count() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: Option<ProviderConfig>,
    #[serde(default)]
    pub openai: Option<ProviderConfig>,
    #[serde(default)]
    pub google: Option<ProviderConfig>,
}

impl ProvidersConfig {
    /// Settings for the named provider, or defaults if the section is absent.
    pub fn get(&self, name: &str) -> ProviderConfig {
        match name {
            "ollama" => self.ollama.clone(),
            "openai" => self.openai.clone(),
            "google" => self.google.clone(),
            _ => None,
        }
        .unwrap_or_default()
    }
}

/// Connection settings shared by all embedding providers.
///
/// Provider-specific keys (`keep_alive`, `organization`, `project`,
/// `quota_project`) are ignored by providers that do not use them.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ollama: how long the model stays loaded, e.g. `"5m"`.
    #[serde(default)]
    pub keep_alive: Option<String>,
    /// Ollama: extra model options passed through verbatim.
    #[serde(default)]
    pub model_parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub quota_project: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            keep_alive: None,
            model_parameters: HashMap::new(),
            organization: None,
            project: None,
            quota_project: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(url) = std::env::var("TELEMIKIYA_DATABASE_URL") {
        if !url.is_empty() {
            config.database.url = url;
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.database.url.is_empty() {
        anyhow::bail!("database.url must be set (or TELEMIKIYA_DATABASE_URL)");
    }
    if config.database.max_connections == 0 {
        anyhow::bail!("database.max_connections must be > 0");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.idle_interval_secs == 0 {
        anyhow::bail!("embedding.idle_interval_secs must be > 0");
    }

    if config.search.default_count == 0 {
        anyhow::bail!("search.default_count must be >= 1");
    }
    if let Some(max) = config.search.max_distance {
        if !(0.0..=2.0).contains(&max) {
            anyhow::bail!("search.max_distance must be in [0.0, 2.0]");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("[database]\nurl = \"postgres://localhost/t\"\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, 768);
        assert_eq!(config.embedding.idle_interval(), Duration::from_secs(5));
        assert_eq!(config.telegram.dialog_update_interval_secs, 3600);
        assert_eq!(config.search.default_count, 10);
        assert!(config.telegram.observed_dialog_ids.is_empty());
    }

    #[test]
    fn test_provider_sections() {
        let file = write_config(
            r#"
[database]
url = "postgres://localhost/t"

[embedding]
provider = "openai"
dims = 1536

[providers.openai]
model = "text-embedding-3-small"
organization = "org-1"
timeout_secs = 5
"#,
        );
        let config = load_config(file.path()).unwrap();
        let openai = config.providers.get("openai");
        assert_eq!(openai.model.as_deref(), Some("text-embedding-3-small"));
        assert_eq!(openai.organization.as_deref(), Some("org-1"));
        assert_eq!(openai.timeout_secs, 5);
        assert_eq!(openai.max_retries, 5);
        assert!(config.providers.get("google").model.is_none());
    }

    #[test]
    fn test_zero_dims_rejected() {
        let file = write_config(
            "[database]\nurl = \"postgres://localhost/t\"\n[embedding]\ndims = 0\n",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_bad_max_distance_rejected() {
        let file = write_config(
            "[database]\nurl = \"postgres://localhost/t\"\n[search]\nmax_distance = 3.0\n",
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_bot_id_from_token() {
        let mut telegram = TelegramConfig {
            bot_token: "123456:ABC-DEF".into(),
            ..Default::default()
        };
        assert_eq!(telegram.bot_id(), Some(123456));
        telegram.bot_token = "garbage".into();
        assert_eq!(telegram.bot_id(), None);
        telegram.bot_token = String::new();
        assert_eq!(telegram.bot_id(), None);
    }

    #[test]
    fn test_missing_file_mentions_path() {
        let err = load_config(Path::new("/nonexistent/telemikiya.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/telemikiya.toml"));
    }
}
