//! Configuration loading.
//!
//! Settings live in a YAML file, by default `<config_dir>/embedstore/config.yml`.
//! A missing default file means built-in defaults; an explicitly requested
//! file that does not exist is an error.

use crate::error::{EmbedStoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Application directory name under the platform config/data dirs.
const APP_DIR: &str = "embedstore";

/// Config file name.
const CONFIG_FILE: &str = "config.yml";

/// Database file name.
const DB_FILE: &str = "store.sqlite";

/// Plain SQL identifier: table and column names are interpolated into SQL,
/// so anything else is rejected.
#[allow(clippy::unwrap_used)]
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Get the default config file path.
#[must_use]
pub fn get_default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
}

/// Get the default database path.
#[must_use]
pub fn get_default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR).join(DB_FILE))
}

/// Check that `name` can be used as a table or column name.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(EmbedStoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database path. `None` means the platform default.
    pub database: Option<PathBuf>,
    /// Table layout.
    pub table: TableConfig,
    /// Driver chunking and failure policy.
    pub driver: DriverSettings,
    /// Embedding provider.
    pub embedding: EmbeddingSettings,
    /// Text-generation provider.
    pub generation: GenerationSettings,
}

impl Config {
    /// Load configuration.
    ///
    /// With `path`, the file must exist. Without it, the default location is
    /// tried and defaults are used when nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(EmbedStoreError::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                Self::from_file(p)?
            }
            None => match get_default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without validation.
    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check identifiers and sizes.
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;
        self.driver.validate()
    }

    /// Database path: explicit value, then the platform default.
    pub fn database_path(&self) -> Result<PathBuf> {
        self.database
            .clone()
            .or_else(get_default_db_path)
            .ok_or_else(|| EmbedStoreError::Config("cannot determine database path".into()))
    }
}

/// Table holding the records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Table name.
    pub name: String,
    /// Integer primary key column.
    pub id_column: String,
    /// Text columns, concatenated in this order to form the embedding input.
    pub text_columns: Vec<String>,
    /// Column holding the packed float32 vector.
    pub vector_column: String,
    /// Optional column caching the nearest-neighbor id list.
    pub neighbors_column: Option<String>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: "records".to_string(),
            id_column: "id".to_string(),
            text_columns: vec!["text".to_string()],
            vector_column: "embedding".to_string(),
            neighbors_column: None,
        }
    }
}

impl TableConfig {
    /// Validate every configured name.
    pub fn validate(&self) -> Result<()> {
        if self.text_columns.is_empty() {
            return Err(EmbedStoreError::Config(
                "table.text_columns must name at least one column".into(),
            ));
        }
        validate_identifier(&self.name)?;
        validate_identifier(&self.id_column)?;
        validate_identifier(&self.vector_column)?;
        for col in &self.text_columns {
            validate_identifier(col)?;
        }
        if let Some(col) = &self.neighbors_column {
            validate_identifier(col)?;
        }
        Ok(())
    }
}

/// What the driver does once a batch has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failed ids and keep going.
    #[default]
    Continue,
    /// Stop the run.
    Abort,
}

/// Driver settings as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Records per commit.
    pub chunk_size: usize,
    /// Records per provider call.
    pub batch_size: usize,
    /// Retries per batch after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the attempt number.
    pub retry_delay_ms: u64,
    /// Policy once retries are exhausted.
    pub on_failure: FailurePolicy,
    /// Cap on records processed per run.
    pub limit: Option<usize>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            batch_size: 32,
            max_retries: 2,
            retry_delay_ms: 500,
            on_failure: FailurePolicy::Continue,
            limit: None,
        }
    }
}

impl DriverSettings {
    /// Reject zero sizes.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.batch_size == 0 {
            return Err(EmbedStoreError::Config(
                "driver.chunk_size and driver.batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Retry delay as a duration.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Which embedding provider to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    #[default]
    OpenAi,
    /// Offline feature-hashing embedder.
    Hashing,
}

/// Embedding provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Provider implementation.
    pub provider: ProviderKind,
    /// API base URL, without the `/embeddings` suffix.
    pub base_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Environment variable holding the API key. Unset means no auth header.
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Output dimensions of the hashing embedder.
    pub dimensions: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 60,
            dimensions: 256,
        }
    }
}

impl EmbeddingSettings {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Text-generation provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// API base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Completion token cap.
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 120,
            max_tokens: 512,
        }
    }
}

impl GenerationSettings {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Read an API key from the named environment variable, if any.
#[must_use]
pub fn api_key(env_var: Option<&str>) -> Option<String> {
    env_var
        .and_then(|name| std::env::var(name).ok())
        .filter(|k| !k.is_empty())
}
