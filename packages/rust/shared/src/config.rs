//! Application configuration for feedingest.
//!
//! User config lives at `~/.feedingest/feedingest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "feedingest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".feedingest";

// ---------------------------------------------------------------------------
// Config structs (matching feedingest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Remote object store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// External record service settings.
    #[serde(default)]
    pub publish: PublishConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding `<region>/<site>/` runner implementations.
    #[serde(default = "default_runners_dir")]
    pub runners_dir: String,

    /// Output root: a local path or a `gs://bucket/prefix` URI.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Maximum number of sites in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-stage timeout in seconds.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            runners_dir: default_runners_dir(),
            output_dir: default_output_dir(),
            concurrency: default_concurrency(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

fn default_runners_dir() -> String {
    "runners".into()
}
fn default_output_dir() -> String {
    "out".into()
}
fn default_concurrency() -> usize {
    8
}
fn default_stage_timeout_secs() -> u64 {
    30 * 60
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the GCS-compatible JSON API.
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding a bearer token for the remote store.
    #[serde(default = "default_storage_token_env")]
    pub token_env: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            token_env: default_storage_token_env(),
        }
    }
}

fn default_storage_endpoint() -> String {
    "https://storage.googleapis.com".into()
}
fn default_storage_token_env() -> String {
    "FEEDINGEST_STORAGE_TOKEN".into()
}

/// `[publish]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Base URL of the record service.
    #[serde(default = "default_publish_server")]
    pub server: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Records per import request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            server: default_publish_server(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_publish_server() -> String {
    "http://localhost:8000".into()
}
fn default_api_key_env() -> String {
    "FEEDINGEST_PUBLISH_APIKEY".into()
}
fn default_batch_size() -> usize {
    500
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration - merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the runner namespace.
    pub runners_dir: PathBuf,
    /// Output root (local path or remote URI).
    pub output_dir: String,
    /// Worker pool size.
    pub concurrency: usize,
    /// Per-stage timeout.
    pub stage_timeout: Duration,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            runners_dir: PathBuf::from(&config.defaults.runners_dir),
            output_dir: config.defaults.output_dir.clone(),
            concurrency: config.defaults.concurrency,
            stage_timeout: Duration::from_secs(config.defaults.stage_timeout_secs),
        }
    }
}

impl RunConfig {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(IngestError::config("concurrency must be at least 1"));
        }
        if self.stage_timeout.is_zero() {
            return Err(IngestError::config("stage timeout must be greater than zero"));
        }
        if self.output_dir.trim().is_empty() {
            return Err(IngestError::config("output dir must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.feedingest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| IngestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.feedingest/feedingest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| IngestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file at `path` (or the default location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| IngestError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IngestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IngestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the publish API key from the env var named in the config.
pub fn publish_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.publish.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(IngestError::config(format!(
            "publish API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Bearer token for the remote store, if one is configured.
pub fn storage_token(config: &StorageConfig) -> Option<String> {
    std::env::var(&config.token_env)
        .ok()
        .filter(|v| !v.is_empty())
}
