//! Application configuration for Errata.
//!
//! User config lives at `~/.errata/errata.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ErrataError, Result};
use crate::types::TaxonomyParams;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "errata.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".errata";

// ---------------------------------------------------------------------------
// Config structs (matching errata.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global run defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Judgment oracle settings.
    #[serde(default)]
    pub oracle: OracleSettings,

    /// Cluster-construction tunables.
    #[serde(default)]
    pub taxonomy: TaxonomyParams,

    /// Per-dataset overrides.
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding `{dataset}.csv` input files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory for cached stage outputs and artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Fraction of failing records sampled for analysis.
    #[serde(default = "default_ratio")]
    pub ratio: f64,

    /// Seed for shuffling and sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Maximum taxonomy recursion depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Categories below this record share collapse into "Other" (0 disables).
    #[serde(default)]
    pub rare_freq: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            ratio: default_ratio(),
            seed: default_seed(),
            max_depth: default_max_depth(),
            rare_freq: 0.0,
        }
    }
}

fn default_data_dir() -> String {
    "data".into()
}
fn default_output_dir() -> String {
    "output".into()
}
fn default_ratio() -> f64 {
    0.1
}
fn default_seed() -> u64 {
    42
}
fn default_max_depth() -> usize {
    2
}

/// `[oracle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSettings {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible completions endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: Url,

    /// Judge model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum simultaneously in-flight oracle calls, process-wide.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Completion token budget per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            max_workers: default_max_workers(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_api_key_env() -> String {
    "ERRATA_API_KEY".into()
}
fn default_base_url() -> Url {
    Url::parse("https://api.openai.com/v1").expect("static URL")
}
fn default_model() -> String {
    "openai/gpt-oss-120b".into()
}
fn default_max_workers() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    1000
}
fn default_max_tokens() -> u32 {
    10_000
}

/// `[[datasets]]` entry — per-dataset overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Dataset name (matches `{name}.csv` under the data directory).
    pub name: String,
    /// Score at or above which an output counts as a success. When absent,
    /// a data-driven default is derived from the dataset's mean score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<f64>,
}

impl AppConfig {
    /// Look up a configured success threshold for a dataset.
    pub fn success_threshold(&self, dataset: &str) -> Option<f64> {
        self.datasets
            .iter()
            .find(|entry| entry.name == dataset)
            .and_then(|entry| entry.success_threshold)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.errata/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ErrataError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.errata/errata.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ErrataError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ErrataError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ErrataError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ErrataError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ErrataError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the oracle API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.oracle.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ErrataError::config(format!(
            "oracle API key not found. Set the {var_name} environment variable."
        ))),
    }
}
