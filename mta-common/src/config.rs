//! Configuration loading
//!
//! Settings are resolved in priority order:
//! 1. Command-line arguments (applied by the binary)
//! 2. Environment variables (`MTA_*`)
//! 3. TOML configuration file
//! 4. Compiled defaults
//!
//! A missing TOML file is not an error: the service logs a warning and
//! starts with defaults.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit TOML file
pub const CONFIG_PATH_ENV: &str = "MTA_CONFIG";
/// Environment variable carrying the inference API key
pub const INFERENCE_API_KEY_ENV: &str = "MTA_INFERENCE_API_KEY";
/// Environment variable overriding the database path
pub const DATABASE_PATH_ENV: &str = "MTA_DATABASE_PATH";
/// Environment variable overriding the object signing secret
pub const SIGNING_SECRET_ENV: &str = "MTA_SIGNING_SECRET";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// SQLite database location
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Path to the SQLite file; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// External inference endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Chat-completions endpoint URL
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_inference_model")]
    pub model: String,
    /// API credential; may be supplied via `MTA_INFERENCE_API_KEY` instead
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request-level timeout for a single evaluation call
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Optional client-side rate limit (requests per second); 0 disables it
    #[serde(default)]
    pub requests_per_second: u32,
}

/// What a failed evaluation resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed evaluations approve the transaction
    #[default]
    FailOpen,
    /// Failed evaluations reject the transaction
    FailClosed,
}

/// Audit runner settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Worker pool width for concurrent inference calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Transactions fetched per drain page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Wall-clock budget for one runner pass
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    /// Interval between scheduled runner passes
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
    #[serde(default = "default_scheduler_enabled")]
    pub scheduler_enabled: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Object storage reference settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base URL under which object keys are served
    #[serde(default = "default_object_base_url")]
    pub object_base_url: String,
    /// Secret used to sign time-limited object references
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Lifetime of a signed reference
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5810
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_inference_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_inference_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    60
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_max_concurrency() -> usize {
    50
}

fn default_page_size() -> u32 {
    200
}

fn default_time_budget_secs() -> u64 {
    240
}

fn default_schedule_interval_secs() -> u64 {
    300
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_object_base_url() -> String {
    "http://127.0.0.1:9000/objects".to_string()
}

fn default_url_ttl_secs() -> u64 {
    900
}

/// Longest lifetime a signed object reference may have (7 days)
pub const MAX_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            model: default_inference_model(),
            api_key: None,
            timeout_secs: default_inference_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
            requests_per_second: 0,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            page_size: default_page_size(),
            time_budget_secs: default_time_budget_secs(),
            schedule_interval_secs: default_schedule_interval_secs(),
            scheduler_enabled: default_scheduler_enabled(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_base_url: default_object_base_url(),
            signing_secret: None,
            url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration, falling back to defaults when no file exists
    ///
    /// An explicit path that cannot be read or parsed is an error; a missing
    /// default-location file is not.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => match locate_config_file() {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    Self::from_file(&path)?
                }
                None => {
                    warn!("No configuration file found, using compiled defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `MTA_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = non_empty_env(INFERENCE_API_KEY_ENV) {
            self.inference.api_key = Some(key);
        }
        if let Some(path) = non_empty_env(DATABASE_PATH_ENV) {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Some(secret) = non_empty_env(SIGNING_SECRET_ENV) {
            self.storage.signing_secret = Some(secret);
        }
    }

    /// Reject values the runner cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.audit.max_concurrency == 0 {
            return Err(Error::Config("audit.max_concurrency must be at least 1".to_string()));
        }
        if self.audit.page_size == 0 {
            return Err(Error::Config("audit.page_size must be at least 1".to_string()));
        }
        if self.inference.timeout_secs == 0 {
            return Err(Error::Config("inference.timeout_secs must be at least 1".to_string()));
        }
        if self.storage.url_ttl_secs == 0 || self.storage.url_ttl_secs > MAX_URL_TTL_SECS {
            return Err(Error::Config(format!(
                "storage.url_ttl_secs must be between 1 and {}",
                MAX_URL_TTL_SECS
            )));
        }
        Ok(())
    }

    /// Inference API key if one is configured and non-blank
    pub fn inference_api_key(&self) -> Option<&str> {
        self.inference
            .api_key
            .as_deref()
            .filter(|key| is_valid_key(key))
    }

    /// Database path, falling back to the platform data directory
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// Validate an API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Find the configuration file: `MTA_CONFIG`, then user config dir, then /etc
pub fn locate_config_file() -> Option<PathBuf> {
    if let Some(path) = non_empty_env(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("{} points at missing file {}", CONFIG_PATH_ENV, path.display());
    }

    let user_config = dirs::config_dir().map(|d| d.join("mta").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/mta/config.toml");
    if cfg!(unix) && system_config.exists() {
        return Some(system_config);
    }

    None
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mta"))
        .unwrap_or_else(|| PathBuf::from("./mta_data"))
        .join("mta.db")
}
