use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Env var holding the log-proxy API key. The key is never stored in config.
pub const PROXY_API_KEY_ENV: &str = "COVEY_PROXY_API_KEY";

/// Top-level configuration loaded from `~/.covey/config.toml`.
///
/// Deployment-specific values can be overridden from the environment:
/// `COVEY_GROUP_NAME`, `COVEY_AGENT_ID`, `COVEY_PROXY_URL`, `COVEY_DB_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

impl Config {
    /// Load config from `~/.covey/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides are applied
    /// before validation.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("COVEY_GROUP_NAME") {
            self.group.group_name = v;
        }
        if let Some(v) = get("COVEY_AGENT_ID") {
            self.group.agent_id = v;
        }
        if let Some(v) = get("COVEY_PROXY_URL") {
            self.transport.proxy_url = v;
        }
        if let Some(v) = get("COVEY_DB_PATH") {
            self.store.path = v;
        }
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.group.validate()?;
        self.delivery.validate()?;
        if self.intake.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "intake.max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The ledger path with a leading `~` expanded to the home directory.
    pub fn resolved_store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".covey")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.covey/covey.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub agent_id: String,
    /// Consumer group used when reading from the log. Defaults to
    /// `covey-{group_name}-{agent_id}`.
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_secs: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_name: String::new(),
            agent_id: String::new(),
            consumer_group: None,
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: None,
            join_timeout_secs: default_join_timeout(),
            leave_timeout_secs: default_leave_timeout(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_join_timeout() -> u64 {
    10
}
fn default_leave_timeout() -> u64 {
    5
}

const MIN_HEARTBEAT: Duration = Duration::from_secs(30);

impl GroupConfig {
    /// Explicit `heartbeat_interval_secs`, else 15 poll intervals with a 30s floor.
    pub fn heartbeat_interval(&self) -> Duration {
        match self.heartbeat_interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_millis(self.poll_interval_ms.saturating_mul(15)).max(MIN_HEARTBEAT),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_secs(self.leave_timeout_secs)
    }

    pub fn consumer_group(&self) -> String {
        self.consumer_group
            .clone()
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| format!("covey-{}-{}", self.group_name, self.agent_id))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "group.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.join_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "group.join_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.leave_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "group.leave_timeout_secs must be greater than zero".into(),
            ));
        }
        if !self.enabled {
            return Ok(());
        }
        if self.group_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "group.group_name is required when the group is enabled".into(),
            ));
        }
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "group.agent_id is required when the group is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// Display name; falls back to the agent id.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub soul_summary: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_proxy_url() -> String {
    "http://localhost:8080".into()
}
fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Tokens allowed per UTC day. Unset means unlimited.
    #[serde(default)]
    pub daily_token_limit: Option<i64>,
    #[serde(default = "default_processor_timeout")]
    pub processor_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            daily_token_limit: None,
            processor_timeout_secs: default_processor_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl IntakeConfig {
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }
}

fn default_processor_timeout() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_delivery_poll(),
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            batch_size: default_batch_size(),
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// `base × 2^attempts`, capped at `max_backoff_secs`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts.min(32)).unwrap_or(u64::MAX);
        let secs = self
            .base_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "delivery.max_attempts must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "delivery.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_delivery_poll() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    2
}
fn default_max_backoff() -> u64 {
    300
}
fn default_batch_size() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_processor_endpoint")]
    pub endpoint: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_processor_endpoint(),
        }
    }
}

fn default_processor_endpoint() -> String {
    "http://localhost:8090/process".into()
}
