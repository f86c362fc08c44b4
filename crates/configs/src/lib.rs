use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;

pub mod resolver;

pub use resolver::{
    is_reserved, process_env, resolve, ExplicitConfig, PersistenceConfig, Setting, ENV_PREFIX,
};

/// File-based configuration, all sections optional.
///
/// ```toml
/// [persistence]
/// table_name = "AWSLambdaPersistence"
///
/// [dynamodb]
/// region = "us-west-2"
/// endpoint = "http://localhost:8000"
///
/// [retry]
/// enabled = true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub persistence: ExplicitConfig,
    #[serde(default)]
    pub dynamodb: DynamoDbConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override, e.g. DynamoDB Local or LocalStack.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_ready_poll_delay")]
    pub ready_poll_delay_ms: u64,
    #[serde(default = "default_ready_poll_attempts")]
    pub ready_poll_attempts: u32,
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            operation_timeout_ms: None,
            ready_poll_delay_ms: default_ready_poll_delay(),
            ready_poll_attempts: default_ready_poll_attempts(),
        }
    }
}

/// Retry on throttled store calls. Off unless enabled explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

// Table creation can take up to ~15s; poll every 2s for a minute.
fn default_ready_poll_delay() -> u64 { 2000 }
fn default_ready_poll_attempts() -> u32 { 30 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base() -> u64 { 100 }
fn default_backoff_max() -> u64 { 5000 }

pub const DEFAULT_CONFIG_PATH: &str = "persistence.toml";

/// Load from `CONFIG_PATH` (default `persistence.toml`). A missing file is not
/// an error: every section has defaults.
pub fn load_default() -> Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if !std::path::Path::new(&path).exists() {
        tracing::debug!(%path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }
    load_from_file(&path)
}

pub fn load_from_file(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(content)?;
    Ok(cfg)
}

impl AppConfig {
    pub fn load_and_validate() -> Result<Self> {
        let mut cfg = load_default()?;
        cfg.normalize_and_validate()?;
        Ok(cfg)
    }

    pub fn normalize_and_validate(&mut self) -> Result<()> {
        self.dynamodb.normalize();
        self.dynamodb.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

impl DynamoDbConfig {
    fn normalize(&mut self) {
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).is_some_and(str::is_empty);
        if blank(&self.region) {
            self.region = None;
        }
        if blank(&self.endpoint) {
            self.endpoint = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == Some(0) {
            return Err(anyhow!("dynamodb.operation_timeout_ms must be positive"));
        }
        if self.ready_poll_delay_ms == 0 || self.ready_poll_attempts == 0 {
            return Err(anyhow!("dynamodb.ready_poll_delay_ms and ready_poll_attempts must be positive"));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(anyhow!("retry.backoff_max_ms must be >= retry.backoff_base_ms"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let mut cfg = parse("").unwrap();
        cfg.normalize_and_validate().unwrap();
        assert_eq!(cfg.persistence, ExplicitConfig::default());
        assert!(!cfg.retry.enabled);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.dynamodb.ready_poll_delay_ms, 2000);
    }

    #[test]
    fn sections_are_parsed() {
        let cfg = parse(
            r#"
            [persistence]
            table_name = "Custom"
            table_key = "owner"

            [dynamodb]
            region = "eu-west-1"
            endpoint = "  "
            operation_timeout_ms = 1500

            [retry]
            enabled = true
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.persistence.table_name.as_deref(), Some("Custom"));
        assert_eq!(cfg.persistence.table_key.as_deref(), Some("owner"));
        assert_eq!(cfg.dynamodb.region.as_deref(), Some("eu-west-1"));
        assert_eq!(cfg.dynamodb.operation_timeout_ms, Some(1500));
        assert!(cfg.retry.enabled);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.backoff_max_ms, 5000);

        let mut cfg = cfg;
        cfg.normalize_and_validate().unwrap();
        assert_eq!(cfg.dynamodb.endpoint, None);
    }

    #[test]
    fn invalid_retry_is_rejected() {
        let mut cfg = parse("[retry]\nmax_attempts = 0\n").unwrap();
        assert!(cfg.normalize_and_validate().is_err());

        let mut cfg = parse("[retry]\nbackoff_base_ms = 10\nbackoff_max_ms = 1\n").unwrap();
        assert!(cfg.normalize_and_validate().is_err());
    }

    #[test]
    fn load_from_file_round_trip() {
        let path = std::env::temp_dir().join(format!("persistence_{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[persistence]\nvalue_field_name = \"blob\"\n").unwrap();
        let cfg = load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.persistence.value_field_name.as_deref(), Some("blob"));
        let _ = std::fs::remove_file(&path);
    }
}
