//! Configuration types for vaultflow
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! vault:
//!   url: https://example.vault.skyflowapis.com
//!   vault_id: ${VAULT_ID}
//!   bearer_token: ${VAULT_BEARER_TOKEN}
//! engine:
//!   batch_size: 25
//!   worker_count: 8
//!   max_retries: 5
//!   base_delay_ms: 1000
//! bulk_delete:
//!   tables: [persons, cards]
//!   max_records_per_resource: 100000
//! ```

use crate::buffer_pool::BufferPoolConfig;
use crate::retry::RetryConfig;
use crate::types::SensitiveString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    /// Vault endpoint and credentials
    #[validate(nested)]
    pub vault: VaultConfig,

    /// Engine tuning shared by every call site
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,

    /// Fetch-then-delete workflow settings
    #[serde(default)]
    #[validate(nested)]
    pub bulk_delete: BulkDeleteConfig,

    /// Log filter used when RUST_LOG is unset and `-v` is not given
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1))]
    pub log_level: String,
}

/// Vault endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VaultConfig {
    /// Base URL of the vault data plane
    #[validate(url)]
    pub url: String,

    /// Vault identifier used in request paths
    #[validate(length(min = 1, max = 255))]
    pub vault_id: String,

    /// Bearer token sent on every request
    pub bearer_token: SensitiveString,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EngineConfig {
    /// Maximum operations per request
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: usize,

    /// Concurrent workers per pool
    #[serde(default = "default_worker_count")]
    #[validate(range(min = 1, max = 256))]
    pub worker_count: usize,

    /// Bounded queue depth; defaults to 2 × worker_count
    #[serde(default)]
    #[validate(range(min = 1))]
    pub queue_depth: Option<usize>,

    /// Attempt budget per batch, including the first attempt
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, max = 20))]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub base_delay_ms: u64,

    /// Cap on computed backoff delays in milliseconds
    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1, max = 600000))]
    pub max_delay_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// Maximum concurrent requests across all pools
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 1024))]
    pub max_connections: usize,

    /// Idle keep-alive connections retained per host
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,

    /// Idle request buffers retained
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Deadline for one logical submission (unset = none)
    #[serde(default)]
    pub submission_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_count: default_worker_count(),
            queue_depth: None,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_connections: default_max_connections(),
            max_idle_connections: default_max_idle_connections(),
            buffer_pool_size: default_buffer_pool_size(),
            submission_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.worker_count * 2).max(1)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    pub fn buffer_pool_config(&self) -> BufferPoolConfig {
        BufferPoolConfig::default().with_pool_size(self.buffer_pool_size)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn submission_timeout(&self) -> Option<Duration> {
        self.submission_timeout_ms.map(Duration::from_millis)
    }
}

/// Fetch-then-delete workflow configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BulkDeleteConfig {
    /// Tables to drain
    #[serde(default)]
    pub tables: Vec<String>,

    /// Identifier column returned by fetches
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Records requested per fetch call
    #[serde(default = "default_fetch_limit")]
    #[validate(range(min = 1, max = 25000))]
    pub fetch_limit: u64,

    /// Parallel fetch calls per iteration
    #[serde(default = "default_fetch_workers")]
    #[validate(range(min = 1, max = 256))]
    pub fetch_workers: usize,

    /// Identifiers per delete request
    #[serde(default = "default_delete_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub delete_batch_size: usize,

    /// Concurrent delete workers
    #[serde(default = "default_delete_workers")]
    #[validate(range(min = 1, max = 256))]
    pub delete_workers: usize,

    /// Stop after this many deletions per table (unset = drain completely)
    #[serde(default)]
    pub max_records_per_resource: Option<u64>,
}

impl Default for BulkDeleteConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            id_column: default_id_column(),
            fetch_limit: default_fetch_limit(),
            fetch_workers: default_fetch_workers(),
            delete_batch_size: default_delete_batch_size(),
            delete_workers: default_delete_workers(),
            max_records_per_resource: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    25
}

fn default_worker_count() -> usize {
    8
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> usize {
    64
}

fn default_max_idle_connections() -> usize {
    32
}

fn default_buffer_pool_size() -> usize {
    32
}

fn default_id_column() -> String {
    "skyflow_id".to_string()
}

fn default_fetch_limit() -> u64 {
    1000
}

fn default_fetch_workers() -> usize {
    4
}

fn default_delete_batch_size() -> usize {
    25
}

fn default_delete_workers() -> usize {
    8
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse, expand and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate_all()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Field validation plus cross-field checks
    pub fn validate_all(&self) -> anyhow::Result<()> {
        self.validate()
            .map_err(|e| anyhow::anyhow!("Config validation failed: {}", e))?;

        if self.vault.bearer_token.expose_secret().is_empty() {
            anyhow::bail!("vault.bearer_token must not be empty");
        }
        if self.engine.max_delay_ms < self.engine.base_delay_ms {
            anyhow::bail!(
                "engine.max_delay_ms ({}) must be >= engine.base_delay_ms ({})",
                self.engine.max_delay_ms,
                self.engine.base_delay_ms
            );
        }
        if self.bulk_delete.id_column.is_empty() {
            anyhow::bail!("bulk_delete.id_column must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
vault:
  url: https://vault.example.com
  vault_id: v123
  bearer_token: secret-token
"#;

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("VAULTFLOW_TEST_VAR", "hello");
        let expanded = AppConfig::expand_env_vars("value: ${VAULTFLOW_TEST_VAR}");
        assert_eq!(expanded, "value: hello");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("VAULTFLOW_MISSING_VAR");
        let expanded = AppConfig::expand_env_vars("value: ${VAULTFLOW_MISSING_VAR:-fallback}");
        assert_eq!(expanded, "value: fallback");
    }

    #[test]
    fn test_parse_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.vault.vault_id, "v123");
        assert_eq!(config.vault.bearer_token.expose_secret(), "secret-token");
        assert_eq!(config.engine.batch_size, 25);
        assert_eq!(config.engine.worker_count, 8);
        assert_eq!(config.engine.queue_depth(), 16);
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.bulk_delete.id_column, "skyflow_id");
        assert!(config.bulk_delete.max_records_per_resource.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
vault:
  url: https://vault.example.com
  vault_id: v123
  bearer_token: ${VAULTFLOW_TOKEN_FOR_TEST:-from-default}
engine:
  batch_size: 100
  worker_count: 4
  queue_depth: 3
  max_retries: 3
  base_delay_ms: 250
  submission_timeout_ms: 60000
bulk_delete:
  tables: [persons, cards]
  fetch_limit: 500
  fetch_workers: 2
  delete_batch_size: 50
  delete_workers: 6
  max_records_per_resource: 1000
log_level: vaultflow_core=debug,warn
"#;
        std::env::remove_var("VAULTFLOW_TOKEN_FOR_TEST");
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.vault.bearer_token.expose_secret(), "from-default");
        assert_eq!(config.engine.queue_depth(), 3);
        assert_eq!(config.engine.submission_timeout(), Some(Duration::from_secs(60)));
        let retry = config.engine.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.bulk_delete.tables, vec!["persons", "cards"]);
        assert_eq!(config.bulk_delete.max_records_per_resource, Some(1000));
        assert_eq!(config.log_level, "vaultflow_core=debug,warn");
    }

    #[test]
    fn test_empty_log_level_rejected() {
        let yaml = format!("{}log_level: \"\"\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let yaml = MINIMAL.replace("https://vault.example.com", "not a url");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let yaml = format!("{}engine:\n  batch_size: 0\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        let yaml = MINIMAL.replace("secret-token", "\"\"");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultflow.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.vault.url, "https://vault.example.com");

        assert!(AppConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
