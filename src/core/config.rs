use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{FanoutError, Result};

/// Configuration for retry behavior between unit attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the attempt following `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powi(attempt as i32)).round();
                Duration::from_millis((delay as u64).min(*max_delay_ms))
            }
            RetryStrategy::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Immediate => Duration::ZERO,
        }
    }
}

/// Versions of the unit callables; feed the salted artifact paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitVersions {
    pub producer: String,
    pub partition: String,
    pub worker: String,
}

impl Default for UnitVersions {
    fn default() -> Self {
        Self {
            producer: "0.1.0".to_string(),
            partition: "0.1.0".to_string(),
            worker: "0.1.0".to_string(),
        }
    }
}

/// Positions of the fields a worker reads from each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub name: usize,
    pub date_of_birth: usize,
}

impl Default for RecordFields {
    fn default() -> Self {
        // (id, name, date_of_birth, ...)
        Self {
            name: 1,
            date_of_birth: 2,
        }
    }
}

/// Pipeline configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Logical pipeline name, first component of every artifact path
    pub pipeline_name: String,
    /// Records handled by a single worker
    pub capacity: usize,
    /// Drop the first row of the collected batch before chunking
    pub skip_header: bool,
    /// Root directory (or key prefix) of the artifact store
    pub artifact_root: PathBuf,
    /// Sled database for run state; in-memory when unset
    pub state_path: Option<PathBuf>,
    /// Upper bound on concurrently running workers
    pub max_parallel_workers: usize,
    /// Attempts per unit, including the first one
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    /// Per-attempt worker timeout
    pub worker_timeout_ms: Option<u64>,
    /// Embed version salts into artifact paths
    pub salted: bool,
    pub versions: UnitVersions,
    pub fields: RecordFields,
    /// Environment variable holding the query service user name
    pub credentials_user_env: String,
    /// Environment variable holding the query service password
    pub credentials_password_env: String,
    /// Buffered run events per subscriber
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "jail_scraper".to_string(),
            capacity: 3,
            skip_header: false,
            artifact_root: PathBuf::from("data/scrapes"),
            state_path: None,
            max_parallel_workers: 4,
            max_attempts: 3,
            retry_strategy: RetryStrategy::default(),
            worker_timeout_ms: Some(1_800_000),
            salted: false,
            versions: UnitVersions::default(),
            fields: RecordFields::default(),
            credentials_user_env: "QUERY_USER".to_string(),
            credentials_password_env: "QUERY_PASS".to_string(),
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for PipelineConfig
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Load and validate a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FanoutError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| FanoutError::configuration(format!("failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FANOUT_*` environment overrides on top of this configuration
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("FANOUT_CAPACITY") {
            self.capacity = parse_env("FANOUT_CAPACITY", &value)?;
        }
        if let Ok(value) = std::env::var("FANOUT_MAX_PARALLEL_WORKERS") {
            self.max_parallel_workers = parse_env("FANOUT_MAX_PARALLEL_WORKERS", &value)?;
        }
        if let Ok(value) = std::env::var("FANOUT_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("FANOUT_STATE_PATH") {
            self.state_path = Some(PathBuf::from(value));
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_name.trim().is_empty() {
            return Err(FanoutError::configuration_field(
                "pipeline_name must not be empty",
                "pipeline_name",
            ));
        }
        if self.pipeline_name.contains(['/', '\\']) {
            return Err(FanoutError::configuration_field(
                "pipeline_name must not contain path separators",
                "pipeline_name",
            ));
        }
        if self.capacity == 0 {
            return Err(FanoutError::configuration_field(
                "capacity must be at least 1",
                "capacity",
            ));
        }
        if self.max_parallel_workers == 0 {
            return Err(FanoutError::configuration_field(
                "max_parallel_workers must be greater than 0",
                "max_parallel_workers",
            ));
        }
        if self.max_attempts == 0 {
            return Err(FanoutError::configuration_field(
                "max_attempts must be greater than 0",
                "max_attempts",
            ));
        }
        if let Some(0) = self.worker_timeout_ms {
            return Err(FanoutError::configuration_field(
                "worker_timeout_ms must be greater than 0",
                "worker_timeout_ms",
            ));
        }
        if let RetryStrategy::Exponential { multiplier, .. } = self.retry_strategy {
            if multiplier < 1.0 {
                return Err(FanoutError::configuration_field(
                    "retry multiplier must be >= 1.0",
                    "retry_strategy",
                ));
            }
        }
        if self.fields.name == self.fields.date_of_birth {
            return Err(FanoutError::configuration_field(
                "name and date_of_birth must be different fields",
                "fields",
            ));
        }
        if self.event_capacity == 0 {
            return Err(FanoutError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence for optional values
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let merged = Self {
            state_path: override_with
                .state_path
                .clone()
                .or_else(|| base.state_path.clone()),
            worker_timeout_ms: override_with.worker_timeout_ms.or(base.worker_timeout_ms),
            ..override_with.clone()
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FanoutError::configuration_field(format!("invalid {}: {}", name, e), name))
}

/// Builder for PipelineConfig
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    pub fn pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.config.pipeline_name = name.into();
        self
    }

    /// Set records per worker
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn skip_header(mut self, skip: bool) -> Self {
        self.config.skip_header = skip;
        self
    }

    pub fn artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.artifact_root = root.into();
        self
    }

    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state_path = Some(path.into());
        self
    }

    pub fn max_parallel_workers(mut self, workers: usize) -> Self {
        self.config.max_parallel_workers = workers;
        self
    }

    /// Set attempts per unit and the delay policy between them
    pub fn retries(mut self, max_attempts: u32, strategy: RetryStrategy) -> Self {
        self.config.max_attempts = max_attempts;
        self.config.retry_strategy = strategy;
        self
    }

    pub fn worker_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.worker_timeout_ms = timeout.map(|d| (d.as_millis() as u64).max(1));
        self
    }

    pub fn salted(mut self, salted: bool) -> Self {
        self.config.salted = salted;
        self
    }

    pub fn versions(mut self, versions: UnitVersions) -> Self {
        self.config.versions = versions;
        self
    }

    pub fn fields(mut self, fields: RecordFields) -> Self {
        self.config.fields = fields;
        self
    }

    pub fn credentials_env(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials_user_env = user.into();
        self.config.credentials_password_env = password.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity, 3);
        assert_eq!(config.fields, RecordFields { name: 1, date_of_birth: 2 });
    }

    #[test]
    fn test_zero_capacity_is_configuration_error() {
        let err = PipelineConfig::builder().capacity(0).build().unwrap_err();
        match err {
            FanoutError::Configuration { field, .. } => assert_eq!(field.as_deref(), Some("capacity")),
            other => panic!("expected configuration error, got {other}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PipelineConfig::default();

        config.max_parallel_workers = 0;
        assert!(config.validate().is_err());
        config.max_parallel_workers = 2;

        config.max_attempts = 0;
        assert!(config.validate().is_err());
        config.max_attempts = 1;

        config.pipeline_name = "a/b".to_string();
        assert!(config.validate().is_err());
        config.pipeline_name = "ok".to_string();

        config.fields = RecordFields { name: 2, date_of_birth: 2 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_loading() {
        let yaml = r#"
pipeline_name: nightly
capacity: 50
skip_header: true
max_parallel_workers: 8
retry_strategy:
  kind: linear
  delay_ms: 10
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pipeline_name, "nightly");
        assert_eq!(config.capacity, 50);
        assert!(config.skip_header);
        assert_eq!(config.max_parallel_workers, 8);
        assert_eq!(config.retry_strategy, RetryStrategy::Linear { delay_ms: 10 });
        // unspecified fields keep their defaults
        assert_eq!(config.max_attempts, 3);

        assert!(PipelineConfig::from_yaml_str("capacity: 0").is_err());
    }

    #[test]
    fn test_merge_prefers_override() {
        let base = PipelineConfig::builder().state_path("/tmp/state").build().unwrap();
        let mut over = PipelineConfig::default();
        over.capacity = 7;
        over.worker_timeout_ms = None;

        let merged = PipelineConfig::merge(&base, &over).unwrap();
        assert_eq!(merged.capacity, 7);
        assert_eq!(merged.state_path, Some(PathBuf::from("/tmp/state")));
        assert_eq!(merged.worker_timeout_ms, base.worker_timeout_ms);
    }

    #[test]
    fn test_retry_delays() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(400));
        assert_eq!(strategy.delay_for(10), Duration::from_millis(1_000));
        assert_eq!(RetryStrategy::Immediate.delay_for(3), Duration::ZERO);
    }
}
