use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating configuration values
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the picture service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Retry and circuit breaker settings per dependency
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Orchestrator behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Orphaned blob sweeper
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for picture blobs
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix under which blobs are stored
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Kafka producer configuration for change events
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Topic receiving picture change events
    #[serde(default = "default_events_topic")]
    pub topic: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Security protocol (plaintext, ssl, sasl_plaintext, sasl_ssl)
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Enable idempotent producer
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Local delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

/// Retry budget for one dependency
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomization factor applied to each delay (0.0 disables jitter)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Timeout for a single attempt in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

/// Circuit breaker thresholds for one dependency
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Maximum number of outcomes kept in the rolling window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Outcomes older than this are dropped from the window, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Outcomes required in the window before the ratio is evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,
    /// Failure ratio (0.0 - 1.0) at which the circuit opens
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    /// How long an open circuit rejects calls before admitting a probe, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

/// Resilience settings for a single dependency
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencyPolicyConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Independent resilience settings for each dependency
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub blob_store: DependencyPolicyConfig,
    #[serde(default)]
    pub metadata: DependencyPolicyConfig,
    #[serde(default)]
    pub events: DependencyPolicyConfig,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Largest accepted picture payload in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// How long an operation waits for its change event to be confirmed
    #[serde(default = "default_event_confirm_timeout_ms")]
    pub event_confirm_timeout_ms: u64,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Superseded or deleted blobs written more recently than this are left
    /// for the sweeper instead of being released, in seconds. Covers sagas on
    /// other instances that have put the same blob but not yet committed.
    #[serde(default = "default_release_grace_period_secs")]
    pub release_grace_period_secs: u64,
}

/// Orphaned blob sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper in the background
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay between two sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Blobs younger than this are never collected, in seconds
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "picture-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "pictures".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_events_topic() -> String {
    "pictures.changes".to_string()
}

fn default_client_id() -> String {
    "picture-service".to_string()
}

fn default_security_protocol() -> String {
    "plaintext".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_message_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

fn default_attempt_timeout_ms() -> u64 {
    5000
}

fn default_window_size() -> usize {
    20
}

fn default_window_secs() -> u64 {
    30
}

fn default_minimum_calls() -> usize {
    5
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_payload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_event_confirm_timeout_ms() -> u64 {
    250
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_release_grace_period_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_grace_period_secs() -> u64 {
    60 * 60 * 12
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "picture-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/pictures").required(false))
            .add_source(config::File::with_name("/etc/pictures/pictures").required(false))
            // Override with environment variables
            // PICTURES__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("PICTURES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }
        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: "S3 requires parts of at least 5MB".to_string(),
            });
        }
        if self.orchestrator.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "orchestrator.max_payload_bytes".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sweeper.interval_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        for (name, policy) in [
            ("blob_store", &self.resilience.blob_store),
            ("metadata", &self.resilience.metadata),
            ("events", &self.resilience.events),
        ] {
            policy
                .retry
                .validate()
                .and_then(|_| policy.circuit_breaker.validate())
                .map_err(|message| ConfigError::InvalidValue {
                    key: format!("resilience.{}", name),
                    message,
                })?;
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("retry.max_attempts must be >= 1".into());
        }
        if self.multiplier < 1.0 {
            return Err("retry.multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within 0.0..=1.0".into());
        }
        if self.attempt_timeout_ms == 0 {
            return Err("retry.attempt_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl CircuitBreakerConfig {
    /// Validate configuration values.
    ///
    /// `cooldown_ms = 0` is allowed and makes an open circuit admit a probe
    /// immediately.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size < 1 {
            return Err("circuit_breaker.window_size must be >= 1".into());
        }
        if self.minimum_calls < 1 || self.minimum_calls > self.window_size {
            return Err("circuit_breaker.minimum_calls must be within 1..=window_size".into());
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err("circuit_breaker.failure_ratio must be within (0.0, 1.0]".into());
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl OrchestratorConfig {
    pub fn event_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.event_confirm_timeout_ms)
    }

    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }

    pub fn release_grace_period(&self) -> Duration {
        Duration::from_secs(self.release_grace_period_secs)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl KafkaConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            window_secs: default_window_secs(),
            minimum_calls: default_minimum_calls(),
            failure_ratio: default_failure_ratio(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            event_confirm_timeout_ms: default_event_confirm_timeout_ms(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            release_grace_period_secs: default_release_grace_period_secs(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_sweep_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}
