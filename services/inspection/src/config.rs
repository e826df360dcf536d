use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the inspection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Photo storage configuration
    pub storage: StorageConfig,
    /// API configuration
    pub api: ApiConfig,
    /// Access-token verification
    pub auth: AuthConfig,
    /// Aggregation configuration
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Local time used for labels and editor input
    #[serde(default)]
    pub display: DisplayConfig,
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

/// S3-compatible photo storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding the inspection photos
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (Supabase storage, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access
    #[serde(default)]
    pub force_path_style: bool,
    /// Base of stored photo URLs: `{public_base_url}/{bucket}/{path}`
    pub public_base_url: String,
    /// Signed URL lifetime in seconds
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    /// Concurrent uploads per submission
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body (submissions carry base64 photos)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Access tokens issued by the auth provider
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the auth provider
    pub jwt_secret: String,
    /// Expected `aud` claim
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Expected `iss` claim, unchecked when absent
    pub issuer: Option<String>,
}

/// Refresh loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Refresh when a session is established
    #[serde(default = "default_true")]
    pub refresh_on_sign_in: bool,
    /// Pending refresh commands before senders wait
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

/// Wall-clock zone of the inspection sites
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    /// Minutes east of UTC (420 is WIB, +07:00)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl DisplayConfig {
    /// Falls back to UTC for an out-of-range offset
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

// Default value functions
fn default_service_name() -> String {
    "inspection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
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

fn default_bucket() -> String {
    "ispm-photos".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

fn default_upload_concurrency() -> usize {
    6
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_command_buffer() -> usize {
    16
}

fn default_audience() -> String {
    "authenticated".to_string()
}

fn default_utc_offset_minutes() -> i32 {
    7 * 60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "inspection-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/inspection").required(false))
            .add_source(config::File::with_name("/etc/inspection/inspection").required(false))
            // INSPECTION__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("INSPECTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        if FixedOffset::east_opt(config.display.utc_offset_minutes * 60).is_none() {
            anyhow::bail!(
                "display.utc_offset_minutes out of range: {}",
                config.display.utc_offset_minutes
            );
        }
        if config.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must be set");
        }

        Ok(config)
    }

    /// Get signed URL lifetime as Duration
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.signed_url_ttl_secs)
    }
}

impl StorageConfig {
    /// Public URL of an object path
    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            self.bucket,
            path.trim_start_matches('/')
        )
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

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            refresh_on_sign_in: true,
            command_buffer: default_command_buffer(),
        }
    }
}
