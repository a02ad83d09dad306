//! Configuration management

use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;

/// Tracking id used when running in test mode without a real property
pub const TEST_TRACKING_ID: &str = "test-id";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub reporting: ReportingConfig,
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    /// Reporting API data endpoint (e.g. "https://www.googleapis.com/analytics/v3/data/ga")
    #[serde(default = "default_reporting_endpoint")]
    pub endpoint: String,
    /// View (profile) id queried as `ga:<profile_id>`
    #[serde(default)]
    pub profile_id: String,
    /// Bearer token for the reporting API, provisioned outside this service
    #[serde(default)]
    pub access_token: String,
    /// Path fragment that marks resource downloads in page paths
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Oldest day a back-fill may reach when a stream is empty
    #[serde(default = "default_epoch")]
    pub epoch: NaiveDate,
    /// Resolve dataset/resource identifiers against the catalog before writing
    #[serde(default = "default_true")]
    pub verify_entities: bool,
}

fn default_reporting_endpoint() -> String {
    "https://www.googleapis.com/analytics/v3/data/ga".to_string()
}

fn default_resource_prefix() -> String {
    "/download/".to_string()
}

fn default_page_size() -> u32 {
    10_000
}

fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2014, 1, 1).unwrap_or_default()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub tracking_id: String,
    #[serde(default = "default_collector_url")]
    pub collector_url: String,
    /// Enqueue events for API calls and resource downloads
    #[serde(default)]
    pub track_events: bool,
    /// Log events instead of sending them
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_collector_url() -> String {
    "https://www.google-analytics.com/collect".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    10
}

impl TrackingConfig {
    /// Tracking id events are sent with; the placeholder id in test mode
    pub fn effective_tracking_id(&self) -> &str {
        if self.test_mode {
            TEST_TRACKING_ID
        } else {
            &self.tracking_id
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Include download counts in dataset responses
    #[serde(default = "default_true")]
    pub show_downloads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            show_downloads: true,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("ANALYTICS")
                    .prefix_separator("_")
                    .separator("__"),
            );

        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.reporting.page_size == 0 {
            anyhow::bail!("reporting.page_size must be at least 1");
        }
        if self.reporting.resource_prefix.is_empty() {
            anyhow::bail!("reporting.resource_prefix cannot be empty");
        }

        // Without a tracking id the relay has nothing to send on behalf of
        if !self.tracking.test_mode && self.tracking.tracking_id.is_empty() {
            anyhow::bail!("Missing tracking.tracking_id in config (required unless tracking.test_mode is set)");
        }
        if self.tracking.workers == 0 {
            anyhow::bail!("tracking.workers must be at least 1");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    /// Check that the reporting API can actually be queried
    pub fn validate_reporting(&self) -> Result<()> {
        if self.reporting.profile_id.is_empty() {
            anyhow::bail!("reporting.profile_id is required to load analytics");
        }
        if self.reporting.access_token.is_empty() {
            anyhow::bail!("reporting.access_token is required to load analytics");
        }
        Ok(())
    }
}
