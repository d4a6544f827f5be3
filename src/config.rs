use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use crate::error::{AdmissionError, Result};

/// Settings file read by the binary when `ADMISSION_CONFIG` is not set
pub const DEFAULT_SETTINGS_FILE: &str = "admission.yaml";

/// Window over which a bucket regenerates its full capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub enum Interval {
    Millis(u64),
    Second,
    Minute,
    Hour,
    Day,
}

impl Interval {
    /// Convert the interval to milliseconds
    pub fn as_millis(self) -> u64 {
        match self {
            Interval::Millis(ms) => ms,
            Interval::Second => 1_000,
            Interval::Minute => 60_000,
            Interval::Hour => 3_600_000,
            Interval::Day => 86_400_000,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.as_millis())
    }
}

impl FromStr for Interval {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "second" => Ok(Interval::Second),
            "minute" => Ok(Interval::Minute),
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            other => other.parse::<u64>().map(Interval::Millis).map_err(|_| {
                AdmissionError::Config(format!(
                    "Unrecognized interval '{}': expected milliseconds or one of second, minute, hour, day",
                    s
                ))
            }),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Millis(ms) => write!(f, "{}ms", ms),
            Interval::Second => f.write_str("second"),
            Interval::Minute => f.write_str("minute"),
            Interval::Hour => f.write_str("hour"),
            Interval::Day => f.write_str("day"),
        }
    }
}

/// Wire form of an interval: a millisecond count or a symbolic name
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Millis(u64),
    Named(String),
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = AdmissionError;

    fn try_from(repr: IntervalRepr) -> Result<Self> {
        match repr {
            IntervalRepr::Millis(ms) => Ok(Interval::Millis(ms)),
            IntervalRepr::Named(name) => name.parse(),
        }
    }
}

impl From<Interval> for IntervalRepr {
    fn from(interval: Interval) -> Self {
        match interval {
            Interval::Millis(ms) => IntervalRepr::Millis(ms),
            named => IntervalRepr::Named(named.to_string()),
        }
    }
}

/// Token bucket parameters shared by every bucket a manager creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_interval: u64,
    pub interval: Interval,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_interval: 100,
            interval: Interval::Hour,
        }
    }
}

impl RateLimitConfig {
    /// Create a validated configuration
    pub fn new(tokens_per_interval: u64, interval: Interval) -> Result<Self> {
        let config = Self {
            tokens_per_interval,
            interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens_per_interval == 0 {
            return Err(AdmissionError::Config(
                "tokens_per_interval must be greater than 0".to_string(),
            ));
        }
        if self.interval.as_millis() == 0 {
            return Err(AdmissionError::Config(
                "interval must be greater than 0 milliseconds".to_string(),
            ));
        }
        Ok(())
    }

    pub fn refill_interval_ms(&self) -> u64 {
        self.interval.as_millis()
    }
}

/// Operational knobs for persistence and the bucket registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Expiry applied to persisted remaining-token counts
    pub state_ttl_secs: u64,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
    /// Maximum number of buckets held in memory
    pub max_buckets: u64,
    /// Buckets untouched for this long are evicted
    pub bucket_idle_timeout: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl_secs(),
            store_timeout: Duration::from_millis(default_store_timeout_ms()),
            max_buckets: default_max_buckets(),
            bucket_idle_timeout: Duration::from_secs(default_bucket_idle_secs()),
        }
    }
}

/// Service settings for the binary, layered from defaults, file and environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Redis connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_max_buckets")]
    pub max_buckets: u64,

    #[serde(default = "default_bucket_idle_secs")]
    pub bucket_idle_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            redis_url: None,
            rate_limit: RateLimitConfig::default(),
            state_ttl_secs: default_state_ttl_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            max_buckets: default_max_buckets(),
            bucket_idle_secs: default_bucket_idle_secs(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_state_ttl_secs() -> u64 {
    3600
}

fn default_store_timeout_ms() -> u64 {
    1000
}

fn default_max_buckets() -> u64 {
    100_000
}

fn default_bucket_idle_secs() -> u64 {
    3600
}

impl Settings {
    /// Load settings from an optional YAML file and `ADMISSION__*` environment variables.
    ///
    /// The file path is `path` if given, else `ADMISSION_CONFIG`, else
    /// [`DEFAULT_SETTINGS_FILE`]. A missing file is not an error.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("ADMISSION_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_SETTINGS_FILE.to_string());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("ADMISSION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.rate_limit.validate()?;
        Ok(settings)
    }

    pub fn options(&self) -> LimiterOptions {
        LimiterOptions {
            state_ttl_secs: self.state_ttl_secs,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            max_buckets: self.max_buckets,
            bucket_idle_timeout: Duration::from_secs(self.bucket_idle_secs),
        }
    }
}

/// Load a rate limit configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitConfig> {
    let config: RateLimitConfig = serde_yaml::from_str(yaml)
        .map_err(|e| AdmissionError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load a rate limit configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<RateLimitConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
