use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::flow::MAX_CAPACITY;

/// Top-level configuration for the tcpflowspy agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Flow table sizing and drain behaviour.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Idle flow pruning.
    #[serde(default)]
    pub prune: PruneConfig,

    /// Where observation events are read from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Where drained records are written.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often tracker counters are published. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Flow table configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Maximum simultaneously tracked flows, rounded up to a power of two.
    /// Default: 4096.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Hash buckets in the flow index. Default: same as the rounded capacity.
    #[serde(default)]
    pub index_buckets: Option<usize>,

    /// Only track flows with this port on either end. 0 tracks everything.
    #[serde(default)]
    pub port: u16,

    /// Report finished flows only, or also changed active ones.
    #[serde(default)]
    pub mode: DrainMode,

    /// Congestion window histogram shape.
    #[serde(default)]
    pub histogram: HistogramConfig,
}

/// Congestion window histogram shape.
#[derive(Debug, Clone, Deserialize)]
pub struct HistogramConfig {
    /// Number of buckets. Default: 1.
    #[serde(default = "default_histogram_buckets")]
    pub buckets: usize,

    /// Width of each bucket in segments. Default: 1.
    #[serde(default = "default_bucket_width")]
    pub bucket_width: u32,
}

/// Which records a drain reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// Finished flows only.
    #[default]
    Batch,
    /// Finished flows first, then active flows with unreported changes.
    Live,
}

impl fmt::Display for DrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Batch => "batch",
            Self::Live => "live",
        })
    }
}

/// Idle flow pruning.
#[derive(Debug, Clone, Deserialize)]
pub struct PruneConfig {
    /// Sweep period. Default: 1s.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Flows without packets for longer than this are finished. Default: 120s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// File of fixed-size event samples. "-" reads stdin. Default: "-".
    #[serde(default = "default_stdio_path")]
    pub path: String,
}

/// Record sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Output file. "-" writes stdout. Default: "-".
    #[serde(default = "default_stdio_path")]
    pub path: String,

    /// Initial drain buffer size in bytes. Grown on demand. Default: 4096.
    #[serde(default = "default_sink_buffer_size")]
    pub buffer_size: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_capacity() -> usize {
    4096
}

fn default_histogram_buckets() -> usize {
    1
}

fn default_bucket_width() -> u32 {
    1
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_stdio_path() -> String {
    "-".to_string()
}

fn default_sink_buffer_size() -> usize {
    4096
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracker: TrackerConfig::default(),
            prune: PruneConfig::default(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            index_buckets: None,
            port: 0,
            mode: DrainMode::default(),
            histogram: HistogramConfig::default(),
        }
    }
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            buckets: default_histogram_buckets(),
            bucket_width: default_bucket_width(),
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval: default_prune_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_stdio_path(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_stdio_path(),
            buffer_size: default_sink_buffer_size(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let tracker = &self.tracker;
        if tracker.capacity == 0 {
            bail!("tracker.capacity must be positive");
        }
        if tracker.capacity > MAX_CAPACITY {
            bail!("tracker.capacity must be at most {MAX_CAPACITY}");
        }
        if tracker.index_buckets == Some(0) {
            bail!("tracker.index_buckets must be positive when set");
        }
        if tracker.histogram.buckets == 0 {
            bail!("tracker.histogram.buckets must be positive");
        }
        if tracker.histogram.bucket_width == 0 {
            bail!("tracker.histogram.bucket_width must be positive");
        }

        if self.prune.interval.is_zero() {
            bail!("prune.interval must be positive");
        }
        if self.prune.idle_timeout.is_zero() {
            bail!("prune.idle_timeout must be positive");
        }

        if self.source.path.is_empty() {
            bail!("source.path is required");
        }
        if self.sink.path.is_empty() {
            bail!("sink.path is required");
        }
        if self.sink.buffer_size == 0 {
            bail!("sink.buffer_size must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        Ok(())
    }
}
