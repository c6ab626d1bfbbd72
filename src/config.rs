use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the socktrace agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Partitioned socket event queue configuration.
    #[serde(default)]
    pub protocol_analyze: ProtocolAnalyzeConfig,

    /// Per-partition analyzer configuration.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Kernel program loading configuration (used with the `bpf` feature).
    #[serde(default)]
    pub bpf: BpfConfig,

    /// How often queue and reader counters are published. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Partitioned socket event queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolAnalyzeConfig {
    /// Number of partitions, each with its own analyzer. Default: 2.
    #[serde(default = "default_parallels")]
    pub parallels: usize,

    /// Capacity of each partition queue. Default: 5000.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Kernel buffer size per CPU in bytes. Default: 400KiB.
    #[serde(default = "default_per_cpu_buffer")]
    pub per_cpu_buffer: usize,
}

/// Per-partition analyzer configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalyzerConfig {
    /// Connections without events for this long are released. Default: 1m.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Period of the idle-connection sweep. Default: 10s.
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Kernel program loading configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BpfConfig {
    /// Compiled BPF object to load.
    #[serde(default)]
    pub object_path: PathBuf,

    /// Perf event array carrying data upload records.
    #[serde(default = "default_data_map")]
    pub data_map: String,

    /// Perf event array carrying detail records.
    #[serde(default = "default_detail_map")]
    pub detail_map: String,

    /// Kprobes to attach after loading.
    #[serde(default)]
    pub kprobes: Vec<KprobeConfig>,
}

/// One kprobe program attachment.
#[derive(Debug, Clone, Deserialize)]
pub struct KprobeConfig {
    /// Program name in the BPF object.
    pub program: String,

    /// Kernel symbol to attach to.
    pub symbol: String,

    /// Fail startup if the attach fails. Default: true.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_parallels() -> usize {
    2
}

fn default_queue_size() -> usize {
    5000
}

fn default_per_cpu_buffer() -> usize {
    400 * 1024
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_data_map() -> String {
    crate::tracer::SOCKET_DATA_UPLOAD_SOURCE.to_string()
}

fn default_detail_map() -> String {
    crate::tracer::SOCKET_DETAIL_SOURCE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            protocol_analyze: ProtocolAnalyzeConfig::default(),
            analyzer: AnalyzerConfig::default(),
            health: HealthConfig::default(),
            bpf: BpfConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for ProtocolAnalyzeConfig {
    fn default() -> Self {
        Self {
            parallels: default_parallels(),
            queue_size: default_queue_size(),
            per_cpu_buffer: default_per_cpu_buffer(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::new(),
            data_map: default_data_map(),
            detail_map: default_detail_map(),
            kprobes: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_analyze.parallels == 0 {
            bail!("protocol_analyze.parallels must be positive");
        }

        if self.protocol_analyze.queue_size == 0 {
            bail!("protocol_analyze.queue_size must be positive");
        }

        if self.protocol_analyze.per_cpu_buffer == 0 {
            bail!("protocol_analyze.per_cpu_buffer must be positive");
        }

        if self.analyzer.idle_timeout.is_zero() {
            bail!("analyzer.idle_timeout must be positive");
        }

        if self.analyzer.maintenance_interval.is_zero() {
            bail!("analyzer.maintenance_interval must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.bpf.data_map.is_empty() || self.bpf.detail_map.is_empty() {
            bail!("bpf.data_map and bpf.detail_map must be set");
        }

        if self.bpf.data_map == self.bpf.detail_map {
            bail!("bpf.data_map and bpf.detail_map must differ");
        }

        Ok(())
    }
}
