// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing, environment overrides, validation and defaults.
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::snapshot::Category;
use crate::{
    DEFAULT_BASE_DELAY_SECS, DEFAULT_BROKER_ADDRESS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_CPU_WINDOW_MS, DEFAULT_INTERVAL_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_SAMPLE_TIMEOUT_SECS, DEFAULT_SEND_TIMEOUT_MS, ENV_PREFIX, MAX_BASE_DELAY_SECS,
    MAX_INTERVAL_SECS, MAX_RETRIES_LIMIT,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Sampling loop settings
    #[serde(default)]
    pub agent: GeneralConfig,

    /// Broker connection settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Retry policy for each publish
    #[serde(default)]
    pub publish: PublishConfig,

    /// Category to channel bindings
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Where OS counters are read from
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Defaults plus environment overrides, for hosts without a config file
    pub fn from_env() -> ConfigResult<Self> {
        let figment = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(ConfigError::parse_error)?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> ConfigResult<Self> {
        let config: Self = figment.extract().map_err(ConfigError::parse_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let interval = match seconds_within(self.agent.interval_secs, MAX_INTERVAL_SECS) {
            Some(interval) if !interval.is_zero() => interval,
            _ => {
                return Err(ConfigError::invalid_value(
                    "agent.interval_secs",
                    format!(
                        "Sampling interval must be at least 1ns and at most {}s",
                        MAX_INTERVAL_SECS
                    ),
                ))
            }
        };

        if seconds_within(self.publish.base_delay_secs, MAX_BASE_DELAY_SECS).is_none() {
            return Err(ConfigError::invalid_value(
                "publish.base_delay_secs",
                format!("Base delay must be between 0 and {}s", MAX_BASE_DELAY_SECS),
            ));
        }

        if self.agent.cpu_window() >= interval {
            return Err(ConfigError::invalid_value(
                "agent.cpu_window_ms",
                "CPU window must be shorter than the sampling interval",
            ));
        }

        if let Some(limit) = self.agent.sample_timeout() {
            if self.agent.cpu_window() >= limit {
                return Err(ConfigError::invalid_value(
                    "agent.cpu_window_ms",
                    "CPU window must be shorter than the sample timeout",
                ));
            }
        }

        if self.publish.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid_value(
                "publish.max_retries",
                format!("Retry count cannot exceed {}", MAX_RETRIES_LIMIT),
            ));
        }

        if self.broker.address.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "broker.address",
                "Broker address must not be empty",
            ));
        }

        if self.broker.send_timeout_ms == 0 || self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "broker",
                "Broker timeouts must be greater than zero",
            ));
        }

        self.channels.validate()?;
        self.logging.validate()?;

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Agent Configuration
// ----------------------------------------------------------------------------

/// Sampling loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seconds between cycles; also the divisor for network rates
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,

    /// Host identifier override; read from the counter source when unset
    #[serde(default)]
    pub hostname: Option<String>,

    /// Upper bound on a single sample call, 0 disables the watchdog
    #[serde(default = "default_sample_timeout_secs")]
    pub sample_timeout_secs: u64,

    /// Gap between the two tick readings CPU utilization is measured over
    #[serde(default = "default_cpu_window_ms")]
    pub cpu_window_ms: u64,
}

impl GeneralConfig {
    /// Falls back to the default for values `validate` rejects.
    pub fn interval(&self) -> Duration {
        seconds_within(self.interval_secs, MAX_INTERVAL_SECS)
            .filter(|interval| !interval.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_INTERVAL_SECS))
    }

    pub fn cpu_window(&self) -> Duration {
        Duration::from_millis(self.cpu_window_ms)
    }

    pub fn sample_timeout(&self) -> Option<Duration> {
        (self.sample_timeout_secs > 0).then(|| Duration::from_secs(self.sample_timeout_secs))
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            hostname: None,
            sample_timeout_secs: default_sample_timeout_secs(),
            cpu_window_ms: default_cpu_window_ms(),
        }
    }
}

/// `secs` as a `Duration`, if it is finite, not negative and at most `max`.
fn seconds_within(secs: f64, max: u64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| *duration <= Duration::from_secs(max))
}

fn default_interval_secs() -> f64 {
    DEFAULT_INTERVAL_SECS
}

fn default_sample_timeout_secs() -> u64 {
    DEFAULT_SAMPLE_TIMEOUT_SECS
}

fn default_cpu_window_ms() -> u64 {
    DEFAULT_CPU_WINDOW_MS
}

// ----------------------------------------------------------------------------
// Broker Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `host:port` of the broker
    #[serde(default = "default_broker_address")]
    pub address: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on one send + flush round trip
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

fn default_broker_address() -> String {
    DEFAULT_BROKER_ADDRESS.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

// ----------------------------------------------------------------------------
// Publish Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Retries after the first attempt times out
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles on every further retry
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
}

impl PublishConfig {
    /// Falls back to the default for values `validate` rejects.
    pub fn base_delay(&self) -> Duration {
        seconds_within(self.base_delay_secs, MAX_BASE_DELAY_SECS)
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_BASE_DELAY_SECS))
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_secs() -> f64 {
    DEFAULT_BASE_DELAY_SECS
}

// ----------------------------------------------------------------------------
// Channel Bindings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_cpu_channel")]
    pub cpu: String,
    #[serde(default = "default_memory_channel")]
    pub memory: String,
    #[serde(default = "default_disk_channel")]
    pub disk: String,
    #[serde(default = "default_network_channel")]
    pub network: String,
}

impl ChannelsConfig {
    pub fn channel_for(&self, category: Category) -> &str {
        match category {
            Category::Cpu => &self.cpu,
            Category::Memory => &self.memory,
            Category::Disk => &self.disk,
            Category::Network => &self.network,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen: Vec<&str> = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let channel = self.channel_for(category).trim();
            if channel.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("channels.{}", category),
                    "Channel name must not be empty",
                ));
            }
            if seen.contains(&channel) {
                return Err(ConfigError::invalid_value(
                    format!("channels.{}", category),
                    format!("Channel '{}' is bound to more than one category", channel),
                ));
            }
            seen.push(channel);
        }
        Ok(())
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_channel(),
            memory: default_memory_channel(),
            disk: default_disk_channel(),
            network: default_network_channel(),
        }
    }
}

fn default_cpu_channel() -> String {
    Category::Cpu.default_channel().to_string()
}

fn default_memory_channel() -> String {
    Category::Memory.default_channel().to_string()
}

fn default_disk_channel() -> String {
    Category::Disk.default_channel().to_string()
}

fn default_network_channel() -> String {
    Category::Network.default_channel().to_string()
}

// ----------------------------------------------------------------------------
// Counter Source Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    #[serde(default = "default_sys_root")]
    pub sys_root: PathBuf,

    /// Filesystem whose usage is reported in disk snapshots
    #[serde(default = "default_usage_path")]
    pub usage_path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            sys_root: default_sys_root(),
            usage_path: default_usage_path(),
        }
    }
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_sys_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_usage_path() -> PathBuf {
    PathBuf::from("/")
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Persist records to `directory/file_name`
    #[serde(default = "default_true")]
    pub file: bool,

    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_log_file_name")]
    pub file_name: String,
}

impl LoggingConfig {
    pub const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];
    pub const FORMATS: [&'static str; 3] = ["pretty", "compact", "json"];

    pub fn file_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    fn validate(&self) -> ConfigResult<()> {
        if !Self::LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("Unknown level '{}', expected one of {:?}", self.level, Self::LEVELS),
            ));
        }
        if !Self::FORMATS.contains(&self.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown format '{}', expected one of {:?}", self.format, Self::FORMATS),
            ));
        }
        if self.file && self.file_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "logging.file_name",
                "File name must not be empty when file logging is enabled",
            ));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: true,
            colors: true,
            file: true,
            directory: default_log_directory(),
            file_name: default_log_file_name(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("/logs/telemetry")
}

fn default_log_file_name() -> String {
    "metrics.log".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RetryPolicy;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.interval_secs, 2.0);
        assert_eq!(config.publish.max_retries, 3);
        assert_eq!(config.publish.base_delay(), Duration::from_secs(1));
        assert_eq!(config.broker.address, "kafka:9092");
        assert_eq!(config.channels.channel_for(Category::Network), "network_stats");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let toml = r#"
            [agent]
            interval_secs = 5

            [publish]
            max_retries = 5
            base_delay_secs = 0.5

            [channels]
            cpu = "host.cpu"
        "#;

        let config = AgentConfig::from_str(toml).unwrap();
        assert_eq!(config.agent.interval(), Duration::from_secs(5));
        assert_eq!(config.publish.max_retries, 5);
        assert_eq!(config.publish.base_delay(), Duration::from_millis(500));
        assert_eq!(config.channels.cpu, "host.cpu");
        assert_eq!(config.channels.memory, "memory_stats");
    }

    #[test]
    fn test_invalid_interval() {
        let err = AgentConfig::from_str("[agent]\ninterval_secs = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "agent.interval_secs"
        ));
    }

    #[rstest]
    #[case::tiny_interval("[agent]\ninterval_secs = 1e-12", "agent.interval_secs")]
    #[case::negative_interval("[agent]\ninterval_secs = -2", "agent.interval_secs")]
    #[case::huge_interval("[agent]\ninterval_secs = 1e30", "agent.interval_secs")]
    #[case::interval_over_a_day("[agent]\ninterval_secs = 86401", "agent.interval_secs")]
    #[case::negative_base_delay("[publish]\nbase_delay_secs = -1", "publish.base_delay_secs")]
    #[case::huge_base_delay("[publish]\nbase_delay_secs = 1e30", "publish.base_delay_secs")]
    #[case::nan_base_delay("[publish]\nbase_delay_secs = nan", "publish.base_delay_secs")]
    #[case::window_not_below_interval(
        "[agent]\ninterval_secs = 0.1\ncpu_window_ms = 100",
        "agent.cpu_window_ms"
    )]
    #[case::window_not_below_timeout(
        "[agent]\nsample_timeout_secs = 1\ncpu_window_ms = 1000",
        "agent.cpu_window_ms"
    )]
    fn test_durations_out_of_range_rejected(#[case] toml: &str, #[case] expected_field: &str) {
        let err = AgentConfig::from_str(toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == expected_field),
            "{}",
            err
        );
    }

    #[test]
    fn test_duration_bounds_are_inclusive() {
        let toml = "[agent]\ninterval_secs = 86400\n[publish]\nbase_delay_secs = 3600";
        let config = AgentConfig::from_str(toml).unwrap();
        assert_eq!(config.agent.interval(), Duration::from_secs(86_400));
        let policy = RetryPolicy::from_config(&config.publish);
        assert_eq!(policy.delay_for(1), Duration::from_secs(3600));
    }

    #[test]
    fn test_accessors_do_not_panic_on_unvalidated_values() {
        let mut config = AgentConfig::default();
        config.agent.interval_secs = 1e-12;
        config.publish.base_delay_secs = 1e30;

        assert_eq!(config.agent.interval(), Duration::from_secs(2));
        assert_eq!(config.publish.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_base_delay_allowed() {
        let config = AgentConfig::from_str("[publish]\nbase_delay_secs = 0").unwrap();
        assert_eq!(config.publish.base_delay(), Duration::ZERO);
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let toml = "[channels]\ncpu = \"shared\"\nmemory = \"shared\"";
        let err = AgentConfig::from_str(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "channels.memory"
        ));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let err = AgentConfig::from_str("[logging]\nformat = \"xml\"").unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn test_generate_default_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        let parsed = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, AgentConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AgentConfig::load("/nonexistent/telemetry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("telemetry.toml", "[broker]\naddress = \"broker-a:9092\"")?;
            jail.set_env("TELEMETRY_BROKER__ADDRESS", "broker-b:9092");
            jail.set_env("TELEMETRY_PUBLISH__MAX_RETRIES", "1");

            let config = AgentConfig::load("telemetry.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.broker.address, "broker-b:9092");
            assert_eq!(config.publish.max_retries, 1);
            Ok(())
        });
    }

    #[test]
    fn test_load_from_tempfile() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\nfile = false").unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.file);
    }
}
