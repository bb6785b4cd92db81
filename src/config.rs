//! Startup configuration
//!
//! Consumed once at startup; never re-read. Validation collects every
//! offending key so the operator sees the full list before exit.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Sample rates a session may default to
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [44_100, 48_000, 88_200, 96_000];

/// Server configuration tree
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RAOP terminator settings
    pub airplay: AirplayConfig,
    /// Receiver discovery and manual device settings
    pub devices: DevicesConfig,
    /// Multi-room synchronization settings
    pub synchronization: SyncConfig,
    /// Network binding settings
    pub network: NetworkConfig,
}

/// RAOP terminator settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AirplayConfig {
    /// RAOP TCP listener port
    pub port: u16,
    /// Advertised mDNS instance name
    pub service_name: String,
    /// Session default sample rate
    pub sample_rate: u32,
    /// Session default bit depth
    pub bit_depth: u8,
    /// Session default channel count
    pub channels: u8,
}

impl Default for AirplayConfig {
    fn default() -> Self {
        Self {
            port: 5001,
            service_name: "Multiroom Audio".to_string(),
            sample_rate: 44_100,
            bit_depth: 16,
            channels: 2,
        }
    }
}

/// Receiver discovery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Enable mDNS browsing
    pub auto_discovery: bool,
    /// Seconds an initial browse may take before the server proceeds
    pub discovery_timeout: u64,
    /// Pre-configured receivers
    pub manual_devices: Vec<ManualDevice>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            auto_discovery: true,
            discovery_timeout: 30,
            manual_devices: Vec::new(),
        }
    }
}

/// One pre-configured receiver
#[derive(Debug, Clone, Deserialize)]
pub struct ManualDevice {
    /// Display name
    pub name: String,
    /// IPv4 address or hostname
    pub host: String,
    /// RTSP port
    #[serde(default = "ManualDevice::default_port")]
    pub port: u16,
    /// Disabled entries are kept in the file but skipped at load
    #[serde(default = "ManualDevice::default_enabled")]
    pub enabled: bool,
}

impl ManualDevice {
    fn default_port() -> u16 {
        7000
    }

    fn default_enabled() -> bool {
        true
    }
}

/// Multi-room synchronization settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Global delay `D_g` in seconds
    pub global_delay: f64,
    /// Per-receiver base delay in seconds, keyed by receiver id
    pub device_delays: HashMap<String, f64>,
    /// Skew tolerance in milliseconds
    pub sync_tolerance: u64,
    /// Sync-check routine, `advanced` or `simple`
    pub sync_algorithm: SyncAlgorithm,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            global_delay: 0.5,
            device_delays: HashMap::new(),
            sync_tolerance: 50,
            sync_algorithm: SyncAlgorithm::Advanced,
        }
    }
}

impl SyncConfig {
    /// Global delay as a [`Duration`]
    #[must_use]
    pub fn global_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.global_delay.max(0.0))
    }

    /// Skew tolerance as a [`Duration`]
    #[must_use]
    pub fn tolerance_duration(&self) -> Duration {
        Duration::from_millis(self.sync_tolerance)
    }
}

/// Which sync-check routine the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAlgorithm {
    /// RTT measurement + filtered network-delay updates
    #[default]
    Advanced,
    /// Local deadline-adherence check only
    Simple,
}

/// Network binding settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// When false, force IPv4-only mDNS binding
    pub ipv6_enabled: bool,
    /// RTSP per-request read deadline in seconds
    pub read_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ipv6_enabled: false,
            read_timeout: 30,
        }
    }
}

/// One rejected configuration key
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    /// Dotted key path, e.g. `airplay.sample_rate`
    pub key: String,
    /// What was wrong with it
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Configuration rejected at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or parsed at all
    #[error("cannot load configuration: {0}")]
    Load(String),

    /// One or more keys held out-of-range values
    #[error("invalid configuration ({})", format_issues(.0))]
    Invalid(Vec<ConfigIssue>),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Config {
    /// Validate every key, collecting all problems before failing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing each offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.airplay.port == 0 {
            issues.push(ConfigIssue {
                key: "airplay.port".into(),
                message: "must be non-zero".into(),
            });
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.airplay.sample_rate) {
            issues.push(ConfigIssue {
                key: "airplay.sample_rate".into(),
                message: format!(
                    "{} is not one of {SUPPORTED_SAMPLE_RATES:?}",
                    self.airplay.sample_rate
                ),
            });
        }
        if self.airplay.bit_depth != 16 {
            issues.push(ConfigIssue {
                key: "airplay.bit_depth".into(),
                message: format!("{} unsupported, only 16 is accepted", self.airplay.bit_depth),
            });
        }
        if self.airplay.channels == 0 || self.airplay.channels > 2 {
            issues.push(ConfigIssue {
                key: "airplay.channels".into(),
                message: format!("{} unsupported, expected 1 or 2", self.airplay.channels),
            });
        }
        if !(0.0..=10.0).contains(&self.synchronization.global_delay) {
            issues.push(ConfigIssue {
                key: "synchronization.global_delay".into(),
                message: format!(
                    "{} out of range, expected 0.0..=10.0 seconds",
                    self.synchronization.global_delay
                ),
            });
        }
        if self.synchronization.sync_tolerance == 0 || self.synchronization.sync_tolerance > 1000 {
            issues.push(ConfigIssue {
                key: "synchronization.sync_tolerance".into(),
                message: format!(
                    "{} ms out of range, expected 1..=1000",
                    self.synchronization.sync_tolerance
                ),
            });
        }
        for (id, delay) in &self.synchronization.device_delays {
            if !(0.0..=10.0).contains(delay) {
                issues.push(ConfigIssue {
                    key: format!("synchronization.device_delays.{id}"),
                    message: format!("{delay} out of range, expected 0.0..=10.0 seconds"),
                });
            }
        }
        for (i, dev) in self.devices.manual_devices.iter().enumerate() {
            if dev.host.is_empty() {
                issues.push(ConfigIssue {
                    key: format!("devices.manual_devices[{i}].host"),
                    message: "must not be empty".into(),
                });
            }
            if dev.port == 0 {
                issues.push(ConfigIssue {
                    key: format!("devices.manual_devices[{i}].port"),
                    message: "must be non-zero".into(),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] on parse failure, or
    /// [`ConfigError::Invalid`] listing every rejected key.
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(input).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
