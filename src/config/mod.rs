use crate::ledger::LedgerConfig;
use crate::reader::{ReaderConfig, ReductionPolicy};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "agent.toml";

/// Complete agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub reader: ReaderSettings,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub mocks: MocksConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Ledger identity of this agent
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
}

fn default_device_id() -> String {
    "field-agent".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
        }
    }
}

/// Reading engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderSettings {
    /// Deadline of one harvest cycle
    #[serde(default = "default_harvest_timeout_ms")]
    pub harvest_timeout_ms: u64,
    /// Deadline of one sensor bus scan
    #[serde(default = "default_bus_scan_timeout_ms")]
    pub bus_scan_timeout_ms: u64,
    #[serde(default)]
    pub reduction: ReductionPolicy,
}

fn default_harvest_timeout_ms() -> u64 {
    1000
}

fn default_bus_scan_timeout_ms() -> u64 {
    500
}

impl ReaderSettings {
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            harvest_timeout: Duration::from_millis(self.harvest_timeout_ms),
            reduction: self.reduction,
        }
    }

    pub fn bus_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_scan_timeout_ms)
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            harvest_timeout_ms: default_harvest_timeout_ms(),
            bus_scan_timeout_ms: default_bus_scan_timeout_ms(),
            reduction: ReductionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    /// Assets farther than this many metres from the device are ignored
    #[serde(default = "default_assets_locate_distance")]
    pub assets_locate_distance: f64,
}

fn default_assets_locate_distance() -> f64 {
    100.0
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            assets_locate_distance: default_assets_locate_distance(),
        }
    }
}

/// Debug environment switches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MocksConfig {
    /// Register the static mock sensor
    #[serde(default)]
    pub debug_env: bool,
    /// Noise amplitude added to mock readings
    #[serde(default)]
    pub jitter: f64,
}

/// Configuration loading failure
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl AgentConfig {
    /// Applies `AGENT_DEVICE_ID`, `AGENT_DEBUG_ENV` and `NATS_URL` overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("AGENT_DEVICE_ID").filter(|id| !id.is_empty()) {
            self.device.id = id;
        }

        if let Some(flag) = lookup("AGENT_DEBUG_ENV") {
            self.mocks.debug_env = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(url) = lookup("NATS_URL").filter(|url| !url.is_empty()) {
            self.ledger.url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.trim().is_empty() {
            return Err(ConfigError::Invalid("device.id must not be empty".to_string()));
        }

        if self.reader.harvest_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "reader.harvest_timeout_ms must be positive".to_string(),
            ));
        }

        let distance = self.geofence.assets_locate_distance;
        if !distance.is_finite() || distance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "geofence.assets_locate_distance must be a non-negative number, got {}",
                distance
            )));
        }

        if !self.mocks.jitter.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "mocks.jitter must be a finite number, got {}",
                self.mocks.jitter
            )));
        }

        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: AgentConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(config)
}

/// Resolves, loads and validates the agent configuration.
///
/// The path comes from `AGENT_CONFIG`, falling back to [`DEFAULT_CONFIG_PATH`].
/// A missing file yields defaults; environment overrides apply either way.
pub fn load_agent_config() -> Result<AgentConfig, ConfigError> {
    let path = std::env::var("AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if path.exists() {
        let config = load_config(&path)?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        AgentConfig::default()
    };

    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}
