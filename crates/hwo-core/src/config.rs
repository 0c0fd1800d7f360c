//! Beamline configuration.
//!
//! Loaded with `figment` in three layers, later layers winning:
//!
//! 1. Built-in defaults ([`BeamlineConfig::default`])
//! 2. A TOML file
//! 3. Environment variables prefixed `HWO_`, with `__` separating nested keys
//!    (`HWO_POLLING__DEFAULT_INTERVAL_MS=250`)
//!
//! ## Schema
//!
//! ```toml
//! name = "id29"
//!
//! [polling]
//! default_interval_ms = 500
//! freshness_ms = 1000
//!
//! [[devices]]
//! name = "sample_changer"
//! endpoint = "mock://id29/sc3"
//! kind = "sample_changer"
//! state_channel = "state"
//!
//! [[devices.channels]]
//! name = "state"
//! attribute = "State"
//! polling_ms = 200
//!
//! [[devices.channels]]
//! name = "powered"
//! attribute = "Powered"
//! ```
//!
//! `validate` runs after extraction and rejects anything that would otherwise
//! surface later as a registration failure.

use crate::error::{HwoError, HwoResult};
use crate::expression::CommandTemplate;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamlineConfig {
    /// Beamline name, for logs.
    pub name: String,
    /// Polling defaults.
    pub polling: PollingConfig,
    /// Hardware objects to build.
    pub devices: Vec<DeviceConfig>,
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        Self {
            name: "beamline".to_string(),
            polling: PollingConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// `[polling]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval for channels without `polling_ms`.
    pub default_interval_ms: u64,
    /// How long a cached value satisfies `get_value` without a read.
    pub freshness_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 500,
            freshness_ms: 1000,
        }
    }
}

impl PollingConfig {
    /// Freshness window as a `Duration`.
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

/// What kind of hardware object a device entry builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A single-valued device (motor, shutter, aperture).
    #[default]
    Actuator,
    /// A composite device whose status is aggregated from several channels.
    SampleChanger,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hardware object name.
    pub name: String,
    /// Transport endpoint, `scheme://...`.
    pub endpoint: String,
    /// Object kind.
    #[serde(default)]
    pub kind: DeviceKind,
    /// Channel whose updates become `valueChanged`.
    #[serde(default)]
    pub value_channel: Option<String>,
    /// Channel whose updates become `stateChanged`.
    #[serde(default)]
    pub state_channel: Option<String>,
    /// Channels of this device.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Opaque table handed to the transport factory.
    #[serde(default)]
    pub simulation: Option<toml::Value>,
}

/// What a channel's timeout notifications mean for its device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// The value is confirmed stable; emitted as `valueConfirmed`.
    #[default]
    Confirm,
    /// Unchanged readings are suspicious; logged as a warning.
    Warn,
}

/// One `[[devices.channels]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name, unique within the device.
    pub name: String,
    /// Device attribute. Defaults to the channel name.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Command template polled instead of the attribute.
    #[serde(default)]
    pub command: Option<String>,
    /// Poll period. Defaults to `polling.default_interval_ms`.
    #[serde(default)]
    pub polling_ms: Option<u64>,
    /// Report unchanged values as timeouts.
    #[serde(default)]
    pub compare: bool,
    /// Meaning of timeouts on this channel.
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Composite slot fed by this channel. Defaults to the channel name.
    #[serde(default)]
    pub slot: Option<String>,
}

impl ChannelConfig {
    /// Attribute to read.
    pub fn attribute(&self) -> &str {
        self.attribute.as_deref().unwrap_or(&self.name)
    }

    /// Composite slot name.
    pub fn slot(&self) -> &str {
        self.slot.as_deref().unwrap_or(&self.name)
    }

    /// Effective poll period.
    pub fn interval(&self, polling: &PollingConfig) -> Duration {
        Duration::from_millis(self.polling_ms.unwrap_or(polling.default_interval_ms))
    }
}

impl BeamlineConfig {
    /// Load from `path`, then apply `HWO_` environment overrides.
    pub fn load(path: &Path) -> HwoResult<Self> {
        if !path.exists() {
            return Err(HwoError::NotFound(format!(
                "configuration file {}",
                path.display()
            )));
        }
        debug!("Loading beamline config from: {}", path.display());

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HWO_").split("__"))
            .extract()?;
        config.validate()?;

        info!(
            beamline = %config.name,
            devices = config.devices.len(),
            "Loaded beamline config"
        );
        Ok(config)
    }

    /// Parse TOML text without environment overrides.
    pub fn from_toml_str(toml: &str) -> HwoResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks.
    pub fn validate(&self) -> HwoResult<()> {
        if self.polling.default_interval_ms == 0 {
            return Err(HwoError::configuration(
                "polling.default_interval_ms must be greater than zero",
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(HwoError::configuration(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            device.validate()?;
        }
        Ok(())
    }
}

impl DeviceConfig {
    /// Channel entry by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> HwoResult<()> {
        let ctx = |msg: String| HwoError::configuration(format!("device '{}': {msg}", self.name));

        if self.endpoint.trim().is_empty() {
            return Err(ctx("endpoint must not be empty".into()));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(ctx(format!("duplicate channel name '{}'", channel.name)));
            }
            if channel.polling_ms == Some(0) {
                return Err(ctx(format!(
                    "channel '{}' has a zero polling interval",
                    channel.name
                )));
            }
            if let Some(template) = &channel.command {
                CommandTemplate::parse(template)
                    .map_err(|e| ctx(format!("channel '{}': {e}", channel.name)))?;
            }
        }

        for (role, channel) in [
            ("value_channel", &self.value_channel),
            ("state_channel", &self.state_channel),
        ] {
            if let Some(name) = channel {
                if self.channel(name).is_none() {
                    return Err(ctx(format!("{role} '{name}' is not a configured channel")));
                }
            }
        }

        if self.kind == DeviceKind::SampleChanger {
            for required in ["state", "powered", "running"] {
                if !self.channels.iter().any(|c| c.slot() == required) {
                    return Err(ctx(format!(
                        "sample changer is missing a channel for '{required}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
