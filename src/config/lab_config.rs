//! Strongly-typed lab configuration loaded with Figment.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LABCTL_APPLICATION__LOG_LEVEL=debug
//! LABCTL_SESSION__READ_TIMEOUT_MS=5000
//! LABCTL_SESSION__MAX_RETRIES=3
//! ```

use crate::error::ConfigError;
use crate::session::InstrumentAddress;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Discovery output: instrument-type tag to resolved address.
pub type DiscoveryMap = HashMap<String, String>;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Session timeouts and retry settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// `[session]` section, shared by every instrument session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Transport open and identity query timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Default reply timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Time to wait for exclusive session access
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Retries after a transient write failure; 0 means a single attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Maximum error-queue entries drained after each command
    #[serde(default = "default_error_queue_depth")]
    pub error_queue_depth: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            error_queue_depth: default_error_queue_depth(),
        }
    }
}

/// Instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// DC power supply
    PowerSupply,
    /// Digital multimeter
    Multimeter,
    /// Oscilloscope
    Oscilloscope,
}

/// Instrument definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Instrument-role name, unique
    pub id: String,
    /// Instrument family
    pub kind: InstrumentKind,
    /// Explicit resource address (e.g. "TCPIP0::192.168.1.50::5025::SOCKET")
    #[serde(default)]
    pub address: Option<String>,
    /// Tag looked up in the discovery output when no address is given
    #[serde(default)]
    pub discovery_tag: Option<String>,
    /// Model name (e.g. "2230", "DMM6500"); the identity is checked against it
    #[serde(default)]
    pub model: Option<String>,
    /// Per-channel defaults, applied on request
    #[serde(default)]
    pub channels: Vec<ChannelDefaults>,
}

/// Default configuration of one supply channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefaults {
    /// Channel number
    pub channel: u8,
    /// Voltage setpoint in volts
    pub voltage: f64,
    /// Current limit in amperes
    pub current_limit: f64,
    /// Optional OVP level in volts
    #[serde(default)]
    pub ovp_level: Option<f64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    2000
}

fn default_acquire_timeout() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_error_queue_depth() -> usize {
    20
}

impl LabConfig {
    /// Load from `config/labctl.toml` and `LABCTL_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/labctl.toml")
    }

    /// Load from a specific file, merged with environment overrides, and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or a value is
    /// invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let session = &self.session;
        for (name, value) in [
            ("connect_timeout_ms", session.connect_timeout_ms),
            ("read_timeout_ms", session.read_timeout_ms),
            ("acquire_timeout_ms", session.acquire_timeout_ms),
            ("initial_backoff_ms", session.initial_backoff_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("session.{name} must be > 0")));
            }
        }
        if session.error_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "session.error_queue_depth must be > 0".into(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            instrument.validate()?;
        }

        Ok(())
    }

    /// Look up an instrument by role name.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|inst| inst.id == id)
    }

    /// Instruments of one family.
    pub fn instruments_by_kind(&self, kind: InstrumentKind) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.kind == kind)
            .collect()
    }
}

impl InstrumentDefinition {
    fn validate(&self) -> Result<(), ConfigError> {
        let has_address = self.address.as_deref().is_some_and(|a| !a.trim().is_empty());
        let has_tag = self
            .discovery_tag
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if !has_address && !has_tag {
            return Err(ConfigError::Validation(format!(
                "Instrument '{}' needs an 'address' or a 'discovery_tag'",
                self.id
            )));
        }

        if !self.channels.is_empty() && self.kind != InstrumentKind::PowerSupply {
            return Err(ConfigError::Validation(format!(
                "Instrument '{}': channel defaults only apply to power supplies",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for defaults in &self.channels {
            if defaults.channel == 0 || !seen.insert(defaults.channel) {
                return Err(ConfigError::Validation(format!(
                    "Instrument '{}': channel {} is zero or listed twice",
                    self.id, defaults.channel
                )));
            }
            if defaults.current_limit.is_nan() || defaults.current_limit <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Instrument '{}': channel {} current_limit must be > 0",
                    self.id, defaults.channel
                )));
            }
            if defaults.voltage < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Instrument '{}': channel {} voltage must be >= 0",
                    self.id, defaults.channel
                )));
            }
        }
        Ok(())
    }

    /// The explicit address, or the discovered address of `discovery_tag`.
    pub fn resolve_address(&self, discovered: &DiscoveryMap) -> Result<InstrumentAddress, ConfigError> {
        if let Some(address) = self.address.as_deref().filter(|a| !a.trim().is_empty()) {
            return Ok(InstrumentAddress::new(address));
        }
        self.discovery_tag
            .as_ref()
            .and_then(|tag| discovered.get(tag))
            .map(|address| InstrumentAddress::new(address.as_str()))
            .ok_or_else(|| ConfigError::Unresolved {
                id: self.id.clone(),
                tag: self.discovery_tag.clone(),
            })
    }

    /// Defaults for one channel, if configured.
    pub fn channel_defaults(&self, channel: u8) -> Option<&ChannelDefaults> {
        self.channels.iter().find(|d| d.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LAB_TOML: &str = r#"
[application]
name = "bench 3"
log_level = "debug"

[session]
read_timeout_ms = 3000

[[instruments]]
id = "psu"
kind = "power_supply"
address = "TCPIP0::192.168.1.50::5025::SOCKET"
model = "2230"

[[instruments.channels]]
channel = 1
voltage = 5.0
current_limit = 0.5
ovp_level = 6.0

[[instruments]]
id = "dmm"
kind = "multimeter"
discovery_tag = "keithley_dmm"
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn minimal() -> LabConfig {
        LabConfig {
            application: ApplicationConfig {
                name: "test".to_string(),
                log_level: "info".to_string(),
            },
            session: SessionSettings::default(),
            instruments: vec![InstrumentDefinition {
                id: "psu".to_string(),
                kind: InstrumentKind::PowerSupply,
                address: Some("10.0.0.2:5025".to_string()),
                discovery_tag: None,
                model: None,
                channels: vec![],
            }],
        }
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(LAB_TOML);
        let config = LabConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "bench 3");
        assert_eq!(config.session.read_timeout_ms, 3000);
        assert_eq!(config.session.max_retries, 2);
        assert_eq!(config.session.initial_backoff_ms, 50);
        assert_eq!(config.instruments.len(), 2);

        let psu = config.instrument("psu").unwrap();
        assert_eq!(psu.kind, InstrumentKind::PowerSupply);
        assert_eq!(psu.channel_defaults(1).unwrap().ovp_level, Some(6.0));
        assert_eq!(config.instruments_by_kind(InstrumentKind::Multimeter).len(), 1);
    }

    #[test]
    #[serial]
    fn test_env_overrides_nested_keys() {
        let file = write_config(LAB_TOML);
        std::env::set_var("LABCTL_SESSION__READ_TIMEOUT_MS", "750");
        let loaded = LabConfig::load_from(file.path());
        std::env::remove_var("LABCTL_SESSION__READ_TIMEOUT_MS");

        assert_eq!(loaded.unwrap().session.read_timeout_ms, 750);
    }

    #[test]
    #[serial]
    fn test_unparseable_file_is_load_error() {
        let file = write_config("[application]\nname = 3\nlog_level = [\n");
        let err = LabConfig::load_from(file.path()).unwrap_err();
        assert_eq!(err.kind(), "config.load");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = minimal();
        config.instruments.push(config.instruments[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_instrument_needs_address_or_tag() {
        let mut config = minimal();
        config.instruments[0].address = None;
        assert!(config.validate().is_err());
        config.instruments[0].discovery_tag = Some("keithley_psu".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_retries_allowed_and_bad_current_rejected() {
        let mut config = minimal();
        config.session.max_retries = 0;
        assert!(config.validate().is_ok());
        let context = crate::session::SessionContext::from_settings("psu", &config.session);
        assert_eq!(context.retry.max_retries, 0);
        assert!(!context.retry.allows_another(1));

        let mut config = minimal();
        config.instruments[0].channels.push(ChannelDefaults {
            channel: 1,
            voltage: 5.0,
            current_limit: 0.0,
            ovp_level: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_address() {
        let mut discovered = DiscoveryMap::new();
        discovered.insert("keithley_dmm".to_string(), "TCPIP0::10.0.0.9::INSTR".to_string());

        let explicit = &minimal().instruments[0];
        assert_eq!(
            explicit.resolve_address(&discovered).unwrap().as_str(),
            "10.0.0.2:5025"
        );

        let mut tagged = explicit.clone();
        tagged.address = None;
        tagged.discovery_tag = Some("keithley_dmm".to_string());
        assert_eq!(
            tagged.resolve_address(&discovered).unwrap().as_str(),
            "TCPIP0::10.0.0.9::INSTR"
        );

        tagged.discovery_tag = Some("missing".to_string());
        let err = tagged.resolve_address(&discovered).unwrap_err();
        assert!(matches!(err, ConfigError::Unresolved { ref id, .. } if id == "psu"));
    }
}
