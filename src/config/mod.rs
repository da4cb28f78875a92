//! Lab configuration.
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `LABCTL_` (`__` separates nested
//!    keys)
//! 2. A TOML file (default: `config/labctl.toml`)
//!
//! # Example
//!
//! ```no_run
//! use labctl::config::LabConfig;
//!
//! let config = LabConfig::load_from("config/labctl.toml")?;
//! for instrument in &config.instruments {
//!     println!("{} ({:?})", instrument.id, instrument.kind);
//! }
//! # Ok::<(), labctl::error::ConfigError>(())
//! ```

mod lab_config;

pub use lab_config::{
    ApplicationConfig, ChannelDefaults, DiscoveryMap, InstrumentDefinition, InstrumentKind,
    LabConfig, SessionSettings,
};
