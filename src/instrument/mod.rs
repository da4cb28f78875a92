//! Instrument facades.
//!
//! Each facade owns one [`Session`] and exposes the operations of its
//! instrument family. Validation, interlocks and measurement orchestration
//! are delegated to the [`SafetyGuard`](crate::safety::SafetyGuard) and the
//! [`MeasurementEngine`](crate::measurement::MeasurementEngine); the facades
//! only sequence them.

pub mod models;
mod multimeter;
mod oscilloscope;
mod power_supply;

pub use models::{MultimeterModel, ScopeModel, SupplyModel};
pub use multimeter::Multimeter;
pub use oscilloscope::{Oscilloscope, ScopeChannelSettings, ScopeChannelState};
pub use power_supply::{ChannelReading, ChannelStatus, PowerSupply};

use crate::codec::{Dialect, Identity};
use crate::config::{DiscoveryMap, InstrumentDefinition, InstrumentKind, SessionSettings};
use crate::error::ConfigError;
use crate::session::{Session, SessionContext, SessionState};
use crate::transport::Transport;
use serde::Serialize;

/// Static and connection details of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentInfo {
    /// Instrument role name.
    pub instrument_id: String,
    /// Resource address.
    pub address: String,
    /// Model table in use.
    pub model: &'static str,
    /// Identity reported at connect.
    pub identity: Option<Identity>,
    /// Session state.
    pub state: SessionState,
}

impl InstrumentInfo {
    fn of<T: Transport>(session: &Session<T>, model: &'static str) -> Self {
        Self {
            instrument_id: session.context().instrument_id.clone(),
            address: session.address().to_string(),
            model,
            identity: session.identity(),
            state: session.state(),
        }
    }

    /// Whether the session was connected when the info was taken.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

/// Build a disconnected session for a configured instrument.
fn session_from_definition<T: Transport>(
    definition: &InstrumentDefinition,
    expected: InstrumentKind,
    settings: &SessionSettings,
    discovered: &DiscoveryMap,
    dialect: Dialect,
    transport: T,
) -> Result<Session<T>, ConfigError> {
    if definition.kind != expected {
        return Err(ConfigError::Validation(format!(
            "instrument '{}' is configured as {:?}, not {:?}",
            definition.id, definition.kind, expected
        )));
    }
    let address = definition.resolve_address(discovered)?;
    let context = SessionContext::from_settings(definition.id.clone(), settings);
    Ok(Session::new(address, dialect, transport, context))
}
