//! Programmable DC power supply facade.

use super::models::SupplyModel;
use super::{session_from_definition, InstrumentInfo};
use crate::codec::Command;
use crate::config::{DiscoveryMap, InstrumentDefinition, InstrumentKind, SessionSettings};
use crate::error::{LabError, LabResult, SessionError};
use crate::safety::{ChannelConfig, InterlockState, SafetyGuard};
use crate::session::{InstrumentAddress, Session, SessionContext};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Largest voltage change applied in one step while ramping.
const MAX_VOLTAGE_STEP: f64 = 5.0;
/// Setpoint read-back tolerance (1 mV / 1 mA).
const READBACK_TOLERANCE: f64 = 1e-3;
/// Current limit programmed on every channel at connect.
const SAFE_CURRENT_LIMIT: f64 = 0.1;

/// Measured output of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelReading {
    /// Channel number.
    pub channel: u8,
    /// Measured voltage in volts.
    pub voltage: f64,
    /// Measured current in amperes.
    pub current: f64,
    /// `voltage * current` in watts.
    pub power: f64,
    /// Time the current reading completed.
    pub timestamp: DateTime<Utc>,
}

/// Instrument-side state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelStatus {
    /// Channel number.
    pub channel: u8,
    /// Programmed voltage.
    pub voltage_setpoint: f64,
    /// Programmed current limit.
    pub current_limit: f64,
    /// Output relay as reported by the instrument.
    pub output_enabled: bool,
    /// Protection latch as reported by the instrument.
    pub protection_tripped: bool,
}

/// A Keithley 22xx series supply.
///
/// # Example
///
/// ```no_run
/// use labctl::instrument::{PowerSupply, SupplyModel};
/// use labctl::session::{InstrumentAddress, SessionContext};
/// use labctl::transport::TcpTransport;
///
/// # async fn run() -> labctl::error::LabResult<()> {
/// let psu = PowerSupply::new(
///     InstrumentAddress::new("TCPIP0::192.168.1.50::5025::SOCKET"),
///     SupplyModel::KEITHLEY_2230,
///     TcpTransport::default(),
///     SessionContext::new("psu"),
/// );
/// psu.connect().await?;
/// psu.configure_channel(1, 5.0, 0.5, Some(6.0)).await?;
/// psu.enable_channel_output(1).await?;
/// let reading = psu.measure_channel_output(1).await?;
/// println!("{:.3} V, {:.3} A", reading.voltage, reading.current);
/// psu.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PowerSupply<T: Transport> {
    session: Session<T>,
    safety: SafetyGuard,
    model: SupplyModel,
    defaults: Vec<ChannelConfig>,
}

impl<T: Transport> PowerSupply<T> {
    /// Supply at `address`; the identity must match `model`.
    pub fn new(
        address: InstrumentAddress,
        model: SupplyModel,
        transport: T,
        context: SessionContext,
    ) -> Self {
        let session =
            Session::new(address, model.dialect, transport, context).with_expected_model(model.pattern);
        Self {
            session,
            safety: SafetyGuard::new(model.limits),
            model,
            defaults: Vec::new(),
        }
    }

    /// Supply described by a configuration entry.
    ///
    /// Channel defaults are kept for [`apply_defaults`](Self::apply_defaults).
    pub fn from_config(
        definition: &InstrumentDefinition,
        settings: &SessionSettings,
        discovered: &DiscoveryMap,
        transport: T,
    ) -> LabResult<Self> {
        let model = SupplyModel::resolve(definition.model.as_deref());
        let mut session = session_from_definition(
            definition,
            InstrumentKind::PowerSupply,
            settings,
            discovered,
            model.dialect,
            transport,
        )?;
        if definition.model.is_some() {
            session = session.with_expected_model(model.pattern);
        }
        let defaults = definition
            .channels
            .iter()
            .map(|d| {
                let config = ChannelConfig::new(d.channel, d.voltage, d.current_limit);
                match d.ovp_level {
                    Some(ovp) => config.with_ovp(ovp),
                    None => config,
                }
            })
            .collect();
        Ok(Self {
            session,
            safety: SafetyGuard::new(model.limits),
            model,
            defaults,
        })
    }

    /// Underlying session.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Safety guard of this supply.
    pub fn safety(&self) -> &SafetyGuard {
        &self.safety
    }

    /// Model table in use.
    pub fn model(&self) -> &SupplyModel {
        &self.model
    }

    /// Connect, reset, and put every channel in a safe state
    /// (0 V, 100 mA, output off).
    pub async fn connect(&self) -> LabResult<()> {
        self.session
            .connect(self.session.context().connect_timeout)
            .await?;

        let mut bus = self.session.acquire().await?;
        bus.execute(&Command::Reset).await?;
        self.safety.invalidate_all();

        for channel in 1..=self.model.limits.channels {
            let safe_state = [
                Command::SetOutput {
                    channel,
                    enabled: false,
                },
                Command::SetVoltage {
                    channel,
                    volts: 0.0,
                },
                Command::SetCurrentLimit {
                    channel,
                    amps: SAFE_CURRENT_LIMIT,
                },
            ];
            for command in &safe_state {
                if let Err(e) = bus.execute(command).await {
                    if matches!(e, SessionError::Unreachable { .. }) {
                        return Err(e.into());
                    }
                    warn!(channel, error = %e, "failed to put channel in safe state");
                }
            }
        }
        info!(
            model = self.model.name,
            channels = self.model.limits.channels,
            max_voltage = self.model.limits.max_voltage,
            max_current = self.model.limits.max_current,
            "power supply ready"
        );
        Ok(())
    }

    /// Validate and program a channel, leaving its output off.
    ///
    /// The output is switched off first. The voltage is ramped from the
    /// present setpoint in steps of at most 5 V. The read-back setpoints are
    /// committed, not the requested ones.
    ///
    /// Without `ovp_level`, an OVP level armed by an earlier call stays in
    /// force and the new voltage is checked against it.
    pub async fn configure_channel(
        &self,
        channel: u8,
        voltage: f64,
        current_limit: f64,
        ovp_level: Option<f64>,
    ) -> LabResult<ChannelConfig> {
        let explicit_ovp = ovp_level;
        let ovp_level = explicit_ovp.or_else(|| self.safety.armed_ovp(channel));
        if explicit_ovp.is_none() {
            if let Some(armed) = ovp_level {
                debug!(channel, ovp = armed, "keeping armed OVP level");
            }
        }
        let mut requested = ChannelConfig::new(channel, voltage, current_limit);
        requested.ovp_level = ovp_level;
        self.safety.validate_channel_config(&requested)?;

        let mut bus = self.session.acquire().await?;
        self.safety.invalidate(channel);
        self.observed(
            channel,
            bus.execute(&Command::SetOutput {
                channel,
                enabled: false,
            })
            .await,
        )?;

        let start = match bus.query_number(&Command::QueryVoltageSetpoint { channel }).await {
            Ok(volts) => Some(volts),
            Err(e @ SessionError::Unreachable { .. }) => return Err(e.into()),
            Err(e) => {
                debug!(channel, error = %e, "setpoint read failed, setting voltage directly");
                None
            }
        };
        for volts in ramp_steps(start, voltage, MAX_VOLTAGE_STEP) {
            self.observed(channel, bus.execute(&Command::SetVoltage { channel, volts }).await)?;
        }
        self.observed(
            channel,
            bus.execute(&Command::SetCurrentLimit {
                channel,
                amps: current_limit,
            })
            .await,
        )?;
        if let Some(volts) = explicit_ovp {
            self.observed(channel, bus.execute(&Command::SetOvpLevel { channel, volts }).await)?;
            self.safety.record_ovp(channel, volts);
        }

        let actual_voltage = self.observed(
            channel,
            bus.query_number(&Command::QueryVoltageSetpoint { channel }).await,
        )?;
        let actual_current = self.observed(
            channel,
            bus.query_number(&Command::QueryCurrentLimit { channel }).await,
        )?;
        if (actual_voltage - voltage).abs() > READBACK_TOLERANCE {
            warn!(channel, requested = voltage, actual = actual_voltage, "voltage setpoint mismatch");
        }
        if (actual_current - current_limit).abs() > READBACK_TOLERANCE {
            warn!(channel, requested = current_limit, actual = actual_current, "current limit mismatch");
        }

        let committed = ChannelConfig {
            channel_id: channel,
            voltage_setpoint: Some(actual_voltage),
            current_limit: Some(actual_current),
            ovp_level,
            output_enabled: false,
        };
        self.safety.commit_config(committed);
        info!(
            channel,
            voltage = actual_voltage,
            current_limit = actual_current,
            ovp = ?ovp_level,
            "channel configured"
        );
        Ok(committed)
    }

    /// Configure every channel that has configured defaults.
    pub async fn apply_defaults(&self) -> LabResult<Vec<ChannelConfig>> {
        let mut applied = Vec::with_capacity(self.defaults.len());
        for defaults in &self.defaults {
            let (Some(voltage), Some(current)) = (defaults.voltage_setpoint, defaults.current_limit)
            else {
                continue;
            };
            applied.push(
                self.configure_channel(defaults.channel_id, voltage, current, defaults.ovp_level)
                    .await?,
            );
        }
        Ok(applied)
    }

    /// Switch a configured channel on.
    ///
    /// Refused while the interlock is latched or before a voltage and a
    /// current limit were committed. The output state is read back.
    pub async fn enable_channel_output(&self, channel: u8) -> LabResult<()> {
        self.safety.check_channel(channel)?;
        self.safety.check_interlock(channel)?;
        self.safety.check_enable_prerequisites(channel)?;

        let mut bus = self.session.acquire().await?;
        info!(channel, "enabling output");
        self.observed(
            channel,
            bus.execute(&Command::SetOutput {
                channel,
                enabled: true,
            })
            .await,
        )?;
        let on = self.observed(channel, bus.query_flag(&Command::QueryOutput { channel }).await)?;
        if !on {
            return Err(LabError::Verification {
                channel,
                detail: "output reads back off after enable".into(),
            });
        }
        self.safety.mark_output(channel, true);
        Ok(())
    }

    /// Switch one channel off and confirm.
    pub async fn disable_channel_output(&self, channel: u8) -> LabResult<()> {
        self.safety.check_channel(channel)?;
        let mut bus = self.session.acquire().await?;
        self.observed(
            channel,
            bus.execute(&Command::SetOutput {
                channel,
                enabled: false,
            })
            .await,
        )?;
        if bus.query_flag(&Command::QueryOutput { channel }).await? {
            return Err(LabError::Verification {
                channel,
                detail: "output reads back on after disable".into(),
            });
        }
        self.safety.mark_output(channel, false);
        debug!(channel, "output disabled");
        Ok(())
    }

    /// Switch every channel off in one best-effort sweep.
    pub async fn disable_all_outputs(&self) -> LabResult<()> {
        self.safety
            .emergency_shutdown(&self.session)
            .await
            .map_err(Into::into)
    }

    /// Measure output voltage and current of one channel.
    pub async fn measure_channel_output(&self, channel: u8) -> LabResult<ChannelReading> {
        self.safety.check_channel(channel)?;
        let mut bus = self.session.acquire().await?;
        let voltage =
            self.observed(channel, bus.query_number(&Command::MeasureVoltage { channel }).await)?;
        let current =
            self.observed(channel, bus.query_number(&Command::MeasureCurrent { channel }).await)?;
        debug!(channel, voltage, current, "channel output measured");
        Ok(ChannelReading {
            channel,
            voltage,
            current,
            power: voltage * current,
            timestamp: Utc::now(),
        })
    }

    /// Measured voltage of every channel, in channel order.
    pub async fn measure_all_voltages(&self) -> LabResult<Vec<f64>> {
        let channels = self.model.limits.channels;
        let mut bus = self.session.acquire().await?;
        Ok(bus
            .query_numbers(&Command::MeasureAllVoltages { channels })
            .await?)
    }

    /// Setpoints and relay state as reported by the instrument.
    pub async fn channel_status(&self, channel: u8) -> LabResult<ChannelStatus> {
        self.safety.check_channel(channel)?;
        let mut bus = self.session.acquire().await?;
        Ok(ChannelStatus {
            channel,
            voltage_setpoint: bus.query_number(&Command::QueryVoltageSetpoint { channel }).await?,
            current_limit: bus.query_number(&Command::QueryCurrentLimit { channel }).await?,
            output_enabled: bus.query_flag(&Command::QueryOutput { channel }).await?,
            protection_tripped: bus
                .query_flag(&Command::QueryProtectionTripped { channel })
                .await?,
        })
    }

    /// Last committed configuration of a channel.
    pub fn channel_config(&self, channel: u8) -> Option<ChannelConfig> {
        self.safety.channel_config(channel)
    }

    /// Interlock latch of a channel.
    pub fn get_interlock_state(&self, channel: u8) -> InterlockState {
        self.safety.get_interlock_state(channel)
    }

    /// Clear the protection latch on the instrument, then locally.
    ///
    /// The local latch stays set if the instrument still reports a trip.
    pub async fn reset_interlock(&self, channel: u8) -> LabResult<()> {
        self.safety.check_channel(channel)?;
        let mut bus = self.session.acquire().await?;
        bus.execute(&Command::ClearProtection { channel }).await?;
        let tripped = bus
            .query_flag(&Command::QueryProtectionTripped { channel })
            .await?;
        if tripped {
            return Err(LabError::Verification {
                channel,
                detail: "protection still latched after clear".into(),
            });
        }
        self.safety.reset_interlock(channel);
        Ok(())
    }

    /// Identity and connection details.
    pub fn instrument_info(&self) -> InstrumentInfo {
        InstrumentInfo::of(&self.session, self.model.name)
    }

    /// Switch every output off, then close the session.
    ///
    /// The session ends Disconnected even when the shutdown sweep fails; the
    /// sweep's failures are returned.
    pub async fn disconnect(&self) -> LabResult<()> {
        self.session
            .disconnect(Some(&self.safety))
            .await
            .map_err(Into::into)
    }

    /// Latch protection trips reported by a failed transaction.
    fn observed<R>(&self, channel: u8, result: Result<R, SessionError>) -> LabResult<R> {
        result.map_err(|e| {
            self.safety.observe(channel, &e);
            e.into()
        })
    }
}

/// Intermediate setpoints from `start` to `target`, each at most `max_step`
/// apart. Without a known start the target is applied directly.
fn ramp_steps(start: Option<f64>, target: f64, max_step: f64) -> Vec<f64> {
    let Some(start) = start else {
        return vec![target];
    };
    let difference = target - start;
    if difference.abs() <= max_step {
        return vec![target];
    }
    let steps = (difference.abs() / max_step) as usize + 1;
    (1..=steps)
        .map(|k| {
            if k == steps {
                target
            } else {
                start + difference * k as f64 / steps as f64
            }
        })
        .collect()
}
