//! Safety guard: validation in front of the session, interlock latches
//! behind it.
//!
//! The guard holds two pieces of per-channel state:
//!
//! - the last configuration *committed* to the instrument (read back after a
//!   successful configure), which gates output enable;
//! - an [`InterlockState`] latch, set when the instrument reports a
//!   protection trip and cleared only by [`SafetyGuard::reset_interlock`].
//!
//! The committed configuration is a cache. A command that fails silently on
//! the hardware can make it stale until the next read-back.

use crate::codec::Command;
use crate::error::{
    ChannelFailure, Constraint, InterlockError, SessionError, ShutdownError, ValidationError,
};
use crate::session::Session;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Absolute limits of a supply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentLimits {
    /// Number of output channels (numbered from 1).
    pub channels: u8,
    /// Hardware maximum voltage per channel.
    pub max_voltage: f64,
    /// Hardware maximum current per channel.
    pub max_current: f64,
}

/// Configuration of one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel number.
    pub channel_id: u8,
    /// Voltage setpoint in volts.
    pub voltage_setpoint: Option<f64>,
    /// Current limit in amperes.
    pub current_limit: Option<f64>,
    /// Over-voltage protection level in volts.
    pub ovp_level: Option<f64>,
    /// Output relay state.
    pub output_enabled: bool,
}

impl ChannelConfig {
    /// A requested configuration with output off.
    pub fn new(channel_id: u8, voltage_setpoint: f64, current_limit: f64) -> Self {
        Self {
            channel_id,
            voltage_setpoint: Some(voltage_setpoint),
            current_limit: Some(current_limit),
            ovp_level: None,
            output_enabled: false,
        }
    }

    /// Add an OVP level.
    pub fn with_ovp(mut self, ovp_level: f64) -> Self {
        self.ovp_level = Some(ovp_level);
        self
    }
}

/// Interlock latch of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlockState {
    /// Protection has tripped and not been reset.
    pub ovp_tripped: bool,
    /// Text of the violation that set the latch.
    pub last_violation: Option<String>,
}

#[derive(Debug, Default)]
struct GuardState {
    committed: BTreeMap<u8, ChannelConfig>,
    interlocks: BTreeMap<u8, InterlockState>,
    /// OVP level last programmed per channel; survives `invalidate`.
    armed_ovp: BTreeMap<u8, f64>,
}

/// Validation and interlock tracking for one supply.
#[derive(Debug)]
pub struct SafetyGuard {
    limits: InstrumentLimits,
    state: Mutex<GuardState>,
}

impl SafetyGuard {
    /// Guard for a supply with these limits.
    pub fn new(limits: InstrumentLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Hardware limits in force.
    pub fn limits(&self) -> InstrumentLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel number must exist on this instrument.
    pub fn check_channel(&self, channel: u8) -> Result<(), ValidationError> {
        if channel == 0 || channel > self.limits.channels {
            return Err(ValidationError::OutOfRange {
                parameter: "channel",
                value: f64::from(channel),
                constraint: Constraint::ChannelRange {
                    max: self.limits.channels,
                },
            });
        }
        Ok(())
    }

    /// Reject a configuration that violates a hardware limit or its own OVP
    /// level. Nothing is sent to the instrument.
    pub fn validate_channel_config(&self, config: &ChannelConfig) -> Result<(), ValidationError> {
        self.check_channel(config.channel_id)?;
        let out_of_range = |parameter, value, constraint| ValidationError::OutOfRange {
            parameter,
            value,
            constraint,
        };

        let voltage = config
            .voltage_setpoint
            .ok_or(ValidationError::MissingPrerequisite {
                channel: config.channel_id,
                missing: "voltage_setpoint",
            })?;
        let current = config
            .current_limit
            .ok_or(ValidationError::MissingPrerequisite {
                channel: config.channel_id,
                missing: "current_limit",
            })?;

        if !voltage.is_finite() || voltage < 0.0 {
            return Err(out_of_range("voltage_setpoint", voltage, Constraint::Minimum(0.0)));
        }
        if voltage > self.limits.max_voltage {
            return Err(out_of_range(
                "voltage_setpoint",
                voltage,
                Constraint::HardwareMaximum(self.limits.max_voltage),
            ));
        }
        if !current.is_finite() || current <= 0.0 {
            return Err(out_of_range("current_limit", current, Constraint::MustBePositive));
        }
        if current > self.limits.max_current {
            return Err(out_of_range(
                "current_limit",
                current,
                Constraint::HardwareMaximum(self.limits.max_current),
            ));
        }
        if let Some(ovp) = config.ovp_level {
            if !ovp.is_finite() || ovp <= 0.0 {
                return Err(out_of_range("ovp_level", ovp, Constraint::MustBePositive));
            }
            if ovp > self.limits.max_voltage {
                return Err(out_of_range(
                    "ovp_level",
                    ovp,
                    Constraint::HardwareMaximum(self.limits.max_voltage),
                ));
            }
            if voltage > ovp {
                return Err(out_of_range("voltage_setpoint", voltage, Constraint::OvpLevel(ovp)));
            }
        }
        Ok(())
    }

    /// Fails if the channel's interlock is latched.
    pub fn check_interlock(&self, channel: u8) -> Result<(), InterlockError> {
        let state = self.lock();
        match state.interlocks.get(&channel) {
            Some(latch) if latch.ovp_tripped => Err(InterlockError::Tripped {
                channel,
                reason: latch
                    .last_violation
                    .clone()
                    .unwrap_or_else(|| "protection tripped".into()),
            }),
            _ => Ok(()),
        }
    }

    /// Output may only be enabled once a voltage and a current limit have
    /// been committed.
    pub fn check_enable_prerequisites(&self, channel: u8) -> Result<(), ValidationError> {
        let state = self.lock();
        let committed = state.committed.get(&channel);
        if committed.and_then(|c| c.voltage_setpoint).is_none() {
            return Err(ValidationError::MissingPrerequisite {
                channel,
                missing: "voltage_setpoint",
            });
        }
        if committed.and_then(|c| c.current_limit).is_none() {
            return Err(ValidationError::MissingPrerequisite {
                channel,
                missing: "current_limit",
            });
        }
        Ok(())
    }

    /// Record a configuration confirmed by read-back.
    pub fn commit_config(&self, config: ChannelConfig) {
        self.lock().committed.insert(config.channel_id, config);
    }

    /// Drop the committed configuration of a channel.
    pub fn invalidate(&self, channel: u8) {
        self.lock().committed.remove(&channel);
    }

    /// Drop every committed configuration and armed OVP level, e.g. after
    /// `*RST`.
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        state.committed.clear();
        state.armed_ovp.clear();
    }

    /// Record an OVP level the instrument accepted.
    pub fn record_ovp(&self, channel: u8, volts: f64) {
        self.lock().armed_ovp.insert(channel, volts);
    }

    /// OVP level still armed on the instrument, if one was programmed.
    pub fn armed_ovp(&self, channel: u8) -> Option<f64> {
        self.lock().armed_ovp.get(&channel).copied()
    }

    /// Last committed configuration.
    pub fn channel_config(&self, channel: u8) -> Option<ChannelConfig> {
        self.lock().committed.get(&channel).copied()
    }

    /// Update the logical output state of a committed channel.
    pub fn mark_output(&self, channel: u8, enabled: bool) {
        if let Some(config) = self.lock().committed.get_mut(&channel) {
            config.output_enabled = enabled;
        }
    }

    /// Latch the interlock and mark the output disabled.
    pub fn record_trip(&self, channel: u8, reason: &str) {
        warn!(channel, reason, "protection trip latched");
        let mut state = self.lock();
        let latch = state.interlocks.entry(channel).or_default();
        latch.ovp_tripped = true;
        latch.last_violation = Some(reason.to_string());
        if let Some(config) = state.committed.get_mut(&channel) {
            config.output_enabled = false;
        }
    }

    /// Inspect a failed transaction for protection trips reported through
    /// the error queue. Returns whether a trip was latched.
    pub fn observe(&self, channel: u8, err: &SessionError) -> bool {
        match err.device_errors().iter().find(|e| e.is_protection_trip()) {
            Some(entry) => {
                self.record_trip(channel, &entry.to_string());
                true
            }
            None => false,
        }
    }

    /// Current latch of a channel.
    pub fn get_interlock_state(&self, channel: u8) -> InterlockState {
        self.lock()
            .interlocks
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Acknowledge a trip.
    pub fn reset_interlock(&self, channel: u8) {
        if self.lock().interlocks.remove(&channel).is_some() {
            info!(channel, "interlock reset");
        }
    }

    /// Switch off every channel in one sweep.
    ///
    /// Continues through per-channel failures and reports all of them. Runs
    /// against a Faulted session too, as long as its transport is open.
    pub async fn emergency_shutdown<T: Transport>(
        &self,
        session: &Session<T>,
    ) -> Result<(), ShutdownError> {
        let channels = 1..=self.limits.channels;
        warn!(channels = self.limits.channels, "emergency shutdown sweep");

        let mut failures = Vec::new();
        let mut guard = match session.acquire().await {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(error = %e, "emergency shutdown could not acquire the session");
                failures.extend(channels.clone().map(|channel| ChannelFailure {
                    channel,
                    kind: e.kind(),
                    detail: e.to_string(),
                }));
                None
            }
        };

        if let Some(guard) = guard.as_mut() {
            for channel in channels {
                let command = Command::SetOutput {
                    channel,
                    enabled: false,
                };
                match guard.execute_best_effort(&command).await {
                    Ok(_) => self.mark_output(channel, false),
                    Err(e) => {
                        self.observe(channel, &e);
                        error!(channel, error = %e, "failed to disable output");
                        failures.push(ChannelFailure {
                            channel,
                            kind: e.kind(),
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }

        if failures.is_empty() {
            info!("all outputs disabled");
            Ok(())
        } else {
            Err(ShutdownError::PartialFailure { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeviceErrorEntry;

    fn guard() -> SafetyGuard {
        SafetyGuard::new(InstrumentLimits {
            channels: 3,
            max_voltage: 30.0,
            max_current: 3.0,
        })
    }

    fn violated(result: Result<(), ValidationError>) -> (&'static str, Constraint) {
        match result {
            Err(ValidationError::OutOfRange {
                parameter,
                constraint,
                ..
            }) => (parameter, constraint),
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_voltage_above_ovp_names_ovp_constraint() {
        let guard = guard();
        let config = ChannelConfig::new(1, 6.5, 1.0).with_ovp(6.0);
        assert_eq!(
            violated(guard.validate_channel_config(&config)),
            ("voltage_setpoint", Constraint::OvpLevel(6.0))
        );
    }

    #[test]
    fn test_hardware_limits() {
        let guard = guard();
        assert_eq!(
            violated(guard.validate_channel_config(&ChannelConfig::new(1, 31.0, 1.0))),
            ("voltage_setpoint", Constraint::HardwareMaximum(30.0))
        );
        assert_eq!(
            violated(guard.validate_channel_config(&ChannelConfig::new(1, 5.0, 3.5))),
            ("current_limit", Constraint::HardwareMaximum(3.0))
        );
        assert_eq!(
            violated(guard.validate_channel_config(&ChannelConfig::new(1, 5.0, 0.0))),
            ("current_limit", Constraint::MustBePositive)
        );
        assert_eq!(
            violated(guard.validate_channel_config(&ChannelConfig::new(4, 5.0, 1.0))),
            ("channel", Constraint::ChannelRange { max: 3 })
        );
        assert!(guard
            .validate_channel_config(&ChannelConfig::new(3, 30.0, 3.0).with_ovp(30.0))
            .is_ok());
    }

    #[test]
    fn test_enable_requires_committed_setpoints() {
        let guard = guard();
        assert_eq!(
            guard.check_enable_prerequisites(1),
            Err(ValidationError::MissingPrerequisite {
                channel: 1,
                missing: "voltage_setpoint"
            })
        );
        guard.commit_config(ChannelConfig::new(1, 5.0, 1.0));
        assert!(guard.check_enable_prerequisites(1).is_ok());
        guard.invalidate(1);
        assert!(guard.check_enable_prerequisites(1).is_err());
    }

    #[test]
    fn test_trip_latches_until_reset() {
        let guard = guard();
        guard.commit_config(ChannelConfig::new(2, 5.0, 1.0));
        guard.mark_output(2, true);

        let err = SessionError::DeviceError {
            command: "CH2 output on".into(),
            errors: vec![DeviceErrorEntry::new(801, "Over voltage protection tripped")],
        };
        assert!(guard.observe(2, &err));
        assert!(guard.get_interlock_state(2).ovp_tripped);
        assert!(!guard.channel_config(2).unwrap().output_enabled);
        assert!(matches!(
            guard.check_interlock(2),
            Err(InterlockError::Tripped { channel: 2, .. })
        ));

        // a later successful commit does not clear the latch
        guard.commit_config(ChannelConfig::new(2, 4.0, 1.0));
        assert!(guard.check_interlock(2).is_err());

        guard.reset_interlock(2);
        assert!(guard.check_interlock(2).is_ok());
        assert_eq!(guard.get_interlock_state(2), InterlockState::default());
    }

    #[test]
    fn test_non_trip_device_error_is_ignored() {
        let guard = guard();
        let err = SessionError::DeviceError {
            command: "CH1 voltage".into(),
            errors: vec![DeviceErrorEntry::new(-222, "Data out of range")],
        };
        assert!(!guard.observe(1, &err));
        assert!(guard.check_interlock(1).is_ok());
    }
}
