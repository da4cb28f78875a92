//! Capability tables of the supported instrument models.

use crate::codec::Dialect;
use crate::error::{Constraint, ValidationError};
use crate::measurement::{MeasurementCapability, MeasurementFunction};
use crate::safety::InstrumentLimits;
use tracing::warn;

/// A power supply model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupplyModel {
    /// Display name.
    pub name: &'static str,
    /// Substring of the `*IDN?` model field identifying the model.
    pub pattern: &'static str,
    /// Command dialect.
    pub dialect: Dialect,
    /// Hardware limits.
    pub limits: InstrumentLimits,
}

impl SupplyModel {
    /// Keithley 2230 triple-channel supply.
    pub const KEITHLEY_2230: SupplyModel = SupplyModel {
        name: "Keithley 2230",
        pattern: "2230",
        dialect: Dialect::MultiChannelSupply,
        limits: InstrumentLimits {
            channels: 3,
            max_voltage: 30.0,
            max_current: 3.0,
        },
    };

    /// Keithley 2231 triple-channel supply.
    pub const KEITHLEY_2231: SupplyModel = SupplyModel {
        name: "Keithley 2231",
        pattern: "2231",
        dialect: Dialect::MultiChannelSupply,
        limits: InstrumentLimits {
            channels: 3,
            max_voltage: 30.0,
            max_current: 3.0,
        },
    };

    /// Keithley 2280S precision supply.
    pub const KEITHLEY_2280S: SupplyModel = SupplyModel {
        name: "Keithley 2280S",
        pattern: "2280",
        dialect: Dialect::SingleChannelSupply,
        limits: InstrumentLimits {
            channels: 1,
            max_voltage: 72.0,
            max_current: 6.0,
        },
    };

    /// Keithley 2260B high-voltage supply.
    pub const KEITHLEY_2260B: SupplyModel = SupplyModel {
        name: "Keithley 2260B",
        pattern: "2260",
        dialect: Dialect::SingleChannelSupply,
        limits: InstrumentLimits {
            channels: 1,
            max_voltage: 600.0,
            max_current: 10.0,
        },
    };

    /// Keithley 2268 high-voltage supply.
    pub const KEITHLEY_2268: SupplyModel = SupplyModel {
        name: "Keithley 2268",
        pattern: "2268",
        dialect: Dialect::SingleChannelSupply,
        limits: InstrumentLimits {
            channels: 1,
            max_voltage: 600.0,
            max_current: 10.0,
        },
    };

    /// Every known supply.
    pub const ALL: [SupplyModel; 5] = [
        Self::KEITHLEY_2230,
        Self::KEITHLEY_2231,
        Self::KEITHLEY_2280S,
        Self::KEITHLEY_2260B,
        Self::KEITHLEY_2268,
    ];

    /// Model whose pattern occurs in `model` (case-insensitive).
    pub fn find(model: &str) -> Option<SupplyModel> {
        let upper = model.to_ascii_uppercase();
        Self::ALL.into_iter().find(|m| upper.contains(m.pattern))
    }

    /// Model from configuration. Unknown or missing names fall back to the
    /// 2230 table.
    pub fn resolve(model: Option<&str>) -> SupplyModel {
        match model {
            Some(name) => Self::find(name).unwrap_or_else(|| {
                warn!(model = name, "unknown supply model, using 2230 parameters");
                Self::KEITHLEY_2230
            }),
            None => Self::KEITHLEY_2230,
        }
    }
}

/// A digital multimeter model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultimeterModel {
    /// Display name.
    pub name: &'static str,
    /// Substring of the `*IDN?` model field.
    pub pattern: &'static str,
}

const DMM_VOLTAGE_RANGES: [f64; 5] = [0.1, 1.0, 10.0, 100.0, 1000.0];
const DMM_CURRENT_RANGES: [f64; 9] = [1e-6, 10e-6, 100e-6, 1e-3, 10e-3, 100e-3, 1.0, 3.0, 10.0];
const DMM_RESISTANCE_RANGES: [f64; 7] = [100.0, 1e3, 10e3, 100e3, 1e6, 10e6, 100e6];
const DMM_CAPACITANCE_RANGES: [f64; 7] = [1e-9, 10e-9, 100e-9, 1e-6, 10e-6, 100e-6, 1e-3];
const DMM_NPLC: [f64; 7] = [0.01, 0.02, 0.06, 0.2, 1.0, 2.0, 10.0];

impl MultimeterModel {
    /// Keithley DMM6500 6.5-digit bench meter.
    pub const KEITHLEY_DMM6500: MultimeterModel = MultimeterModel {
        name: "Keithley DMM6500",
        pattern: "DMM6500",
    };

    /// Keithley DMM7510 7.5-digit graphical sampling meter.
    pub const KEITHLEY_DMM7510: MultimeterModel = MultimeterModel {
        name: "Keithley DMM7510",
        pattern: "DMM7510",
    };

    /// Every known multimeter.
    pub const ALL: [MultimeterModel; 2] = [Self::KEITHLEY_DMM6500, Self::KEITHLEY_DMM7510];

    /// Model from configuration, DMM6500 when unknown.
    pub fn resolve(model: Option<&str>) -> MultimeterModel {
        let Some(name) = model else {
            return Self::KEITHLEY_DMM6500;
        };
        let upper = name.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|m| upper.contains(m.pattern))
            .unwrap_or_else(|| {
                warn!(model = name, "unknown multimeter model, using DMM6500 parameters");
                Self::KEITHLEY_DMM6500
            })
    }

    /// Ranges and settings the meter accepts.
    pub fn capability(&self) -> MeasurementCapability {
        MeasurementCapability {
            functions: vec![
                MeasurementFunction::DcVoltage,
                MeasurementFunction::AcVoltage,
                MeasurementFunction::DcCurrent,
                MeasurementFunction::AcCurrent,
                MeasurementFunction::Resistance,
                MeasurementFunction::FourWireResistance,
                MeasurementFunction::Capacitance,
                MeasurementFunction::Frequency,
                MeasurementFunction::Period,
            ],
            voltage_ranges: DMM_VOLTAGE_RANGES.to_vec(),
            current_ranges: DMM_CURRENT_RANGES.to_vec(),
            resistance_ranges: DMM_RESISTANCE_RANGES.to_vec(),
            capacitance_ranges: DMM_CAPACITANCE_RANGES.to_vec(),
            nplc_values: DMM_NPLC.to_vec(),
            resolution_floor: 1e-9,
            channels: 0,
        }
    }
}

/// Vertical scales in V/div, 1-2-5 from 1 mV to 10 V.
pub const VERTICAL_SCALES: [f64; 13] = [
    1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3, 500e-3, 1.0, 2.0, 5.0, 10.0,
];

/// Timebase scales in s/div, 1-2-5 from 1 ps to 50 s.
pub const TIMEBASE_SCALES: [f64; 42] = [
    1e-12, 2e-12, 5e-12, 10e-12, 20e-12, 50e-12, 100e-12, 200e-12, 500e-12, 1e-9, 2e-9, 5e-9,
    10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, 1e-6, 2e-6, 5e-6, 10e-6, 20e-6, 50e-6, 100e-6,
    200e-6, 500e-6, 1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3, 500e-3, 1.0, 2.0, 5.0,
    10.0, 20.0, 50.0,
];

/// Probe attenuation ratios the scope accepts.
pub const PROBE_ATTENUATIONS: [f64; 5] = [0.1, 1.0, 10.0, 100.0, 1000.0];

/// An oscilloscope model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeModel {
    /// Display name.
    pub name: &'static str,
    /// Substring of the `*IDN?` model field.
    pub pattern: &'static str,
    /// Analog input channels.
    pub channels: u8,
    /// Analog bandwidth in Hz.
    pub bandwidth_hz: f64,
}

impl ScopeModel {
    /// Keysight DSOX6004A, 4 channels, 1 GHz.
    pub const KEYSIGHT_DSOX6004A: ScopeModel = ScopeModel {
        name: "Keysight DSOX6004A",
        pattern: "DSOX6004A",
        channels: 4,
        bandwidth_hz: 1e9,
    };

    /// Model from configuration, DSOX6004A when unknown.
    pub fn resolve(model: Option<&str>) -> ScopeModel {
        match model {
            Some(name) if !name.to_ascii_uppercase().contains(Self::KEYSIGHT_DSOX6004A.pattern) => {
                warn!(model = name, "unknown oscilloscope model, using DSOX6004A parameters");
                Self::KEYSIGHT_DSOX6004A
            }
            _ => Self::KEYSIGHT_DSOX6004A,
        }
    }

    /// Waveform measurements on `channels` inputs.
    pub fn capability(&self) -> MeasurementCapability {
        MeasurementCapability {
            functions: vec![
                MeasurementFunction::PeakToPeak,
                MeasurementFunction::Rms,
                MeasurementFunction::Frequency,
                MeasurementFunction::Period,
                MeasurementFunction::Maximum,
                MeasurementFunction::Minimum,
                MeasurementFunction::Average,
            ],
            voltage_ranges: Vec::new(),
            current_ranges: Vec::new(),
            resistance_ranges: Vec::new(),
            capacitance_ranges: Vec::new(),
            nplc_values: Vec::new(),
            resolution_floor: 0.0,
            channels: self.channels,
        }
    }

    /// Nearest supported vertical scale.
    pub fn snap_vertical_scale(&self, volts_per_div: f64) -> Result<f64, ValidationError> {
        snap("volts_per_div", volts_per_div, &VERTICAL_SCALES)
    }

    /// Nearest supported timebase scale.
    pub fn snap_timebase(&self, seconds_per_div: f64) -> Result<f64, ValidationError> {
        snap("seconds_per_div", seconds_per_div, &TIMEBASE_SCALES)
    }
}

/// Nearest entry of `table`, compared on a log scale so 1-2-5 steps are
/// weighted evenly across decades.
fn snap(parameter: &'static str, value: f64, table: &[f64]) -> Result<f64, ValidationError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(ValidationError::OutOfRange {
            parameter,
            value,
            constraint: Constraint::MustBePositive,
        });
    }
    let target = value.ln();
    let nearest = table
        .iter()
        .copied()
        .min_by(|a, b| (a.ln() - target).abs().total_cmp(&(b.ln() - target).abs()))
        .unwrap_or(value);
    if nearest != value {
        warn!(parameter, requested = value, applied = nearest, "scale snapped to nearest valid value");
    }
    Ok(nearest)
}
