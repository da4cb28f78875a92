//! Measurement requests, results and the statistics engine.
//!
//! A [`MeasurementRequest`] is a value object: built once with the `with_*`
//! methods, then only read. The [`MeasurementEngine`] validates it against
//! the instrument's [`MeasurementCapability`] before anything is sent, runs
//! single readings through the session, and aggregates repeated readings
//! into a [`StatisticalSummary`].

mod engine;
mod statistics;

pub use engine::{CancelToken, MeasurementEngine};
pub use statistics::StatisticalSummary;

use crate::error::LabResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Quantity to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementFunction {
    /// DC voltage.
    DcVoltage,
    /// AC (RMS) voltage.
    AcVoltage,
    /// DC current.
    DcCurrent,
    /// AC (RMS) current.
    AcCurrent,
    /// Two-wire resistance.
    Resistance,
    /// Four-wire resistance.
    FourWireResistance,
    /// Capacitance.
    Capacitance,
    /// Signal frequency.
    Frequency,
    /// Waveform period.
    Period,
    /// Peak-to-peak voltage of a waveform.
    PeakToPeak,
    /// RMS voltage of a waveform.
    Rms,
    /// Waveform maximum.
    Maximum,
    /// Waveform minimum.
    Minimum,
    /// Waveform average.
    Average,
}

impl MeasurementFunction {
    /// SI unit of the result.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementFunction::DcCurrent | MeasurementFunction::AcCurrent => "A",
            MeasurementFunction::Resistance | MeasurementFunction::FourWireResistance => "Ω",
            MeasurementFunction::Capacitance => "F",
            MeasurementFunction::Frequency => "Hz",
            MeasurementFunction::Period => "s",
            _ => "V",
        }
    }

    /// Whether a measurement range can be selected.
    pub fn supports_range(self) -> bool {
        matches!(
            self,
            MeasurementFunction::DcVoltage
                | MeasurementFunction::AcVoltage
                | MeasurementFunction::DcCurrent
                | MeasurementFunction::AcCurrent
                | MeasurementFunction::Resistance
                | MeasurementFunction::FourWireResistance
                | MeasurementFunction::Capacitance
        )
    }

    /// Whether resolution and NPLC apply.
    pub fn supports_integration(self) -> bool {
        matches!(
            self,
            MeasurementFunction::DcVoltage
                | MeasurementFunction::DcCurrent
                | MeasurementFunction::Resistance
                | MeasurementFunction::FourWireResistance
        )
    }
}

/// Parameters of one measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRequest {
    /// Quantity to measure.
    pub function: MeasurementFunction,
    /// Input channel, for multi-input instruments.
    pub channel: Option<u8>,
    /// Measurement range; `None` selects auto-range.
    pub range: Option<f64>,
    /// Requested resolution in the unit of the function.
    pub resolution: Option<f64>,
    /// Integration time in power-line cycles.
    pub nplc: Option<f64>,
    /// Reply timeout; `None` uses the session default.
    pub timeout: Option<Duration>,
}

impl MeasurementRequest {
    /// Auto-range request with instrument defaults.
    pub fn new(function: MeasurementFunction) -> Self {
        Self {
            function,
            channel: None,
            range: None,
            resolution: None,
            nplc: None,
            timeout: None,
        }
    }

    /// Select an input channel.
    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Fix the range.
    pub fn with_range(mut self, range: f64) -> Self {
        self.range = Some(range);
        self
    }

    /// Request a resolution.
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Set the integration time.
    pub fn with_nplc(mut self, nplc: f64) -> Self {
        self.nplc = Some(nplc);
        self
    }

    /// Override the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One decoded reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementResult {
    /// Function that produced the value.
    pub function: MeasurementFunction,
    /// Reported value (raw, even when invalid).
    pub value: f64,
    /// SI unit.
    pub unit: &'static str,
    /// Time the reading was decoded.
    pub timestamp: DateTime<Utc>,
    /// False for overflow and NaN readings.
    pub valid: bool,
}

/// What an instrument can measure, and with which settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementCapability {
    /// Supported functions.
    pub functions: Vec<MeasurementFunction>,
    /// DC/AC voltage ranges, ascending.
    pub voltage_ranges: Vec<f64>,
    /// DC/AC current ranges, ascending.
    pub current_ranges: Vec<f64>,
    /// Resistance ranges, ascending.
    pub resistance_ranges: Vec<f64>,
    /// Capacitance ranges, ascending.
    pub capacitance_ranges: Vec<f64>,
    /// Selectable integration times, ascending.
    pub nplc_values: Vec<f64>,
    /// Finest resolution the instrument can deliver.
    pub resolution_floor: f64,
    /// Number of addressable inputs; 0 when requests carry no channel.
    pub channels: u8,
}

impl MeasurementCapability {
    /// Whether the instrument measures `function` at all.
    pub fn supports(&self, function: MeasurementFunction) -> bool {
        self.functions.contains(&function)
    }

    /// Ranges of `function`, if it has selectable ranges.
    pub fn ranges_for(&self, function: MeasurementFunction) -> Option<&[f64]> {
        let ranges = match function {
            MeasurementFunction::DcVoltage | MeasurementFunction::AcVoltage => {
                Some(&self.voltage_ranges)
            }
            MeasurementFunction::DcCurrent | MeasurementFunction::AcCurrent => {
                Some(&self.current_ranges)
            }
            MeasurementFunction::Resistance | MeasurementFunction::FourWireResistance => {
                Some(&self.resistance_ranges)
            }
            MeasurementFunction::Capacitance => Some(&self.capacitance_ranges),
            _ => None,
        };
        ranges
            .map(Vec::as_slice)
            .filter(|ranges| !ranges.is_empty())
    }
}

/// Instruments that take single readings and statistics.
#[async_trait]
pub trait Measure: Send + Sync {
    /// Take one reading.
    async fn measure(&self, request: &MeasurementRequest) -> LabResult<MeasurementResult>;

    /// Take `count` readings spaced by `interval` and summarize the valid
    /// ones.
    async fn measure_statistics(
        &self,
        request: &MeasurementRequest,
        count: usize,
        interval: Duration,
        cancel: &CancelToken,
    ) -> LabResult<StatisticalSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_leaves_original_untouched() {
        let base = MeasurementRequest::new(MeasurementFunction::DcVoltage);
        let ranged = base.clone().with_range(10.0).with_nplc(1.0);
        assert_eq!(base.range, None);
        assert_eq!(ranged.range, Some(10.0));
        assert_eq!(ranged.nplc, Some(1.0));
    }

    #[test]
    fn test_units() {
        assert_eq!(MeasurementFunction::DcCurrent.unit(), "A");
        assert_eq!(MeasurementFunction::FourWireResistance.unit(), "Ω");
        assert_eq!(MeasurementFunction::PeakToPeak.unit(), "V");
        assert!(!MeasurementFunction::Frequency.supports_range());
        assert_eq!(MeasurementFunction::Capacitance.unit(), "F");
        assert!(MeasurementFunction::Capacitance.supports_range());
        assert!(!MeasurementFunction::Capacitance.supports_integration());
    }

    #[test]
    fn test_capability_lookup() {
        let capability = MeasurementCapability {
            functions: vec![MeasurementFunction::DcVoltage, MeasurementFunction::Capacitance],
            voltage_ranges: vec![1.0, 10.0],
            current_ranges: Vec::new(),
            resistance_ranges: Vec::new(),
            capacitance_ranges: vec![1e-9, 1e-6],
            nplc_values: Vec::new(),
            resolution_floor: 0.0,
            channels: 0,
        };
        assert!(capability.supports(MeasurementFunction::Capacitance));
        assert!(!capability.supports(MeasurementFunction::DcCurrent));
        assert_eq!(
            capability.ranges_for(MeasurementFunction::Capacitance),
            Some(&[1e-9, 1e-6][..])
        );
        assert_eq!(capability.ranges_for(MeasurementFunction::DcCurrent), None);
        assert_eq!(capability.ranges_for(MeasurementFunction::Frequency), None);
    }
}
