//! Shared command vocabulary.
//!
//! Every dialect encodes the same [`Command`] enum; a dialect that has no
//! equivalent for a command rejects it at encode time.

use super::ReplyShape;
use crate::measurement::MeasurementRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Oscilloscope input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coupling {
    /// AC coupled.
    Ac,
    /// DC coupled.
    Dc,
    /// Input grounded.
    Ground,
}

impl Coupling {
    pub(crate) fn token(self) -> &'static str {
        match self {
            Coupling::Ac => "AC",
            Coupling::Dc => "DC",
            Coupling::Ground => "GND",
        }
    }
}

impl std::str::FromStr for Coupling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AC" => Ok(Coupling::Ac),
            "DC" => Ok(Coupling::Dc),
            "GND" | "GROUND" => Ok(Coupling::Ground),
            other => Err(format!("coupling must be one of AC, DC, GND, got '{other}'")),
        }
    }
}

/// Screen capture image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenshotFormat {
    /// Portable Network Graphics.
    Png,
    /// Windows bitmap.
    Bmp,
}

impl ScreenshotFormat {
    pub(crate) fn token(self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "PNG",
            ScreenshotFormat::Bmp => "BMP",
        }
    }
}

/// Typed instrument operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `*IDN?`
    Identify,
    /// `*CLS`
    ClearStatus,
    /// `*RST`
    Reset,
    /// `*OPC?`
    OperationComplete,
    /// Pop one entry from the instrument error queue.
    NextError,
    /// Return the instrument to its preset configuration.
    Preset,
    /// Abort any running acquisition.
    Abort,

    /// Program a channel voltage setpoint (volts).
    SetVoltage {
        /// Output channel.
        channel: u8,
        /// Setpoint in volts.
        volts: f64,
    },
    /// Program a channel current limit (amperes).
    SetCurrentLimit {
        /// Output channel.
        channel: u8,
        /// Limit in amperes.
        amps: f64,
    },
    /// Program and arm over-voltage protection.
    SetOvpLevel {
        /// Output channel.
        channel: u8,
        /// Trip level in volts.
        volts: f64,
    },
    /// Switch a channel output on or off.
    SetOutput {
        /// Output channel.
        channel: u8,
        /// Desired state.
        enabled: bool,
    },
    /// Clear a latched over-voltage protection trip.
    ClearProtection {
        /// Output channel.
        channel: u8,
    },
    /// Read back the output enable state.
    QueryOutput {
        /// Output channel.
        channel: u8,
    },
    /// Read back the voltage setpoint.
    QueryVoltageSetpoint {
        /// Output channel.
        channel: u8,
    },
    /// Read back the current limit.
    QueryCurrentLimit {
        /// Output channel.
        channel: u8,
    },
    /// Ask whether over-voltage protection has tripped.
    QueryProtectionTripped {
        /// Output channel.
        channel: u8,
    },
    /// Measure the actual output voltage.
    MeasureVoltage {
        /// Output channel.
        channel: u8,
    },
    /// Measure the actual output current.
    MeasureCurrent {
        /// Output channel.
        channel: u8,
    },
    /// Measure every channel's output voltage in one comma-separated reply.
    MeasureAllVoltages {
        /// Number of channels the reply must contain.
        channels: u8,
    },

    /// Configure and trigger a single measurement, returning one reading.
    Measure(MeasurementRequest),

    /// Oscilloscope vertical scale (volts/div), also turns the trace on.
    SetChannelScale {
        /// Input channel.
        channel: u8,
        /// Volts per division.
        volts_per_div: f64,
    },
    /// Oscilloscope vertical offset (volts).
    SetChannelOffset {
        /// Input channel.
        channel: u8,
        /// Offset in volts.
        volts: f64,
    },
    /// Oscilloscope input coupling.
    SetChannelCoupling {
        /// Input channel.
        channel: u8,
        /// Coupling mode.
        coupling: Coupling,
    },
    /// Oscilloscope probe attenuation ratio.
    SetProbeAttenuation {
        /// Input channel.
        channel: u8,
        /// Attenuation (e.g. 10.0 for a 10:1 probe).
        ratio: f64,
    },
    /// Read back the vertical scale.
    QueryChannelScale {
        /// Input channel.
        channel: u8,
    },
    /// Read back the vertical offset.
    QueryChannelOffset {
        /// Input channel.
        channel: u8,
    },
    /// Horizontal scale (seconds/div).
    SetTimebaseScale {
        /// Seconds per division.
        seconds_per_div: f64,
    },
    /// Read back the horizontal scale.
    QueryTimebaseScale,
    /// Fetch the screen image as a definite-length binary block.
    Screenshot(ScreenshotFormat),
}

impl Command {
    /// Reply the instrument sends for this command.
    pub fn reply_shape(&self) -> ReplyShape {
        match self {
            Command::Identify => ReplyShape::Identity,
            Command::OperationComplete => ReplyShape::Flag,
            Command::NextError => ReplyShape::ErrorEntry,
            Command::QueryOutput { .. } | Command::QueryProtectionTripped { .. } => ReplyShape::Flag,
            Command::QueryVoltageSetpoint { .. }
            | Command::QueryCurrentLimit { .. }
            | Command::MeasureVoltage { .. }
            | Command::MeasureCurrent { .. }
            | Command::Measure(_)
            | Command::QueryChannelScale { .. }
            | Command::QueryChannelOffset { .. }
            | Command::QueryTimebaseScale => ReplyShape::Number,
            Command::MeasureAllVoltages { channels } => ReplyShape::Numbers(*channels as usize),
            Command::Screenshot(_) => ReplyShape::Block,
            Command::ClearStatus
            | Command::Reset
            | Command::Preset
            | Command::Abort
            | Command::SetVoltage { .. }
            | Command::SetCurrentLimit { .. }
            | Command::SetOvpLevel { .. }
            | Command::SetOutput { .. }
            | Command::ClearProtection { .. }
            | Command::SetChannelScale { .. }
            | Command::SetChannelOffset { .. }
            | Command::SetChannelCoupling { .. }
            | Command::SetProbeAttenuation { .. }
            | Command::SetTimebaseScale { .. } => ReplyShape::None,
        }
    }

    /// Whether a reply is read after writing the command.
    pub fn expects_reply(&self) -> bool {
        self.reply_shape() != ReplyShape::None
    }

    /// Output channel the command addresses, if any.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Command::SetVoltage { channel, .. }
            | Command::SetCurrentLimit { channel, .. }
            | Command::SetOvpLevel { channel, .. }
            | Command::SetOutput { channel, .. }
            | Command::ClearProtection { channel }
            | Command::QueryOutput { channel }
            | Command::QueryVoltageSetpoint { channel }
            | Command::QueryCurrentLimit { channel }
            | Command::QueryProtectionTripped { channel }
            | Command::MeasureVoltage { channel }
            | Command::MeasureCurrent { channel }
            | Command::SetChannelScale { channel, .. }
            | Command::SetChannelOffset { channel, .. }
            | Command::SetChannelCoupling { channel, .. }
            | Command::SetProbeAttenuation { channel, .. }
            | Command::QueryChannelScale { channel }
            | Command::QueryChannelOffset { channel } => Some(*channel),
            Command::Measure(request) => request.channel,
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify => write!(f, "identify"),
            Command::ClearStatus => write!(f, "clear status"),
            Command::Reset => write!(f, "reset"),
            Command::OperationComplete => write!(f, "operation complete"),
            Command::NextError => write!(f, "next error"),
            Command::Preset => write!(f, "preset"),
            Command::Abort => write!(f, "abort"),
            Command::SetVoltage { channel, volts } => write!(f, "CH{channel} voltage {volts} V"),
            Command::SetCurrentLimit { channel, amps } => {
                write!(f, "CH{channel} current limit {amps} A")
            }
            Command::SetOvpLevel { channel, volts } => write!(f, "CH{channel} OVP {volts} V"),
            Command::SetOutput { channel, enabled } => {
                write!(f, "CH{channel} output {}", if *enabled { "on" } else { "off" })
            }
            Command::ClearProtection { channel } => write!(f, "CH{channel} clear protection"),
            Command::QueryOutput { channel } => write!(f, "CH{channel} output?"),
            Command::QueryVoltageSetpoint { channel } => write!(f, "CH{channel} voltage?"),
            Command::QueryCurrentLimit { channel } => write!(f, "CH{channel} current limit?"),
            Command::QueryProtectionTripped { channel } => write!(f, "CH{channel} OVP tripped?"),
            Command::MeasureVoltage { channel } => write!(f, "CH{channel} measure voltage"),
            Command::MeasureCurrent { channel } => write!(f, "CH{channel} measure current"),
            Command::MeasureAllVoltages { .. } => write!(f, "measure all voltages"),
            Command::Measure(request) => write!(f, "measure {:?}", request.function),
            Command::SetChannelScale {
                channel,
                volts_per_div,
            } => write!(f, "CH{channel} scale {volts_per_div} V/div"),
            Command::SetChannelOffset { channel, volts } => {
                write!(f, "CH{channel} offset {volts} V")
            }
            Command::SetChannelCoupling { channel, coupling } => {
                write!(f, "CH{channel} coupling {}", coupling.token())
            }
            Command::SetProbeAttenuation { channel, ratio } => {
                write!(f, "CH{channel} probe {ratio}x")
            }
            Command::QueryChannelScale { channel } => write!(f, "CH{channel} scale?"),
            Command::QueryChannelOffset { channel } => write!(f, "CH{channel} offset?"),
            Command::SetTimebaseScale { seconds_per_div } => {
                write!(f, "timebase {seconds_per_div} s/div")
            }
            Command::QueryTimebaseScale => write!(f, "timebase?"),
            Command::Screenshot(format) => write!(f, "screenshot {}", format.token()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_shapes() {
        assert_eq!(Command::Identify.reply_shape(), ReplyShape::Identity);
        assert_eq!(
            Command::MeasureAllVoltages { channels: 3 }.reply_shape(),
            ReplyShape::Numbers(3)
        );
        assert!(!Command::SetOutput {
            channel: 1,
            enabled: true
        }
        .expects_reply());
    }

    #[test]
    fn test_coupling_parse() {
        assert_eq!("gnd".parse::<Coupling>(), Ok(Coupling::Ground));
        assert!("XYZ".parse::<Coupling>().is_err());
    }
}
