//! Command codec: typed operations to SCPI frames and back.
//!
//! The codec is pure. It never touches a transport and holds no state; a
//! [`Dialect`] is picked once per session and every command goes through its
//! `encode`/`decode` pair.
//!
//! Frames are returned without a line terminator. The transport appends its
//! own.
//!
//! ## Numeric formatting
//!
//! - Output setpoints (voltage, current, OVP level) use fixed notation with
//!   six decimals: `:VOLTage 5.000000`.
//! - Measurement and acquisition parameters use scientific notation:
//!   `:SENSe:VOLTage:DC:RESolution 1.000000E-6`.

mod command;
mod reply;

pub use command::{Command, Coupling, ScreenshotFormat};
pub use reply::{
    decode, encode_block, reading_is_valid, DeviceErrorEntry, Identity, ReplyShape, Response,
    OVERFLOW_SENTINEL,
};

pub(crate) use reply::block_header;

use crate::error::{DecodeError, EncodeError};
use crate::measurement::{MeasurementFunction, MeasurementRequest};
use serde::{Deserialize, Serialize};

/// Command dialect, chosen at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Multi-output supplies addressed with `:INSTrument:SELect CH<n>`.
    MultiChannelSupply,
    /// Single-output supplies. Only channel 1 exists.
    SingleChannelSupply,
    /// Bench multimeters with `:SENSe` function configuration and `:READ?`.
    PrecisionMultimeter,
    /// Oscilloscopes with `:CHANnel<n>` and `:MEASure` subsystems.
    Oscilloscope,
}

impl Dialect {
    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Dialect::MultiChannelSupply => "multi-channel supply",
            Dialect::SingleChannelSupply => "single-channel supply",
            Dialect::PrecisionMultimeter => "precision multimeter",
            Dialect::Oscilloscope => "oscilloscope",
        }
    }

    fn is_supply(self) -> bool {
        matches!(
            self,
            Dialect::MultiChannelSupply | Dialect::SingleChannelSupply
        )
    }

    /// Serialize a command into a frame.
    pub fn encode(self, command: &Command) -> Result<Vec<u8>, EncodeError> {
        self.encode_text(command).map(String::into_bytes)
    }

    /// Parse a reply. Identical for every dialect; kept on the dialect so a
    /// session only needs one codec handle.
    pub fn decode(self, raw: &[u8], shape: ReplyShape) -> Result<Response, DecodeError> {
        decode(raw, shape)
    }

    fn unsupported(self, command: &Command) -> EncodeError {
        EncodeError::Unsupported {
            command: command.to_string(),
            dialect: self.name(),
        }
    }

    fn encode_text(self, command: &Command) -> Result<String, EncodeError> {
        let text = match command {
            Command::Identify => "*IDN?".to_string(),
            Command::ClearStatus => "*CLS".to_string(),
            Command::Reset => "*RST".to_string(),
            Command::OperationComplete => "*OPC?".to_string(),
            Command::NextError => ":SYSTem:ERRor:NEXT?".to_string(),
            Command::Preset
                if matches!(self, Dialect::PrecisionMultimeter | Dialect::Oscilloscope) =>
            {
                ":SYSTem:PRESet".to_string()
            }
            Command::Abort if self == Dialect::PrecisionMultimeter => ":ABORt".to_string(),

            Command::SetVoltage { channel, volts } if self.is_supply() => {
                self.on_channel(command, *channel, format!(":VOLTage {volts:.6}"))?
            }
            Command::SetCurrentLimit { channel, amps } if self.is_supply() => {
                self.on_channel(command, *channel, format!(":CURRent {amps:.6}"))?
            }
            Command::SetOvpLevel { channel, volts } if self.is_supply() => self.on_channel(
                command,
                *channel,
                format!(":VOLTage:PROTection:LEVel {volts:.6};:VOLTage:PROTection:STATe ON"),
            )?,
            Command::SetOutput { channel, enabled } if self.is_supply() => self.on_channel(
                command,
                *channel,
                format!(":OUTPut {}", if *enabled { "ON" } else { "OFF" }),
            )?,
            Command::ClearProtection { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":VOLTage:PROTection:CLEar".to_string())?
            }
            Command::QueryOutput { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":OUTPut?".to_string())?
            }
            Command::QueryVoltageSetpoint { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":VOLTage?".to_string())?
            }
            Command::QueryCurrentLimit { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":CURRent?".to_string())?
            }
            Command::QueryProtectionTripped { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":VOLTage:PROTection:TRIPped?".to_string())?
            }
            Command::MeasureVoltage { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":MEASure:VOLTage?".to_string())?
            }
            Command::MeasureCurrent { channel } if self.is_supply() => {
                self.on_channel(command, *channel, ":MEASure:CURRent?".to_string())?
            }
            Command::MeasureAllVoltages { .. } if self == Dialect::MultiChannelSupply => {
                ":MEASure:VOLTage? ALL".to_string()
            }
            Command::MeasureAllVoltages { channels: 1 } if self == Dialect::SingleChannelSupply => {
                ":MEASure:VOLTage?".to_string()
            }

            Command::Measure(request) if self == Dialect::PrecisionMultimeter => {
                multimeter_measure(request).ok_or_else(|| self.unsupported(command))?
            }
            Command::Measure(request) if self == Dialect::Oscilloscope => {
                scope_measure(request).ok_or_else(|| self.unsupported(command))?
            }

            Command::SetChannelScale {
                channel,
                volts_per_div,
            } if self == Dialect::Oscilloscope => format!(
                ":CHANnel{channel}:DISPlay ON;:CHANnel{channel}:SCALe {volts_per_div:.6E}"
            ),
            Command::SetChannelOffset { channel, volts } if self == Dialect::Oscilloscope => {
                format!(":CHANnel{channel}:OFFSet {volts:.6E}")
            }
            Command::SetChannelCoupling { channel, coupling } if self == Dialect::Oscilloscope => {
                format!(":CHANnel{channel}:COUPling {}", coupling.token())
            }
            Command::SetProbeAttenuation { channel, ratio } if self == Dialect::Oscilloscope => {
                format!(":CHANnel{channel}:PROBe {ratio:.6E}")
            }
            Command::QueryChannelScale { channel } if self == Dialect::Oscilloscope => {
                format!(":CHANnel{channel}:SCALe?")
            }
            Command::QueryChannelOffset { channel } if self == Dialect::Oscilloscope => {
                format!(":CHANnel{channel}:OFFSet?")
            }
            Command::SetTimebaseScale { seconds_per_div } if self == Dialect::Oscilloscope => {
                format!(":TIMebase:SCALe {seconds_per_div:.6E}")
            }
            Command::QueryTimebaseScale if self == Dialect::Oscilloscope => {
                ":TIMebase:SCALe?".to_string()
            }
            Command::Screenshot(format) if self == Dialect::Oscilloscope => {
                format!(":DISPlay:DATA? {}", format.token())
            }

            _ => return Err(self.unsupported(command)),
        };
        Ok(text)
    }

    /// Channel-addressed supply commands. Multi-channel units select the
    /// channel in the same frame so selection and action cannot be split.
    fn on_channel(self, command: &Command, channel: u8, body: String) -> Result<String, EncodeError> {
        match self {
            Dialect::MultiChannelSupply if channel >= 1 => {
                Ok(format!(":INSTrument:SELect CH{channel};{body}"))
            }
            Dialect::SingleChannelSupply if channel == 1 => Ok(body),
            _ => Err(self.unsupported(command)),
        }
    }
}

/// SCPI function token and the `:SENSe` subsystem prefix for it.
fn multimeter_function(function: MeasurementFunction) -> Option<&'static str> {
    match function {
        MeasurementFunction::DcVoltage => Some("VOLTage:DC"),
        MeasurementFunction::AcVoltage => Some("VOLTage:AC"),
        MeasurementFunction::DcCurrent => Some("CURRent:DC"),
        MeasurementFunction::AcCurrent => Some("CURRent:AC"),
        MeasurementFunction::Resistance => Some("RESistance"),
        MeasurementFunction::FourWireResistance => Some("FRESistance"),
        MeasurementFunction::Capacitance => Some("CAPacitance"),
        MeasurementFunction::Frequency => Some("FREQuency:VOLTage"),
        MeasurementFunction::Period => Some("PERiod:VOLTage"),
        _ => None,
    }
}

fn multimeter_measure(request: &MeasurementRequest) -> Option<String> {
    let token = multimeter_function(request.function)?;
    let mut parts = vec![format!(":SENSe:FUNCtion \"{token}\"")];
    if request.function.supports_range() {
        match request.range {
            Some(range) => parts.push(format!(":SENSe:{token}:RANGe {range:.6E}")),
            None => parts.push(format!(":SENSe:{token}:RANGe:AUTO ON")),
        }
    }
    if request.function.supports_integration() {
        if let Some(resolution) = request.resolution {
            parts.push(format!(":SENSe:{token}:RESolution {resolution:.6E}"));
        }
        if let Some(nplc) = request.nplc {
            parts.push(format!(":SENSe:{token}:NPLC {nplc:.6E}"));
        }
    }
    parts.push(":READ?".to_string());
    Some(parts.join(";"))
}

fn scope_measure(request: &MeasurementRequest) -> Option<String> {
    let token = match request.function {
        MeasurementFunction::PeakToPeak => "VPP",
        MeasurementFunction::Rms => "VRMS",
        MeasurementFunction::Frequency => "FREQuency",
        MeasurementFunction::Period => "PERiod",
        MeasurementFunction::Maximum => "VMAX",
        MeasurementFunction::Minimum => "VMIN",
        MeasurementFunction::Average => "VAVerage",
        _ => return None,
    };
    let channel = request.channel?;
    Some(format!(":MEASure:{token}? CHANnel{channel}"))
}
