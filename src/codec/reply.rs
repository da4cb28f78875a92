//! Typed replies and their parsers.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magnitude at and above which a numeric reply is the SCPI overflow sentinel.
pub const OVERFLOW_SENTINEL: f64 = 9.9e37;

/// Shape of reply a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// No reply is read.
    None,
    /// One numeric field.
    Number,
    /// Boolean (`1|0|ON|OFF`).
    Flag,
    /// `*IDN?` four-field identity.
    Identity,
    /// One error-queue entry, `code,"text"`.
    ErrorEntry,
    /// Exactly this many comma-separated numeric fields.
    Numbers(usize),
    /// IEEE-488.2 definite-length binary block.
    Block,
}

impl ReplyShape {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            ReplyShape::None => "no reply",
            ReplyShape::Number => "number",
            ReplyShape::Flag => "boolean flag",
            ReplyShape::Identity => "identity (manufacturer,model,serial,firmware)",
            ReplyShape::ErrorEntry => "error entry (code,\"text\")",
            ReplyShape::Numbers(_) => "comma-separated numbers",
            ReplyShape::Block => "definite-length block",
        }
    }
}

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Manufacturer field.
    pub manufacturer: String,
    /// Model field.
    pub model: String,
    /// Serial number field.
    pub serial: String,
    /// Firmware revision field.
    pub firmware: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// One entry from the instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceErrorEntry {
    /// SCPI error code (0 means the queue is empty).
    pub code: i32,
    /// Raw error text as reported by the instrument.
    pub message: String,
}

impl DeviceErrorEntry {
    /// Build an entry.
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    /// `0,"No error"` terminates a queue drain.
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }

    /// Whether the entry reports an over-voltage or over-current trip.
    pub fn is_protection_trip(&self) -> bool {
        let text = self.message.to_ascii_lowercase();
        text.contains("protection")
            || text.contains("ovp")
            || text.contains("ocp")
            || text.contains("over voltage")
            || text.contains("over current")
    }
}

impl fmt::Display for DeviceErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},\"{}\"", self.code, self.message)
    }
}

/// Decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command produced no reply.
    Empty,
    /// Single numeric value, possibly the overflow sentinel or NaN.
    Number(f64),
    /// Boolean flag.
    Flag(bool),
    /// Identity string.
    Identity(Identity),
    /// Error-queue entry.
    ErrorEntry(DeviceErrorEntry),
    /// Fixed-count numeric list.
    Numbers(Vec<f64>),
    /// Binary block payload.
    Block(Vec<u8>),
}

impl Response {
    /// Numeric value, if this is a number reply.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Response::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Flag value, if this is a flag reply.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Response::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric list, if this is a list reply.
    pub fn into_numbers(self) -> Option<Vec<f64>> {
        match self {
            Response::Numbers(v) => Some(v),
            _ => None,
        }
    }

    /// Identity, if this is an identity reply.
    pub fn into_identity(self) -> Option<Identity> {
        match self {
            Response::Identity(id) => Some(id),
            _ => None,
        }
    }

    /// Error entry, if this is an error-queue reply.
    pub fn into_error_entry(self) -> Option<DeviceErrorEntry> {
        match self {
            Response::ErrorEntry(e) => Some(e),
            _ => None,
        }
    }

    /// Block payload, if this is a block reply.
    pub fn into_block(self) -> Option<Vec<u8>> {
        match self {
            Response::Block(b) => Some(b),
            _ => None,
        }
    }
}

/// A numeric reply is a usable reading unless it is NaN, infinite or the
/// overflow sentinel.
pub fn reading_is_valid(value: f64) -> bool {
    value.is_finite() && value.abs() < OVERFLOW_SENTINEL
}

/// Parse a raw reply into `shape`.
pub fn decode(raw: &[u8], shape: ReplyShape) -> Result<Response, DecodeError> {
    match shape {
        ReplyShape::None => Ok(Response::Empty),
        ReplyShape::Block => decode_block(raw).map(Response::Block),
        _ => {
            let text = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::malformed(shape.describe(), raw))?
                .trim();
            match shape {
                ReplyShape::Number => parse_number(text)
                    .map(Response::Number)
                    .ok_or_else(|| DecodeError::malformed(shape.describe(), raw)),
                ReplyShape::Flag => parse_flag(text)
                    .map(Response::Flag)
                    .ok_or_else(|| DecodeError::malformed(shape.describe(), raw)),
                ReplyShape::Identity => parse_identity(text)
                    .map(Response::Identity)
                    .ok_or_else(|| DecodeError::malformed(shape.describe(), raw)),
                ReplyShape::ErrorEntry => parse_error_entry(text)
                    .map(Response::ErrorEntry)
                    .ok_or_else(|| DecodeError::malformed(shape.describe(), raw)),
                ReplyShape::Numbers(count) => parse_numbers(text, count)
                    .map(Response::Numbers)
                    .ok_or_else(|| DecodeError::malformed(shape.describe(), raw)),
                ReplyShape::None | ReplyShape::Block => Ok(Response::Empty),
            }
        }
    }
}

fn parse_number(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok()
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_uppercase().as_str() {
        "1" | "ON" => Some(true),
        "0" | "OFF" => Some(false),
        _ => None,
    }
}

fn parse_identity(text: &str) -> Option<Identity> {
    let fields: Vec<&str> = text.splitn(4, ',').map(str::trim).collect();
    if fields.len() != 4 || fields[0].is_empty() || fields[1].is_empty() {
        return None;
    }
    Some(Identity {
        manufacturer: fields[0].to_string(),
        model: fields[1].to_string(),
        serial: fields[2].to_string(),
        firmware: fields[3].to_string(),
    })
}

fn parse_error_entry(text: &str) -> Option<DeviceErrorEntry> {
    let (code, message) = text.split_once(',')?;
    let code = code.trim().parse::<i32>().ok()?;
    let message = message.trim().trim_matches('"');
    Some(DeviceErrorEntry::new(code, message))
}

fn parse_numbers(text: &str, count: usize) -> Option<Vec<f64>> {
    let values = text
        .split(',')
        .map(|field| parse_number(field.trim()))
        .collect::<Option<Vec<f64>>>()?;
    (values.len() == count).then_some(values)
}

/// `#<n><length><payload>` with an optional trailing terminator.
fn decode_block(raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let malformed = || DecodeError::malformed(ReplyShape::Block.describe(), raw);
    let (header, rest) = block_header(raw).ok_or_else(malformed)?;
    let payload = rest.get(..header).ok_or_else(malformed)?;
    Ok(payload.to_vec())
}

/// Parse a block header, returning the payload length and the bytes after
/// the header.
pub(crate) fn block_header(raw: &[u8]) -> Option<(usize, &[u8])> {
    if raw.first() != Some(&b'#') {
        return None;
    }
    let digits = (*raw.get(1)? as char).to_digit(10)? as usize;
    if digits == 0 {
        return None;
    }
    let length_field = raw.get(2..2 + digits)?;
    let length = std::str::from_utf8(length_field).ok()?.parse::<usize>().ok()?;
    Some((length, &raw[2 + digits..]))
}

/// Frame `payload` as a definite-length block.
pub fn encode_block(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut out = format!("#{}{}", length.len(), length).into_bytes();
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_number_with_exponent() {
        let reply = decode(b"+5.000123E+00\n", ReplyShape::Number).unwrap();
        assert_eq!(reply.as_number(), Some(5.000123));
    }

    #[test]
    fn test_overflow_is_invalid_reading_not_error() {
        let value = decode(b"9.9E37", ReplyShape::Number)
            .unwrap()
            .as_number()
            .unwrap();
        assert!(!reading_is_valid(value));

        let nan = decode(b"NaN", ReplyShape::Number).unwrap().as_number().unwrap();
        assert!(!reading_is_valid(nan));
        assert!(reading_is_valid(-1.25e-6));
    }

    #[test]
    fn test_non_numeric_is_malformed() {
        let err = decode(b"VOLT", ReplyShape::Number).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { raw, .. } if raw == "VOLT"));
        assert!(decode(b"", ReplyShape::Number).is_err());
    }

    #[test]
    fn test_flags() {
        assert_eq!(decode(b"1\n", ReplyShape::Flag).unwrap(), Response::Flag(true));
        assert_eq!(decode(b"off", ReplyShape::Flag).unwrap(), Response::Flag(false));
        assert!(decode(b"2", ReplyShape::Flag).is_err());
    }

    #[test]
    fn test_identity() {
        let id = decode(
            b"KEITHLEY INSTRUMENTS,MODEL 2230-30-1,9102345,1.15-1.04\n",
            ReplyShape::Identity,
        )
        .unwrap()
        .into_identity()
        .unwrap();
        assert_eq!(id.manufacturer, "KEITHLEY INSTRUMENTS");
        assert_eq!(id.model, "MODEL 2230-30-1");
        assert_eq!(id.firmware, "1.15-1.04");

        assert!(decode(b"ACME,ONLY-TWO", ReplyShape::Identity).is_err());
    }

    #[test]
    fn test_error_entry() {
        let entry = decode(b"-222,\"Data out of range\"\n", ReplyShape::ErrorEntry)
            .unwrap()
            .into_error_entry()
            .unwrap();
        assert_eq!(entry, DeviceErrorEntry::new(-222, "Data out of range"));
        assert!(!entry.is_no_error());

        let empty = decode(b"0,\"No error\"", ReplyShape::ErrorEntry)
            .unwrap()
            .into_error_entry()
            .unwrap();
        assert!(empty.is_no_error());
    }

    #[test]
    fn test_numbers_require_exact_count() {
        let values = decode(b"1.0,2.0,3.0", ReplyShape::Numbers(3))
            .unwrap()
            .into_numbers()
            .unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);

        assert!(decode(b"1.0,2.0", ReplyShape::Numbers(3)).is_err());
        assert!(decode(b"1.0,2.0,3.0,4.0", ReplyShape::Numbers(3)).is_err());
        assert!(decode(b"1.0,abc,3.0", ReplyShape::Numbers(3)).is_err());
    }

    #[test]
    fn test_block() {
        let framed = encode_block(b"\x89PNG-data");
        assert!(framed.starts_with(b"#19"));
        let mut with_terminator = framed.clone();
        with_terminator.push(b'\n');
        let payload = decode(&with_terminator, ReplyShape::Block)
            .unwrap()
            .into_block()
            .unwrap();
        assert_eq!(payload, b"\x89PNG-data");
    }

    #[test]
    fn test_truncated_block_is_malformed() {
        assert!(decode(b"#210abc", ReplyShape::Block).is_err());
        assert!(decode(b"no header", ReplyShape::Block).is_err());
    }

    #[test]
    fn test_protection_trip_detection() {
        assert!(DeviceErrorEntry::new(801, "Over voltage protection tripped").is_protection_trip());
        assert!(!DeviceErrorEntry::new(-222, "Data out of range").is_protection_trip());
    }
}
