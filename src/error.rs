//! Error types for the instrument core.
//!
//! Each layer owns a focused `thiserror` enum so callers can match on exactly
//! what went wrong, and the instrument facades fold all of them into
//! [`LabError`].
//!
//! ## Error Hierarchy
//!
//! - **`TransportError`**: wire-level failures reported by a [`Transport`](crate::transport::Transport).
//!   `Timeout` and `Io` are transient and retried by the session.
//! - **`ConnectError`**: the instrument could not be opened or did not identify
//!   as the expected model.
//! - **`SessionError`**: a transaction failed. `Unreachable` means retries were
//!   exhausted and the session is now Faulted; `DeviceError` carries the raw
//!   error-queue text of the instrument and leaves the session Connected.
//! - **`EncodeError` / `DecodeError`**: codec failures. A malformed reply is
//!   never truncated or guessed at.
//! - **`ValidationError`**: a configuration was rejected before it reached the
//!   wire. Always names the violated constraint.
//! - **`InterlockError`**: a latched protection trip blocks the operation.
//! - **`MeasurementError`**: measurement-specific failures (timeouts, too many
//!   invalid readings, unsupported range/resolution).
//! - **`ShutdownError`**: an emergency sweep finished with per-channel failures.
//! - **`ConfigError`**: loading, validating or resolving configuration.
//!
//! Every error exposes a stable `kind()` string next to its `Display` text.

use crate::codec::DeviceErrorEntry;
use crate::session::SessionState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the facade error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Failure reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No bytes arrived (or could be sent) within the allotted time.
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// The transport was used before `open` or after `close`.
    #[error("transport is not open")]
    NotOpen,
}

impl TransportError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Io(_))
    }

    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "transport.timeout",
            TransportError::Io(_) => "transport.io",
            TransportError::NotOpen => "transport.not_open",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failure while establishing a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// The transport could not be opened or the identity query never answered.
    #[error("instrument at {address} unreachable: {reason}")]
    Unreachable {
        /// Address that was dialled.
        address: String,
        /// Underlying cause.
        reason: String,
    },

    /// The instrument answered but is not the model this session expects.
    #[error("identity mismatch: expected {expected}, instrument reported '{actual}'")]
    IdentityMismatch {
        /// Description of what was expected.
        expected: String,
        /// Raw identity string returned by the instrument.
        actual: String,
    },
}

impl ConnectError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Unreachable { .. } => "connect.unreachable",
            ConnectError::IdentityMismatch { .. } => "connect.identity_mismatch",
        }
    }
}

/// The selected dialect has no encoding for a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Command not part of this dialect's vocabulary.
    #[error("command '{command}' is not supported by the {dialect} dialect")]
    Unsupported {
        /// Debug name of the command.
        command: String,
        /// Dialect that rejected it.
        dialect: &'static str,
    },
}

/// A reply could not be parsed into the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong field count, non-numeric text, truncated block, ...
    #[error("malformed reply (expected {expected}): '{raw}'")]
    Malformed {
        /// Shape the caller asked for.
        expected: &'static str,
        /// Reply text, lossily decoded.
        raw: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(expected: &'static str, raw: &[u8]) -> Self {
        DecodeError::Malformed {
            expected,
            raw: String::from_utf8_lossy(raw).trim_end().to_string(),
        }
    }
}

/// Failure of a single session transaction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session is not in the Connected state.
    #[error("session is {state:?}, not connected")]
    NotConnected {
        /// State at the time of the call.
        state: SessionState,
    },

    /// Transport retries were exhausted (or the failure was not retryable).
    /// The session has been moved to Faulted.
    #[error("instrument unreachable while executing '{command}' after {attempts} attempt(s): {last_error}")]
    Unreachable {
        /// Command being executed.
        command: String,
        /// Number of transport attempts made.
        attempts: u32,
        /// Last transport failure.
        last_error: TransportError,
    },

    /// The instrument reported one or more errors in its error queue.
    #[error("instrument rejected '{command}': {}", format_entries(.errors))]
    DeviceError {
        /// Command that was executed.
        command: String,
        /// Raw error-queue entries, in the order drained.
        errors: Vec<DeviceErrorEntry>,
    },

    /// The reply did not match the expected shape.
    #[error("protocol error for '{command}': {source}")]
    Protocol {
        /// Command that was executed.
        command: String,
        /// Decode failure.
        #[source]
        source: DecodeError,
    },

    /// The command cannot be expressed in this session's dialect.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Exclusive access could not be obtained in time.
    #[error("timed out after {0:?} waiting for exclusive session access")]
    AcquireTimeout(Duration),
}

impl SessionError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotConnected { .. } => "session.not_connected",
            SessionError::Unreachable { .. } => "session.unreachable",
            SessionError::DeviceError { .. } => "session.device_error",
            SessionError::Protocol { .. } => "session.protocol_error",
            SessionError::Encode(_) => "session.unsupported_command",
            SessionError::AcquireTimeout(_) => "session.acquire_timeout",
        }
    }

    /// Whether the failure was a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::Unreachable {
                last_error: TransportError::Timeout(_),
                ..
            }
        )
    }

    /// Device error-queue entries carried by this error, if any.
    pub fn device_errors(&self) -> &[DeviceErrorEntry] {
        match self {
            SessionError::DeviceError { errors, .. } => errors,
            _ => &[],
        }
    }
}

fn format_entries(entries: &[DeviceErrorEntry]) -> String {
    entries
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The limit a rejected value violated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Instrument absolute hardware maximum.
    HardwareMaximum(f64),
    /// Caller-supplied over-voltage protection level.
    OvpLevel(f64),
    /// Lower bound (inclusive).
    Minimum(f64),
    /// Value must be strictly positive.
    MustBePositive,
    /// Value must be a finite number.
    Finite,
    /// Channel number must be within `1..=max`.
    ChannelRange {
        /// Highest valid channel.
        max: u8,
    },
    /// Value must be one of the instrument's discrete settings.
    OneOf(&'static [f64]),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::HardwareMaximum(max) => write!(f, "hardware maximum {max}"),
            Constraint::OvpLevel(level) => write!(f, "OVP level {level}"),
            Constraint::Minimum(min) => write!(f, "minimum {min}"),
            Constraint::MustBePositive => write!(f, "must be > 0"),
            Constraint::Finite => write!(f, "must be finite"),
            Constraint::ChannelRange { max } => write!(f, "channel range 1..={max}"),
            Constraint::OneOf(values) => write!(f, "one of {values:?}"),
        }
    }
}

/// A configuration was rejected before encoding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A value violates a limit.
    #[error("{parameter} = {value} violates {constraint}")]
    OutOfRange {
        /// Name of the offending parameter.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
        /// The violated limit.
        constraint: Constraint,
    },

    /// An operation requires state that has not been committed yet.
    #[error("channel {channel}: {missing} has not been committed to the instrument")]
    MissingPrerequisite {
        /// Channel concerned.
        channel: u8,
        /// What is missing.
        missing: &'static str,
    },
}

impl ValidationError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::OutOfRange { .. } => "validation.out_of_range",
            ValidationError::MissingPrerequisite { .. } => "validation.missing_prerequisite",
        }
    }
}

/// A latched interlock blocks the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterlockError {
    /// The channel's protection tripped and has not been reset.
    #[error("channel {channel} interlock tripped: {reason}")]
    Tripped {
        /// Channel concerned.
        channel: u8,
        /// Recorded reason for the trip.
        reason: String,
    },
}

impl InterlockError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        "interlock.tripped"
    }
}

/// Measurement failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    /// The instrument did not deliver a reading in time.
    #[error("measurement timed out after {timeout:?}")]
    Timeout {
        /// Timeout that applied.
        timeout: Duration,
    },

    /// Too few valid readings for a meaningful statistic.
    #[error("insufficient data: {valid} valid of {requested} requested ({discarded} discarded)")]
    InsufficientData {
        /// Readings requested.
        requested: usize,
        /// Readings kept.
        valid: usize,
        /// Readings discarded as invalid or failed.
        discarded: usize,
    },

    /// A statistics run stopped because the session became unusable.
    #[error("statistics run interrupted: {source}")]
    Interrupted {
        /// Summary of the valid readings taken before the failure, if any.
        summary: Option<crate::measurement::StatisticalSummary>,
        /// Failure that ended the run.
        source: Box<MeasurementError>,
    },

    /// Range, resolution or integration time not supported by the instrument.
    #[error("{parameter} = {value} is not supported: {detail}")]
    OutOfRange {
        /// Offending request field.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
        /// What the instrument supports.
        detail: String,
    },

    /// Transaction failure other than a timeout.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl MeasurementError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasurementError::Timeout { .. } => "measurement.timeout",
            MeasurementError::InsufficientData { .. } => "measurement.insufficient_data",
            MeasurementError::OutOfRange { .. } => "measurement.out_of_range",
            MeasurementError::Interrupted { .. } => "measurement.interrupted",
            MeasurementError::Session(inner) => inner.kind(),
        }
    }
}

/// One channel that could not be disabled during a shutdown sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFailure {
    /// Channel number.
    pub channel: u8,
    /// Stable kind of the underlying error.
    pub kind: &'static str,
    /// Human-readable detail.
    pub detail: String,
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} ({}): {}", self.channel, self.kind, self.detail)
    }
}

/// An emergency sweep completed but some channels failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShutdownError {
    /// Every channel was attempted; these ones failed.
    #[error("shutdown incomplete: {}", format_failures(.failures))]
    PartialFailure {
        /// Per-channel failures, in sweep order.
        failures: Vec<ChannelFailure>,
    },
}

impl ShutdownError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        "shutdown.partial_failure"
    }

    /// Channels that failed.
    pub fn failures(&self) -> &[ChannelFailure] {
        match self {
            ShutdownError::PartialFailure { failures } => failures,
        }
    }
}

fn format_failures(failures: &[ChannelFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration loading or resolution failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),

    /// The values parsed but are inconsistent.
    #[error("configuration validation error: {0}")]
    Validation(String),

    /// Neither an explicit address nor a discovered one is available.
    #[error("instrument '{id}' has no address and discovery tag {tag:?} was not resolved")]
    Unresolved {
        /// Instrument role name.
        id: String,
        /// Discovery tag looked up, if any.
        tag: Option<String>,
    },
}

impl ConfigError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::Load(_) => "config.load",
            ConfigError::Validation(_) => "config.validation",
            ConfigError::Unresolved { .. } => "config.unresolved",
        }
    }
}

/// Umbrella error returned by the instrument facades.
#[derive(Error, Debug)]
pub enum LabError {
    /// See [`ConnectError`].
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// See [`SessionError`].
    #[error(transparent)]
    Session(#[from] SessionError),

    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// See [`InterlockError`].
    #[error(transparent)]
    Interlock(#[from] InterlockError),

    /// See [`MeasurementError`].
    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    /// See [`ShutdownError`].
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A read-back did not confirm the commanded state.
    #[error("channel {channel}: {detail}")]
    Verification {
        /// Channel concerned.
        channel: u8,
        /// What did not match.
        detail: String,
    },
}

impl LabError {
    /// Stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::Connect(e) => e.kind(),
            LabError::Session(e) => e.kind(),
            LabError::Validation(e) => e.kind(),
            LabError::Interlock(e) => e.kind(),
            LabError::Measurement(e) => e.kind(),
            LabError::Shutdown(e) => e.kind(),
            LabError::Config(e) => e.kind(),
            LabError::Verification { .. } => "verification.mismatch",
        }
    }
}
