//! Instrument session and SCPI command core for automated bench equipment.
//!
//! `labctl` turns typed operations ("set channel 1 to 5 V with a 1 A limit")
//! into correctly sequenced bus transactions. The layers, leaf first:
//!
//! - [`transport`]: the byte-level seam ([`transport::Transport`]) with a TCP
//!   socket implementation and a simulated instrument for tests.
//! - [`codec`]: stateless encoding of [`codec::Command`] per
//!   [`codec::Dialect`] and decoding of replies.
//! - [`session`]: connection state machine, exclusive access, retries and
//!   the post-command error-queue check.
//! - [`safety`]: limit validation, interlock latching and the emergency
//!   shutdown sweep.
//! - [`measurement`]: request validation and statistics over repeated
//!   readings.
//! - [`instrument`]: power supply, multimeter and oscilloscope facades.
//!
//! ```no_run
//! use labctl::instrument::{PowerSupply, SupplyModel};
//! use labctl::session::{InstrumentAddress, SessionContext};
//! use labctl::transport::TcpTransport;
//!
//! # async fn run() -> labctl::LabResult<()> {
//! let psu = PowerSupply::new(
//!     InstrumentAddress::new("TCPIP0::192.168.1.20::5025::SOCKET"),
//!     SupplyModel::KEITHLEY_2230,
//!     TcpTransport::default(),
//!     SessionContext::new("bench_psu"),
//! );
//! psu.connect().await?;
//! psu.configure_channel(1, 5.0, 0.5, Some(6.0)).await?;
//! psu.enable_channel_output(1).await?;
//! let reading = psu.measure_channel_output(1).await?;
//! tracing::info!(volts = reading.voltage, amps = reading.current, "channel 1");
//! psu.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod safety;
pub mod session;
pub mod transport;

pub use error::{LabError, LabResult};
pub use measurement::Measure;
