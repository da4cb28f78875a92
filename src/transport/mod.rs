//! Byte-level transport seam.
//!
//! A [`Transport`] moves frames to and from one instrument. It knows nothing
//! about SCPI beyond line termination and binary block framing; retries,
//! error-queue handling and state tracking live in the session.
//!
//! Implementations:
//! - [`TcpTransport`]: raw SCPI socket (port 5025) for LAN instruments.
//! - [`MockTransport`]: in-process simulated instrument for tests and dry runs.

pub mod mock;
pub mod tcp;

pub use mock::{MockChannelState, MockTransport};
pub use tcp::{TcpTransport, TcpTransportBuilder};

use crate::error::TransportError;
use crate::session::InstrumentAddress;
use async_trait::async_trait;
use std::time::Duration;

/// Raw frame transport to a single instrument.
///
/// Frames are passed without terminators. Implementations append their write
/// terminator and strip the read terminator.
#[async_trait]
pub trait Transport: Send {
    /// Open the connection to `address`.
    async fn open(
        &mut self,
        address: &InstrumentAddress,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Send one frame.
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one reply, waiting at most `timeout`.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close the connection. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether `open` succeeded and `close` has not been called since.
    fn is_connected(&self) -> bool;

    /// Write a frame and read its reply.
    async fn query(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.write(frame).await?;
        self.read(timeout).await
    }
}
