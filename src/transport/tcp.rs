//! Raw SCPI over TCP.
//!
//! LAN instruments expose a socket (conventionally port 5025) that accepts
//! newline-terminated commands and answers with a line, or with an IEEE-488.2
//! definite-length block for binary data such as screen captures.

use super::Transport;
use crate::codec::block_header;
use crate::error::TransportError;
use crate::session::InstrumentAddress;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default raw SCPI socket port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Largest definite-length block payload accepted by default (64 MiB).
pub const DEFAULT_MAX_BLOCK_LEN: usize = 64 * 1024 * 1024;

/// Builder for [`TcpTransport`].
///
/// # Example
/// ```no_run
/// use labctl::transport::TcpTransportBuilder;
///
/// let transport = TcpTransportBuilder::new()
///     .with_write_terminator("\r\n")
///     .with_default_port(5025)
///     .with_max_block_len(16 * 1024 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransportBuilder {
    write_terminator: String,
    read_terminator: u8,
    default_port: u16,
    max_block_len: usize,
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportBuilder {
    /// Builder with newline terminators and port 5025.
    pub fn new() -> Self {
        Self {
            write_terminator: "\n".to_string(),
            read_terminator: b'\n',
            default_port: DEFAULT_SCPI_PORT,
            max_block_len: DEFAULT_MAX_BLOCK_LEN,
        }
    }

    /// Terminator appended to every written frame.
    pub fn with_write_terminator(mut self, terminator: &str) -> Self {
        self.write_terminator = terminator.to_string();
        self
    }

    /// Byte that ends a text reply.
    pub fn with_read_terminator(mut self, terminator: u8) -> Self {
        self.read_terminator = terminator;
        self
    }

    /// Port used when the address does not name one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Largest block payload a reply may announce. Larger headers are
    /// rejected before any payload is buffered.
    pub fn with_max_block_len(mut self, max_block_len: usize) -> Self {
        self.max_block_len = max_block_len;
        self
    }

    /// Build an unopened transport.
    pub fn build(self) -> TcpTransport {
        TcpTransport {
            write_terminator: self.write_terminator,
            read_terminator: self.read_terminator,
            default_port: self.default_port,
            max_block_len: self.max_block_len,
            stream: None,
        }
    }
}

/// Raw socket transport.
#[derive(Debug)]
pub struct TcpTransport {
    write_terminator: String,
    read_terminator: u8,
    default_port: u16,
    max_block_len: usize,
    stream: Option<BufReader<TcpStream>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransportBuilder::new().build()
    }
}

impl TcpTransport {
    /// Turn an address into `host:port`.
    ///
    /// Accepts `TCPIP[n]::<host>::<port>::SOCKET`, `TCPIP[n]::<host>::INSTR`
    /// (raw port assumed), `<host>:<port>` and a bare `<host>`.
    pub fn socket_address(&self, address: &InstrumentAddress) -> Result<String, TransportError> {
        let raw = address.as_str().trim();
        if raw.to_ascii_uppercase().starts_with("TCPIP") {
            let fields: Vec<&str> = raw.split("::").collect();
            let host = fields
                .get(1)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| TransportError::Io(format!("no host in address '{raw}'")))?;
            let port = match fields.get(2) {
                Some(field) if field.chars().all(|c| c.is_ascii_digit()) => field
                    .parse::<u16>()
                    .map_err(|_| TransportError::Io(format!("invalid port in '{raw}'")))?,
                _ => self.default_port,
            };
            return Ok(format!("{host}:{port}"));
        }
        if raw.is_empty() {
            return Err(TransportError::Io("empty address".into()));
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() && !host.is_empty() => {
                Ok(raw.to_string())
            }
            Some(_) => Err(TransportError::Io(format!("invalid port in '{raw}'"))),
            None => Ok(format!("{raw}:{}", self.default_port)),
        }
    }

    async fn read_reply(
        stream: &mut BufReader<TcpStream>,
        terminator: u8,
        max_block_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        loop {
            let first = stream.fill_buf().await?.first().copied();
            match first {
                None => return Err(TransportError::Io("connection closed by instrument".into())),
                Some(b'#') => return Self::read_block(stream, max_block_len).await,
                Some(_) => {
                    let mut line = Vec::new();
                    stream.read_until(terminator, &mut line).await?;
                    while matches!(line.last(), Some(b'\n' | b'\r')) {
                        line.pop();
                    }
                    // a bare terminator is the tail of a previous block
                    if !line.is_empty() {
                        return Ok(line);
                    }
                }
            }
        }
    }

    /// Read `#<n><length><payload>` by length; the payload may contain the
    /// terminator byte. Returns the block including its header.
    async fn read_block(
        stream: &mut BufReader<TcpStream>,
        max_block_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let invalid = || TransportError::Io("invalid definite-length block header".into());
        let mut block = vec![0u8; 2];
        stream.read_exact(&mut block).await?;
        let digits = (block[1] as char)
            .to_digit(10)
            .filter(|d| *d > 0)
            .ok_or_else(invalid)? as usize;
        block.resize(2 + digits, 0);
        stream.read_exact(&mut block[2..]).await?;
        let (length, _) = block_header(&block).ok_or_else(invalid)?;
        if length > max_block_len {
            return Err(TransportError::Io(format!(
                "block of {length} bytes exceeds the {max_block_len} byte limit"
            )));
        }

        let start = block.len();
        block.resize(start + length, 0);
        stream.read_exact(&mut block[start..]).await?;
        Ok(block)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(
        &mut self,
        address: &InstrumentAddress,
        open_timeout: Duration,
    ) -> Result<(), TransportError> {
        let target = self.socket_address(address)?;
        debug!(address = %address, socket = %target, "opening SCPI socket");
        let stream = timeout(open_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TransportError::Timeout(open_timeout))??;
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let mut out = Vec::with_capacity(frame.len() + self.write_terminator.len());
        out.extend_from_slice(frame);
        out.extend_from_slice(self.write_terminator.as_bytes());
        stream.get_mut().write_all(&out).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }

    async fn read(&mut self, read_timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let (terminator, max_block_len) = (self.read_terminator, self.max_block_len);
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        timeout(read_timeout, Self::read_reply(stream, terminator, max_block_len))
            .await
            .map_err(|_| TransportError::Timeout(read_timeout))?
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.get_mut().shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
