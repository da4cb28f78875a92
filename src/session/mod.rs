//! Instrument session: the transaction core.
//!
//! A [`Session`] owns one [`Transport`] and serializes every bus transaction
//! through a [`SessionGuard`]. Each command follows the same protocol:
//!
//! 1. encode with the session's [`Dialect`]
//! 2. write the frame
//! 3. read the reply if the command has one
//! 4. drain the instrument error queue (`:SYSTem:ERRor:NEXT?` until `0`)
//! 5. decode
//!
//! Transient write failures are retried with exponential backoff. A reply
//! that does not arrive is never re-requested: it may still show up later and
//! would then be read as the answer to the next command. Instead the session
//! moves to [`SessionState::Faulted`] and closes the link, so nothing late
//! can be consumed. A Faulted session stays Faulted until
//! [`Session::reconnect`].
//!
//! Device-reported errors are surfaced as [`SessionError::DeviceError`] and
//! never retried. They leave the session Connected.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                                \--fail--> Faulted
//! Connected --unreachable--> Faulted --reconnect--> Connected
//! any --disconnect--> Disconnected
//! ```

mod context;

pub use context::SessionContext;

use crate::codec::{Command, DeviceErrorEntry, Dialect, Identity, ReplyShape, Response};
use crate::error::{ConnectError, DecodeError, SessionError, ShutdownError, TransportError};
use crate::error_recovery::RetryPolicy;
use crate::safety::SafetyGuard;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Opaque transport-resolvable instrument address, e.g.
/// `TCPIP0::192.168.1.50::5025::SOCKET`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentAddress(String);

impl InstrumentAddress {
    /// Wrap an address string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The raw address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for InstrumentAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Transport closed.
    Disconnected = 0,
    /// `connect` in progress.
    Connecting = 1,
    /// Ready for transactions.
    Connected = 2,
    /// The transport became unreachable; only `reconnect` or `disconnect`
    /// leave this state.
    Faulted = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Faulted,
            _ => SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// One logical session per physical instrument.
pub struct Session<T: Transport> {
    address: InstrumentAddress,
    dialect: Dialect,
    context: SessionContext,
    expected_model: Option<String>,
    state: AtomicU8,
    identity: std::sync::Mutex<Option<Identity>>,
    link: Mutex<T>,
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instrument", &self.context.instrument_id)
            .field("address", &self.address)
            .field("dialect", &self.dialect)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session.
    pub fn new(
        address: InstrumentAddress,
        dialect: Dialect,
        transport: T,
        context: SessionContext,
    ) -> Self {
        Self {
            address,
            dialect,
            context,
            expected_model: None,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            identity: std::sync::Mutex::new(None),
            link: Mutex::new(transport),
        }
    }

    /// Require the `*IDN?` model field to contain `pattern` (case-insensitive).
    pub fn with_expected_model(mut self, pattern: &str) -> Self {
        self.expected_model = Some(pattern.to_string());
        self
    }

    /// Address supplied at construction.
    pub fn address(&self) -> &InstrumentAddress {
        &self.address
    }

    /// Dialect used for every command.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Timeouts and retry settings.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Current state. Never waits for a running transaction.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(instrument = %self.context.instrument_id, from = %previous, to = %state, "session state change");
        }
    }

    /// Identity reported at the last successful connect.
    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn span(&self) -> tracing::Span {
        info_span!("instrument_session", instrument = %self.context.instrument_id)
    }

    /// Wait up to the context's acquire timeout for exclusive access.
    pub async fn acquire(&self) -> Result<SessionGuard<'_, T>, SessionError> {
        self.acquire_within(self.context.acquire_timeout).await
    }

    /// Wait up to `wait` for exclusive access.
    ///
    /// The guard is released when dropped, on every exit path.
    pub async fn acquire_within(&self, wait: Duration) -> Result<SessionGuard<'_, T>, SessionError> {
        match timeout(wait, self.link.lock()).await {
            Ok(transport) => Ok(SessionGuard {
                session: self,
                transport,
            }),
            Err(_) => {
                warn!(instrument = %self.context.instrument_id, ?wait, "timed out waiting for session access");
                Err(SessionError::AcquireTimeout(wait))
            }
        }
    }

    /// Acquire, execute one command, release.
    pub async fn execute(&self, command: &Command) -> Result<Response, SessionError> {
        let mut guard = self.acquire().await?;
        guard.execute(command).await
    }

    /// Open the transport and verify the instrument identity.
    ///
    /// Returns immediately if already connected; the transport is not
    /// re-opened.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<(), ConnectError> {
        self.connect_inner(connect_timeout)
            .instrument(self.span())
            .await
    }

    async fn connect_inner(&self, connect_timeout: Duration) -> Result<(), ConnectError> {
        if self.state() == SessionState::Connected {
            debug!("already connected");
            return Ok(());
        }
        let mut link = timeout(self.context.acquire_timeout, self.link.lock())
            .await
            .map_err(|_| ConnectError::Unreachable {
                address: self.address.to_string(),
                reason: "timed out waiting for exclusive session access".into(),
            })?;
        if self.state() == SessionState::Connected {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        info!(address = %self.address, dialect = self.dialect.name(), "connecting");

        if link.is_connected() {
            if let Err(e) = link.close().await {
                debug!(error = %e, "closing stale transport failed");
            }
        }
        if let Err(e) = link.open(&self.address, connect_timeout).await {
            self.set_state(SessionState::Faulted);
            error!(address = %self.address, error = %e, "failed to open transport");
            return Err(ConnectError::Unreachable {
                address: self.address.to_string(),
                reason: e.to_string(),
            });
        }

        match self.handshake(&mut *link, connect_timeout).await {
            Ok(identity) => {
                info!(address = %self.address, identity = %identity, "connected");
                *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = link.close().await {
                    debug!(error = %close_err, "closing transport after failed handshake");
                }
                self.set_state(SessionState::Faulted);
                error!(address = %self.address, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// `*IDN?`, identity check, `*CLS`.
    async fn handshake(&self, link: &mut T, wait: Duration) -> Result<Identity, ConnectError> {
        let unreachable = |reason: String| ConnectError::Unreachable {
            address: self.address.to_string(),
            reason,
        };

        let identify = Command::Identify;
        let frame = self
            .dialect
            .encode(&identify)
            .map_err(|e| unreachable(e.to_string()))?;
        let raw = transact(link, &identify, &frame, wait, &self.context.retry)
            .await
            .map_err(|f| unreachable(format!("identity query failed: {}", f.error)))?;
        let identity = self
            .dialect
            .decode(&raw, ReplyShape::Identity)
            .ok()
            .and_then(Response::into_identity)
            .ok_or_else(|| ConnectError::IdentityMismatch {
                expected: "a SCPI identity (manufacturer,model,serial,firmware)".into(),
                actual: String::from_utf8_lossy(&raw).trim().to_string(),
            })?;

        if let Some(expected) = &self.expected_model {
            if !identity
                .model
                .to_ascii_uppercase()
                .contains(&expected.to_ascii_uppercase())
            {
                return Err(ConnectError::IdentityMismatch {
                    expected: format!("model containing '{expected}'"),
                    actual: identity.to_string(),
                });
            }
        }

        let clear = Command::ClearStatus;
        let frame = self
            .dialect
            .encode(&clear)
            .map_err(|e| unreachable(e.to_string()))?;
        transact(link, &clear, &frame, wait, &self.context.retry)
            .await
            .map_err(|f| unreachable(format!("clear status failed: {}", f.error)))?;
        Ok(identity)
    }

    /// Close and re-open the transport, e.g. to leave Faulted.
    pub async fn reconnect(&self, connect_timeout: Duration) -> Result<(), ConnectError> {
        {
            let mut link = timeout(self.context.acquire_timeout, self.link.lock())
                .await
                .map_err(|_| ConnectError::Unreachable {
                    address: self.address.to_string(),
                    reason: "timed out waiting for exclusive session access".into(),
                })?;
            info!(instrument = %self.context.instrument_id, from = %self.state(), "reconnecting");
            if let Err(e) = link.close().await {
                debug!(error = %e, "close before reconnect failed");
            }
            self.set_state(SessionState::Disconnected);
        }
        self.connect(connect_timeout).await
    }

    /// Best-effort disconnect.
    ///
    /// With a safety guard, every output is switched off first. The session
    /// always ends Disconnected; a failed shutdown sweep is logged and
    /// returned, it does not prevent closing the transport.
    pub async fn disconnect(&self, safety: Option<&SafetyGuard>) -> Result<(), ShutdownError> {
        let span = self.span();
        async move {
            let shutdown = match (safety, self.state()) {
                (Some(guard), SessionState::Connected | SessionState::Faulted) => {
                    guard.emergency_shutdown(self).await
                }
                _ => Ok(()),
            };
            if let Err(e) = &shutdown {
                warn!(error = %e, "outputs not confirmed off before disconnect");
            }

            match timeout(self.context.acquire_timeout, self.link.lock()).await {
                Ok(mut link) => {
                    if let Err(e) = link.close().await {
                        warn!(error = %e, "transport close failed");
                    }
                }
                Err(_) => warn!("session busy, transport left open"),
            }
            *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.set_state(SessionState::Disconnected);
            info!(address = %self.address, "disconnected");
            shutdown
        }
        .instrument(span)
        .await
    }
}

/// Exclusive access to a session's transport.
///
/// Holding a guard queues every other caller; dropping it releases the bus.
pub struct SessionGuard<'a, T: Transport> {
    session: &'a Session<T>,
    transport: MutexGuard<'a, T>,
}

impl<T: Transport> fmt::Debug for SessionGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", self.session)
            .field("link_open", &self.transport.is_connected())
            .finish()
    }
}

impl<'a, T: Transport> SessionGuard<'a, T> {
    /// The session this guard belongs to.
    pub fn session(&self) -> &'a Session<T> {
        self.session
    }

    /// Execute with the context's read timeout.
    pub async fn execute(&mut self, command: &Command) -> Result<Response, SessionError> {
        let wait = self.session.context.read_timeout;
        self.execute_with_timeout(command, wait).await
    }

    /// Execute with an explicit read timeout.
    pub async fn execute_with_timeout(
        &mut self,
        command: &Command,
        wait: Duration,
    ) -> Result<Response, SessionError> {
        let span = self.session.span();
        self.run(command, wait, false).instrument(span).await
    }

    /// Execute even when Faulted. A link closed by a lost reply is reopened
    /// first, without a handshake. Used by emergency paths that must try
    /// every channel.
    pub async fn execute_best_effort(&mut self, command: &Command) -> Result<Response, SessionError> {
        let wait = self.session.context.read_timeout;
        let span = self.session.span();
        self.run(command, wait, true).instrument(span).await
    }

    async fn run(
        &mut self,
        command: &Command,
        wait: Duration,
        allow_faulted: bool,
    ) -> Result<Response, SessionError> {
        let state = self.session.state();
        let faulted_allowed = allow_faulted && state == SessionState::Faulted;
        if state != SessionState::Connected && !faulted_allowed {
            return Err(SessionError::NotConnected { state });
        }
        if faulted_allowed && !self.transport.is_connected() {
            let session = self.session;
            warn!(address = %session.address, "reopening link for emergency command");
            if let Err(e) = self
                .transport
                .open(&session.address, session.context.connect_timeout)
                .await
            {
                error!(command = %command, error = %e, "emergency reopen failed");
                return Err(SessionError::Unreachable {
                    command: command.to_string(),
                    attempts: 1,
                    last_error: e,
                });
            }
        }

        let frame = self.session.dialect.encode(command)?;
        debug!(command = %command, channel = ?command.channel(), "execute");

        let raw = match transact(
            &mut *self.transport,
            command,
            &frame,
            wait,
            &self.session.context.retry,
        )
        .await
        {
            Ok(raw) => raw,
            Err(failure) => return Err(self.fault(command, failure).await),
        };

        let decoded = self.session.dialect.decode(&raw, command.reply_shape());
        let errors = self.drain_error_queue().await?;
        if !errors.is_empty() {
            let summary = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(command = %command, errors = %summary, "instrument reported errors");
            return Err(SessionError::DeviceError {
                command: command.to_string(),
                errors,
            });
        }
        decoded.map_err(|source| SessionError::Protocol {
            command: command.to_string(),
            source,
        })
    }

    async fn fault(&mut self, command: &Command, failure: TransactFailure) -> SessionError {
        let TransactFailure {
            attempts,
            error: last_error,
            reply_lost,
        } = failure;
        self.session.set_state(SessionState::Faulted);
        error!(command = %command, attempt = attempts, error = %last_error, "instrument unreachable");
        if reply_lost {
            // a late reply must never answer a later command
            if let Err(e) = self.transport.close().await {
                debug!(error = %e, "closing desynchronized link failed");
            }
        }
        SessionError::Unreachable {
            command: command.to_string(),
            attempts,
            last_error,
        }
    }

    /// Pop error-queue entries until `0,"No error"` or the configured depth.
    pub async fn drain_error_queue(&mut self) -> Result<Vec<DeviceErrorEntry>, SessionError> {
        let command = Command::NextError;
        let frame = self.session.dialect.encode(&command)?;
        let wait = self.session.context.read_timeout;
        let mut entries = Vec::new();
        for _ in 0..self.session.context.error_queue_depth {
            let raw = match transact(
                &mut *self.transport,
                &command,
                &frame,
                wait,
                &self.session.context.retry,
            )
            .await
            {
                Ok(raw) => raw,
                Err(failure) => return Err(self.fault(&command, failure).await),
            };
            let entry = self
                .session
                .dialect
                .decode(&raw, ReplyShape::ErrorEntry)
                .map_err(|source| SessionError::Protocol {
                    command: command.to_string(),
                    source,
                })?
                .into_error_entry()
                .ok_or_else(|| protocol(&command, "error entry", &raw))?;
            if entry.is_no_error() {
                return Ok(entries);
            }
            entries.push(entry);
        }
        debug!(depth = self.session.context.error_queue_depth, "error queue drain stopped at depth limit");
        Ok(entries)
    }

    /// Execute a numeric query.
    pub async fn query_number(&mut self, command: &Command) -> Result<f64, SessionError> {
        let response = self.execute(command).await?;
        response
            .as_number()
            .ok_or_else(|| unexpected(command, "number", &response))
    }

    /// Execute a flag query.
    pub async fn query_flag(&mut self, command: &Command) -> Result<bool, SessionError> {
        let response = self.execute(command).await?;
        response
            .as_flag()
            .ok_or_else(|| unexpected(command, "boolean flag", &response))
    }

    /// Execute a list query.
    pub async fn query_numbers(&mut self, command: &Command) -> Result<Vec<f64>, SessionError> {
        let response = self.execute(command).await?;
        match response {
            Response::Numbers(values) => Ok(values),
            other => Err(unexpected(command, "comma-separated numbers", &other)),
        }
    }

    /// Execute a block query.
    pub async fn query_block(
        &mut self,
        command: &Command,
        wait: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        let response = self.execute_with_timeout(command, wait).await?;
        match response {
            Response::Block(bytes) => Ok(bytes),
            other => Err(unexpected(command, "definite-length block", &other)),
        }
    }
}

fn protocol(command: &Command, expected: &'static str, raw: &[u8]) -> SessionError {
    SessionError::Protocol {
        command: command.to_string(),
        source: DecodeError::malformed(expected, raw),
    }
}

fn unexpected(command: &Command, expected: &'static str, response: &Response) -> SessionError {
    protocol(command, expected, format!("{response:?}").as_bytes())
}

/// Why a transaction gave up.
#[derive(Debug)]
struct TransactFailure {
    attempts: u32,
    error: TransportError,
    /// The frame was written but its reply never arrived intact.
    reply_lost: bool,
}

/// Write `frame` and read the reply if any.
///
/// Transient write failures are retried; a failed read is final.
async fn transact<T: Transport>(
    transport: &mut T,
    command: &Command,
    frame: &[u8],
    wait: Duration,
    retry: &RetryPolicy,
) -> Result<Vec<u8>, TransactFailure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match transport.write(frame).await {
            Ok(()) if !command.expects_reply() => return Ok(Vec::new()),
            Ok(()) => {
                return transport.read(wait).await.map_err(|error| TransactFailure {
                    attempts,
                    error,
                    reply_lost: true,
                })
            }
            Err(error) if error.is_transient() && retry.allows_another(attempts) => {
                warn!(command = %command, attempt = attempts, error = %error, "write failed, retrying");
                retry.backoff(attempts - 1).await;
            }
            Err(error) => {
                return Err(TransactFailure {
                    attempts,
                    error,
                    reply_lost: false,
                })
            }
        }
    }
}
