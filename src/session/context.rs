//! Explicit per-session context: timeouts, retry policy, drain depth.

use crate::config::SessionSettings;
use crate::error_recovery::RetryPolicy;
use std::time::Duration;

/// Settings a session needs, passed in at construction instead of being read
/// from process-wide state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    /// Instrument role name, recorded on every log line of the session.
    pub instrument_id: String,
    /// Time allowed for opening the transport and the identity query.
    pub connect_timeout: Duration,
    /// Default time allowed for a reply.
    pub read_timeout: Duration,
    /// Time a caller waits for exclusive access before giving up.
    pub acquire_timeout: Duration,
    /// Retry policy for transient transport failures.
    pub retry: RetryPolicy,
    /// Maximum error-queue entries drained after each command.
    pub error_queue_depth: usize,
}

impl SessionContext {
    /// Context with default timeouts.
    pub fn new(instrument_id: impl Into<String>) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            error_queue_depth: 20,
        }
    }

    /// Context from the `[session]` configuration section.
    pub fn from_settings(instrument_id: impl Into<String>, settings: &SessionSettings) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            },
            error_queue_depth: settings.error_queue_depth,
        }
    }

    /// Override the reply timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the acquisition timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}
