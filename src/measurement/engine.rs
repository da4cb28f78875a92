//! Request validation, single readings and the statistics loop.

use super::{MeasurementCapability, MeasurementRequest, MeasurementResult, StatisticalSummary};
use crate::codec::{reading_is_valid, Command};
use crate::error::{MeasurementError, SessionError};
use crate::session::{Session, SessionState};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation for long measurement loops.
///
/// Clones share the flag. Cancelling wakes a loop that is sleeping between
/// readings; a reading in flight is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Runs measurements against one instrument's capability.
#[derive(Debug, Clone)]
pub struct MeasurementEngine {
    capability: MeasurementCapability,
    min_valid_fraction: f64,
}

impl MeasurementEngine {
    /// Engine requiring half of the requested readings to be valid.
    pub fn new(capability: MeasurementCapability) -> Self {
        Self {
            capability,
            min_valid_fraction: 0.5,
        }
    }

    /// Change the fraction of valid readings a statistic needs.
    pub fn with_min_valid_fraction(mut self, fraction: f64) -> Self {
        self.min_valid_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Capability requests are validated against.
    pub fn capability(&self) -> &MeasurementCapability {
        &self.capability
    }

    /// Check `request` against the capability and snap it to settings the
    /// instrument accepts. Nothing is sent.
    ///
    /// Ranges round up to the next supported range so the signal stays
    /// inside it; integration times round to the nearest supported value.
    pub fn validate(&self, request: &MeasurementRequest) -> Result<MeasurementRequest, MeasurementError> {
        let capability = &self.capability;
        let mut validated = request.clone();

        if !capability.supports(request.function) {
            return Err(out_of_range(
                "function",
                f64::NAN,
                format!("{:?} is not measured by this instrument", request.function),
            ));
        }

        if capability.channels > 0 {
            match request.channel {
                Some(ch) if (1..=capability.channels).contains(&ch) => {}
                other => {
                    return Err(MeasurementError::OutOfRange {
                        parameter: "channel",
                        value: f64::from(other.unwrap_or(0)),
                        detail: format!("channel must be 1..={}", capability.channels),
                    })
                }
            }
        }

        if let Some(range) = request.range {
            let Some(ranges) = capability.ranges_for(request.function) else {
                return Err(out_of_range("range", range, format!("{:?} has no selectable range", request.function)));
            };
            if !(range.is_finite() && range > 0.0) {
                return Err(out_of_range("range", range, "range must be positive".into()));
            }
            let Some(&snapped) = ranges.iter().find(|&&r| r >= range * (1.0 - 1e-9)) else {
                let largest = ranges.last().copied().unwrap_or_default();
                return Err(out_of_range("range", range, format!("largest range is {largest}")));
            };
            if snapped != range {
                warn!(requested = range, applied = snapped, "range rounded up to the next supported range");
            }
            validated.range = Some(snapped);
        }

        if let Some(resolution) = request.resolution {
            if !request.function.supports_integration() {
                return Err(out_of_range(
                    "resolution",
                    resolution,
                    format!("{:?} has no resolution setting", request.function),
                ));
            }
            if !(resolution.is_finite() && resolution > 0.0) || resolution < capability.resolution_floor {
                return Err(out_of_range(
                    "resolution",
                    resolution,
                    format!("finest resolution is {:E}", capability.resolution_floor),
                ));
            }
        }

        if let Some(nplc) = request.nplc {
            if !request.function.supports_integration() || capability.nplc_values.is_empty() {
                return Err(out_of_range(
                    "nplc",
                    nplc,
                    format!("{:?} has no integration time", request.function),
                ));
            }
            let lowest = capability.nplc_values[0];
            let highest = capability.nplc_values[capability.nplc_values.len() - 1];
            if !(lowest..=highest).contains(&nplc) {
                return Err(out_of_range("nplc", nplc, format!("nplc must be {lowest}..={highest}")));
            }
            let snapped = capability
                .nplc_values
                .iter()
                .copied()
                .min_by(|a, b| (a - nplc).abs().total_cmp(&(b - nplc).abs()))
                .unwrap_or(nplc);
            if snapped != nplc {
                warn!(requested = nplc, applied = snapped, "nplc rounded to nearest supported value");
            }
            validated.nplc = Some(snapped);
        }

        Ok(validated)
    }

    /// Validate, then take one reading.
    pub async fn measure_once<T: Transport>(
        &self,
        session: &Session<T>,
        request: &MeasurementRequest,
    ) -> Result<MeasurementResult, MeasurementError> {
        let request = self.validate(request)?;
        self.read(session, &request).await
    }

    async fn read<T: Transport>(
        &self,
        session: &Session<T>,
        request: &MeasurementRequest,
    ) -> Result<MeasurementResult, MeasurementError> {
        let wait = request.timeout.unwrap_or(session.context().read_timeout);
        let command = Command::Measure(request.clone());
        let mut guard = session.acquire().await?;
        let response = match guard.execute_with_timeout(&command, wait).await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(function = ?request.function, ?wait, "no reading before timeout");
                return Err(MeasurementError::Timeout { timeout: wait });
            }
            Err(e) => return Err(e.into()),
        };
        drop(guard);

        let value = response.as_number().ok_or_else(|| SessionError::Protocol {
            command: command.to_string(),
            source: crate::error::DecodeError::malformed("number", format!("{response:?}").as_bytes()),
        })?;
        let valid = reading_is_valid(value);
        if !valid {
            debug!(function = ?request.function, value, "reading flagged invalid");
        }
        Ok(MeasurementResult {
            function: request.function,
            value,
            unit: request.function.unit(),
            timestamp: Utc::now(),
            valid,
        })
    }

    /// Take `count` readings `interval` apart and summarize the valid ones.
    ///
    /// The session is acquired per reading, so other callers can interleave.
    /// Invalid readings and readings the instrument rejected are counted and
    /// dropped. Cancelling keeps what was collected and returns a summary
    /// marked incomplete; it only fails when not a single valid reading was
    /// taken. A failure that leaves the session unusable ends the run with
    /// [`MeasurementError::Interrupted`], carrying the readings so far.
    pub async fn measure_statistics<T: Transport>(
        &self,
        session: &Session<T>,
        request: &MeasurementRequest,
        count: usize,
        interval: Duration,
        cancel: &CancelToken,
    ) -> Result<StatisticalSummary, MeasurementError> {
        let request = self.validate(request)?;
        let mut readings = Vec::with_capacity(count);
        let mut discarded = 0;
        let mut cancelled = false;

        for index in 0..count {
            if index > 0 && !interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                info!(taken = index, requested = count, "statistics cancelled");
                cancelled = true;
                break;
            }
            match self.read(session, &request).await {
                Ok(result) if result.valid => readings.push(result.value),
                Ok(_) => discarded += 1,
                Err(e) if session.state() == SessionState::Connected => {
                    warn!(reading = index, error = %e, "reading failed, continuing");
                    discarded += 1;
                }
                Err(e) => {
                    error!(reading = index, error = %e, "statistics run interrupted");
                    return Err(MeasurementError::Interrupted {
                        summary: StatisticalSummary::from_readings(&readings, discarded, false),
                        source: Box::new(e),
                    });
                }
            }
        }

        let insufficient = MeasurementError::InsufficientData {
            requested: count,
            valid: readings.len(),
            discarded,
        };
        let required = self.required_valid(count);
        if !cancelled && readings.len() < required {
            warn!(valid = readings.len(), required, discarded, "too few valid readings");
            return Err(insufficient);
        }
        let summary = StatisticalSummary::from_readings(&readings, discarded, !cancelled)
            .ok_or(insufficient)?;
        info!(
            count = summary.count,
            discarded,
            mean = summary.mean,
            std = summary.standard_deviation,
            complete = summary.complete,
            "statistics complete"
        );
        Ok(summary)
    }

    fn required_valid(&self, count: usize) -> usize {
        ((count as f64 * self.min_valid_fraction).ceil() as usize).max(1)
    }
}

fn out_of_range(parameter: &'static str, value: f64, detail: String) -> MeasurementError {
    MeasurementError::OutOfRange {
        parameter,
        value,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Dialect;
    use crate::measurement::MeasurementFunction;
    use crate::session::{InstrumentAddress, SessionContext, SessionState};
    use crate::transport::MockTransport;

    fn dmm_capability() -> MeasurementCapability {
        MeasurementCapability {
            functions: vec![
                MeasurementFunction::DcVoltage,
                MeasurementFunction::DcCurrent,
                MeasurementFunction::Resistance,
                MeasurementFunction::Frequency,
            ],
            voltage_ranges: vec![0.1, 1.0, 10.0, 100.0, 1000.0],
            current_ranges: vec![1e-2, 1e-1, 1.0, 3.0],
            resistance_ranges: vec![10.0, 100.0, 1e3, 1e4],
            capacitance_ranges: Vec::new(),
            nplc_values: vec![0.01, 0.1, 1.0, 10.0],
            resolution_floor: 1e-7,
            channels: 0,
        }
    }

    async fn dmm(mock: &MockTransport) -> Session<MockTransport> {
        let session = Session::new(
            InstrumentAddress::new("dmm"),
            Dialect::PrecisionMultimeter,
            mock.clone(),
            SessionContext::new("dmm"),
        );
        session.connect(Duration::from_secs(1)).await.unwrap();
        session
    }

    fn dc() -> MeasurementRequest {
        MeasurementRequest::new(MeasurementFunction::DcVoltage)
    }

    #[test]
    fn test_range_snaps_up() {
        let engine = MeasurementEngine::new(dmm_capability());
        let request = engine.validate(&dc().with_range(5.0)).unwrap();
        assert_eq!(request.range, Some(10.0));
        let request = engine.validate(&dc().with_range(10.0)).unwrap();
        assert_eq!(request.range, Some(10.0));
    }

    #[test]
    fn test_range_above_maximum_rejected() {
        let engine = MeasurementEngine::new(dmm_capability());
        let err = engine.validate(&dc().with_range(2000.0)).unwrap_err();
        assert!(matches!(err, MeasurementError::OutOfRange { parameter: "range", .. }));
    }

    #[tokio::test]
    async fn test_unlisted_function_rejected_before_sending() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.clear_frames();
        let engine = MeasurementEngine::new(dmm_capability());

        let request = MeasurementRequest::new(MeasurementFunction::Capacitance);
        let err = engine.measure_once(&session, &request).await.unwrap_err();
        assert!(matches!(err, MeasurementError::OutOfRange { parameter: "function", .. }));
        assert!(mock.frames().is_empty());
    }

    #[test]
    fn test_resolution_below_floor_rejected() {
        let engine = MeasurementEngine::new(dmm_capability());
        let err = engine.validate(&dc().with_resolution(1e-9)).unwrap_err();
        assert_eq!(err.kind(), "measurement.out_of_range");
        assert!(engine.validate(&dc().with_resolution(1e-6)).is_ok());
    }

    #[test]
    fn test_nplc_snaps_to_nearest() {
        let engine = MeasurementEngine::new(dmm_capability());
        let request = engine.validate(&dc().with_nplc(0.8)).unwrap();
        assert_eq!(request.nplc, Some(1.0));
        assert!(engine.validate(&dc().with_nplc(50.0)).is_err());
    }

    #[test]
    fn test_channel_required_when_addressable() {
        let mut capability = dmm_capability();
        capability.channels = 4;
        capability.functions.push(MeasurementFunction::PeakToPeak);
        let engine = MeasurementEngine::new(capability);
        let peak = MeasurementRequest::new(MeasurementFunction::PeakToPeak);
        assert!(engine.validate(&peak).is_err());
        assert!(engine.validate(&peak.clone().on_channel(5)).is_err());
        assert!(engine.validate(&peak.on_channel(2)).is_ok());
    }

    #[tokio::test]
    async fn test_rejected_request_sends_nothing() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.clear_frames();
        let engine = MeasurementEngine::new(dmm_capability());

        let err = engine
            .measure_once(&session, &dc().with_range(5000.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "measurement.out_of_range");
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn test_measure_once_reports_overflow_as_invalid() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.push_readings([1.25, 9.9e37]);
        let engine = MeasurementEngine::new(dmm_capability());

        let first = engine.measure_once(&session, &dc()).await.unwrap();
        assert!(first.valid);
        assert_eq!(first.unit, "V");
        assert!((first.value - 1.25).abs() < 1e-12);

        let second = engine.measure_once(&session, &dc()).await.unwrap();
        assert!(!second.valid);
    }

    #[tokio::test]
    async fn test_lost_reading_is_a_timeout() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.drop_replies_containing(":READ?", 1);
        let engine = MeasurementEngine::new(dmm_capability());

        let request = dc().with_timeout(Duration::from_millis(250));
        let err = engine.measure_once(&session, &request).await.unwrap_err();
        assert!(matches!(err, MeasurementError::Timeout { timeout } if timeout == Duration::from_millis(250)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_statistics_discard_invalid_readings() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.set_default_reading(2.0);
        mock.push_readings([9.9e37, 2.0, f64::NAN, 2.0, 9.9e37]);
        let engine = MeasurementEngine::new(dmm_capability());

        let summary = engine
            .measure_statistics(&session, &dc(), 20, Duration::ZERO, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.count, 17);
        assert_eq!(summary.discarded, 3);
        assert!(summary.complete);
        assert!((summary.mean - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_statistics_need_half_valid() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.set_default_reading(9.9e37);
        mock.push_readings([1.0, 1.0, 1.0, 1.0]);
        let engine = MeasurementEngine::new(dmm_capability());

        let err = engine
            .measure_statistics(&session, &dc(), 10, Duration::ZERO, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeasurementError::InsufficientData {
                requested: 10,
                valid: 4,
                discarded: 6
            }
        ));
    }

    #[tokio::test]
    async fn test_rejected_reading_is_discarded_and_run_continues() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.push_readings([1.0, 2.0, 3.0, 4.0]);
        mock.push_device_error(-230, "Data corrupt or stale");
        let engine = MeasurementEngine::new(dmm_capability());

        let summary = engine
            .measure_statistics(&session, &dc(), 4, Duration::ZERO, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.discarded, 1);
        assert!(summary.complete);
        assert!((summary.mean - 3.0).abs() < 1e-12);
        assert_eq!(mock.count_frames(":READ?"), 4);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_instrument_interrupts_with_partial_summary() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.push_readings([1.0, 3.0]);
        let engine = MeasurementEngine::new(dmm_capability());

        // Readings go out at 0, 100 and 200 ms; the third reply never comes.
        let injector = {
            let mock = mock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                mock.drop_replies_containing(":READ?", 1);
            })
        };
        let request = dc().with_timeout(Duration::from_millis(50));
        let err = engine
            .measure_statistics(&session, &request, 5, Duration::from_millis(100), &CancelToken::new())
            .await
            .unwrap_err();
        injector.await.unwrap();

        assert_eq!(err.kind(), "measurement.interrupted");
        let MeasurementError::Interrupted { summary, source } = err else {
            panic!("expected an interrupted run");
        };
        assert!(matches!(*source, MeasurementError::Timeout { .. }));
        let summary = summary.unwrap();
        assert_eq!(summary.count, 2);
        assert!(!summary.complete);
        assert!((summary.mean - 2.0).abs() < 1e-12);
        assert_eq!(mock.count_frames(":READ?"), 3);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_cancel_before_first_reading() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        let engine = MeasurementEngine::new(dmm_capability());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = engine
            .measure_statistics(&session, &dc(), 5, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "measurement.insufficient_data");
        assert_eq!(mock.count_frames(":READ?"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_loop_returns_partial_summary() {
        let mock = MockTransport::keithley_dmm6500();
        let session = dmm(&mock).await;
        mock.set_default_reading(0.5);
        let engine = MeasurementEngine::new(dmm_capability());
        let cancel = CancelToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(450)).await;
                cancel.cancel();
            })
        };
        let summary = engine
            .measure_statistics(&session, &dc(), 20, Duration::from_millis(100), &cancel)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(summary.count, 5);
        assert!(!summary.complete);
    }
}
