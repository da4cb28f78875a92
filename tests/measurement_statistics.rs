//! Statistics runs through the multimeter and oscilloscope facades.

use labctl::error::{LabError, MeasurementError};
use labctl::instrument::{Multimeter, MultimeterModel, Oscilloscope, ScopeModel};
use labctl::measurement::{CancelToken, MeasurementFunction, MeasurementRequest, StatisticalSummary};
use labctl::session::{InstrumentAddress, SessionContext};
use labctl::transport::MockTransport;
use labctl::Measure;
use std::time::Duration;

const OVERFLOW: f64 = 9.9e37;

async fn dmm(mock: &MockTransport) -> Multimeter<MockTransport> {
    let dmm = Multimeter::new(
        InstrumentAddress::new("TCPIP0::192.168.1.30::5025::SOCKET"),
        MultimeterModel::KEITHLEY_DMM6500,
        mock.clone(),
        SessionContext::new("bench_dmm"),
    );
    dmm.connect().await.unwrap();
    dmm
}

fn dc_volts() -> MeasurementRequest {
    MeasurementRequest::new(MeasurementFunction::DcVoltage)
        .with_range(10.0)
        .with_nplc(1.0)
}

#[tokio::test(start_paused = true)]
async fn test_twenty_valid_readings() {
    let mock = MockTransport::keithley_dmm6500();
    let dmm = dmm(&mock).await;
    mock.push_readings((0..20).map(|i| 5.0 + f64::from(i) * 1e-6));

    let summary = dmm
        .measure_statistics(&dc_volts(), 20, Duration::from_millis(100), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(summary.count, 20);
    assert_eq!(summary.discarded, 0);
    assert!(summary.complete);
    assert!((summary.mean - 5.0000095).abs() < 1e-9);
    assert!((summary.min - 5.0).abs() < 1e-12);
    assert!((summary.max - 5.000019).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_readings_are_excluded_from_statistics() {
    let mock = MockTransport::keithley_dmm6500();
    let dmm = dmm(&mock).await;
    let readings: Vec<f64> = (0..20)
        .map(|i| if matches!(i, 3 | 9 | 15) { OVERFLOW } else { 2.0 })
        .collect();
    mock.push_readings(readings);

    let summary = dmm
        .measure_statistics(&dc_volts(), 20, Duration::from_millis(100), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(summary.count, 17);
    assert_eq!(summary.discarded, 3);
    assert!((summary.mean - 2.0).abs() < 1e-12);
    assert_eq!(summary.standard_deviation, 0.0);
    assert_eq!(summary.max, 2.0);
}

#[tokio::test(start_paused = true)]
async fn test_mostly_invalid_run_is_insufficient_data() {
    let mock = MockTransport::keithley_dmm6500();
    let dmm = dmm(&mock).await;
    mock.push_readings([1.0, OVERFLOW, OVERFLOW, OVERFLOW, f64::NAN, 1.0]);

    let err = dmm
        .measure_statistics(&dc_volts(), 6, Duration::ZERO, &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LabError::Measurement(MeasurementError::InsufficientData {
            requested: 6,
            valid: 2,
            discarded: 4,
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_five_readings_returns_partial_summary() {
    let mock = MockTransport::keithley_dmm6500();
    let dmm = dmm(&mock).await;
    mock.set_default_reading(1.5);

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let request = dc_volts();
    let run = dmm.measure_statistics(&request, 20, Duration::from_millis(100), &cancel);
    let stop = async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        canceller.cancel();
    };
    let (summary, ()) = tokio::join!(run, stop);
    let summary: StatisticalSummary = summary.unwrap();

    assert_eq!(summary.count, 5);
    assert!(!summary.complete);
    assert_eq!(mock.count_frames(":READ?"), 5);
}

#[tokio::test]
async fn test_rejected_request_sends_nothing() {
    let mock = MockTransport::keithley_dmm6500();
    let dmm = dmm(&mock).await;
    mock.clear_frames();

    let request = MeasurementRequest::new(MeasurementFunction::DcVoltage).with_range(5000.0);
    let err = dmm.measure(&request).await.unwrap_err();

    assert_eq!(err.kind(), "measurement.out_of_range");
    assert!(mock.frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scope_statistics_on_channel() {
    let mock = MockTransport::keysight_dsox6004a();
    let scope = Oscilloscope::new(
        InstrumentAddress::new("TCPIP0::192.168.1.40::5025::SOCKET"),
        ScopeModel::KEYSIGHT_DSOX6004A,
        mock.clone(),
        SessionContext::new("bench_scope"),
    );
    scope.connect().await.unwrap();
    mock.push_readings([1.0, 1.2, 0.8, 1.0]);

    let request = MeasurementRequest::new(MeasurementFunction::PeakToPeak).on_channel(1);
    let summary = scope
        .measure_statistics(&request, 4, Duration::from_millis(10), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(summary.count, 4);
    assert!((summary.mean - 1.0).abs() < 1e-12);
    // Sample standard deviation of [1.0, 1.2, 0.8, 1.0].
    assert!((summary.standard_deviation - (0.08_f64 / 3.0).sqrt()).abs() < 1e-12);
    assert_eq!(mock.count_frames(":MEASure:VPP? CHANnel1"), 4);
}
