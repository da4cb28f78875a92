//! End-to-end power supply workflows against the simulated instrument.

use labctl::error::{Constraint, LabError, SessionError, ValidationError};
use labctl::instrument::{PowerSupply, SupplyModel};
use labctl::session::{InstrumentAddress, SessionContext, SessionState};
use labctl::transport::MockTransport;

async fn connected_2230(mock: &MockTransport) -> PowerSupply<MockTransport> {
    let psu = PowerSupply::new(
        InstrumentAddress::new("TCPIP0::192.168.1.20::5025::SOCKET"),
        SupplyModel::KEITHLEY_2230,
        mock.clone(),
        SessionContext::new("bench_psu"),
    );
    psu.connect().await.unwrap();
    psu
}

#[tokio::test]
async fn test_voltage_above_ovp_never_reaches_the_wire() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;
    mock.clear_frames();

    let err = psu
        .configure_channel(1, 12.0, 0.5, Some(10.0))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LabError::Validation(ValidationError::OutOfRange {
            parameter: "voltage_setpoint",
            constraint: Constraint::OvpLevel(_),
            ..
        })
    ));
    assert!(mock.frames().is_empty());
    assert!(psu.channel_config(1).is_none());
}

#[tokio::test]
async fn test_enable_before_configure_is_missing_prerequisite() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;
    mock.clear_frames();

    let err = psu.enable_channel_output(3).await.unwrap_err();

    assert_eq!(err.kind(), "validation.missing_prerequisite");
    assert_eq!(mock.count_frames(":OUTPut ON"), 0);
    assert!(!mock.channel(3).unwrap().output);
}

#[tokio::test]
async fn test_device_error_keeps_session_connected() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;
    mock.device_error_on(":CURRent 2.500000", -222, "Data out of range");

    let err = psu.configure_channel(2, 5.0, 2.5, None).await.unwrap_err();

    match err {
        LabError::Session(SessionError::DeviceError { errors, .. }) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code, -222);
            assert_eq!(errors[0].message, "Data out of range");
        }
        other => panic!("expected a device error, got {other:?}"),
    }
    assert_eq!(psu.session().state(), SessionState::Connected);
    assert!(psu.channel_config(2).is_none());

    // The session is still usable.
    psu.configure_channel(2, 5.0, 1.0, None).await.unwrap();
    assert!(psu.channel_config(2).is_some());
}

#[tokio::test]
async fn test_full_channel_cycle() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;

    let committed = psu.configure_channel(1, 12.0, 1.5, Some(13.0)).await.unwrap();
    assert_eq!(committed.voltage_setpoint, Some(12.0));
    assert_eq!(committed.current_limit, Some(1.5));

    psu.enable_channel_output(1).await.unwrap();
    let reading = psu.measure_channel_output(1).await.unwrap();
    assert!((reading.voltage - 12.0).abs() < 1e-6);
    assert!((reading.current - 1.2).abs() < 1e-6);

    psu.disable_channel_output(1).await.unwrap();
    assert!(!mock.channel(1).unwrap().output);
    assert!(!psu.channel_status(1).await.unwrap().output_enabled);

    psu.disconnect().await.unwrap();
    assert_eq!(psu.session().state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_shutdown_continues_past_failed_channel() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;
    for channel in 1..=3 {
        psu.configure_channel(channel, 5.0, 0.5, None).await.unwrap();
        psu.enable_channel_output(channel).await.unwrap();
    }
    mock.fail_writes_containing("CH2;:OUTPut OFF", 3);

    let err = psu.disable_all_outputs().await.unwrap_err();

    let LabError::Shutdown(shutdown) = err else {
        panic!("expected a shutdown error");
    };
    let failures = shutdown.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].channel, 2);
    assert_eq!(failures[0].kind, "session.unreachable");
    assert!(!mock.channel(1).unwrap().output);
    assert!(mock.channel(2).unwrap().output);
    assert!(!mock.channel(3).unwrap().output);
}

#[tokio::test]
async fn test_trip_latches_until_reset() {
    let mock = MockTransport::keithley_2230();
    let psu = connected_2230(&mock).await;
    psu.configure_channel(1, 5.0, 0.5, Some(6.0)).await.unwrap();
    mock.trip_on("CH1;:OUTPut ON", 1);

    let err = psu.enable_channel_output(1).await.unwrap_err();
    assert_eq!(err.kind(), "session.device_error");
    assert!(psu.get_interlock_state(1).ovp_tripped);

    let err = psu.enable_channel_output(1).await.unwrap_err();
    assert_eq!(err.kind(), "interlock.tripped");

    psu.reset_interlock(1).await.unwrap();
    assert!(!psu.get_interlock_state(1).ovp_tripped);
    psu.enable_channel_output(1).await.unwrap();
    assert!(mock.channel(1).unwrap().output);
}

#[tokio::test]
async fn test_single_channel_supply_rejects_channel_two() {
    let mock = MockTransport::keithley_2280s();
    let psu = PowerSupply::new(
        InstrumentAddress::new("192.168.1.21:5025"),
        SupplyModel::KEITHLEY_2280S,
        mock.clone(),
        SessionContext::new("precision_psu"),
    );
    psu.connect().await.unwrap();
    mock.clear_frames();

    let err = psu.configure_channel(2, 5.0, 1.0, None).await.unwrap_err();
    assert_eq!(err.kind(), "validation.out_of_range");
    assert!(mock.frames().is_empty());

    psu.configure_channel(1, 60.0, 2.0, None).await.unwrap();
    assert!((mock.channel(1).unwrap().voltage - 60.0).abs() < 1e-9);
}
