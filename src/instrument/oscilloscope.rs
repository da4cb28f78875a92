//! Oscilloscope facade.

use super::models::{ScopeModel, PROBE_ATTENUATIONS};
use super::{session_from_definition, InstrumentInfo};
use crate::codec::{Command, Coupling, Dialect, ScreenshotFormat};
use crate::config::{DiscoveryMap, InstrumentDefinition, InstrumentKind, SessionSettings};
use crate::error::{Constraint, LabResult, ValidationError};
use crate::measurement::{
    CancelToken, Measure, MeasurementEngine, MeasurementFunction, MeasurementRequest,
    MeasurementResult, StatisticalSummary,
};
use crate::session::{InstrumentAddress, Session, SessionContext};
use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Screen captures take far longer than ordinary queries.
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Requested vertical setup of one input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeChannelSettings {
    /// Vertical scale in V/div; snapped to the nearest 1-2-5 step.
    pub volts_per_div: f64,
    /// Vertical offset in volts.
    pub offset: f64,
    /// Input coupling.
    pub coupling: Coupling,
    /// Probe attenuation ratio.
    pub probe_attenuation: f64,
}

impl Default for ScopeChannelSettings {
    fn default() -> Self {
        Self {
            volts_per_div: 1.0,
            offset: 0.0,
            coupling: Coupling::Dc,
            probe_attenuation: 1.0,
        }
    }
}

/// Vertical setup as read back from the scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScopeChannelState {
    /// Input channel.
    pub channel: u8,
    /// Applied scale in V/div.
    pub scale: f64,
    /// Applied offset in volts.
    pub offset: f64,
}

/// A Keysight InfiniiVision oscilloscope.
#[derive(Debug)]
pub struct Oscilloscope<T: Transport> {
    session: Session<T>,
    engine: MeasurementEngine,
    model: ScopeModel,
}

impl<T: Transport> Oscilloscope<T> {
    /// Scope at `address`; the identity must match `model`.
    pub fn new(
        address: InstrumentAddress,
        model: ScopeModel,
        transport: T,
        context: SessionContext,
    ) -> Self {
        let session = Session::new(address, Dialect::Oscilloscope, transport, context)
            .with_expected_model(model.pattern);
        Self {
            session,
            engine: MeasurementEngine::new(model.capability()),
            model,
        }
    }

    /// Scope described by a configuration entry.
    pub fn from_config(
        definition: &InstrumentDefinition,
        settings: &SessionSettings,
        discovered: &DiscoveryMap,
        transport: T,
    ) -> LabResult<Self> {
        let model = ScopeModel::resolve(definition.model.as_deref());
        let mut session = session_from_definition(
            definition,
            InstrumentKind::Oscilloscope,
            settings,
            discovered,
            Dialect::Oscilloscope,
            transport,
        )?;
        if definition.model.is_some() {
            session = session.with_expected_model(model.pattern);
        }
        Ok(Self {
            session,
            engine: MeasurementEngine::new(model.capability()),
            model,
        })
    }

    /// Underlying session.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Model table in use.
    pub fn model(&self) -> ScopeModel {
        self.model
    }

    /// Open the session and verify the identity.
    pub async fn connect(&self) -> LabResult<()> {
        self.session
            .connect(self.session.context().connect_timeout)
            .await?;
        info!(model = self.model.name, "oscilloscope ready");
        Ok(())
    }

    /// Apply a vertical setup to `channel` and return what the scope reports.
    ///
    /// The scale is snapped to the nearest supported step. Probe ratios
    /// outside the supported set and non-finite offsets are rejected before
    /// anything is sent.
    pub async fn configure_channel(
        &self,
        channel: u8,
        settings: ScopeChannelSettings,
    ) -> LabResult<ScopeChannelState> {
        self.check_channel(channel)?;
        if !PROBE_ATTENUATIONS.contains(&settings.probe_attenuation) {
            return Err(ValidationError::OutOfRange {
                parameter: "probe_attenuation",
                value: settings.probe_attenuation,
                constraint: Constraint::OneOf(&PROBE_ATTENUATIONS),
            }
            .into());
        }
        if !settings.offset.is_finite() {
            return Err(ValidationError::OutOfRange {
                parameter: "offset",
                value: settings.offset,
                constraint: Constraint::Finite,
            }
            .into());
        }
        let scale = self.model.snap_vertical_scale(settings.volts_per_div)?;

        let mut bus = self.session.acquire().await?;
        bus.execute(&Command::SetChannelScale {
            channel,
            volts_per_div: scale,
        })
        .await?;
        bus.execute(&Command::SetChannelOffset {
            channel,
            volts: settings.offset,
        })
        .await?;
        bus.execute(&Command::SetChannelCoupling {
            channel,
            coupling: settings.coupling,
        })
        .await?;
        bus.execute(&Command::SetProbeAttenuation {
            channel,
            ratio: settings.probe_attenuation,
        })
        .await?;

        let state = ScopeChannelState {
            channel,
            scale: bus.query_number(&Command::QueryChannelScale { channel }).await?,
            offset: bus.query_number(&Command::QueryChannelOffset { channel }).await?,
        };
        if (state.scale - scale).abs() > scale * 1e-6 {
            warn!(channel, requested = scale, reported = state.scale, "scope applied a different scale");
        }
        debug!(channel, scale = state.scale, offset = state.offset, "channel configured");
        Ok(state)
    }

    /// Set the horizontal scale and return the value the scope reports.
    pub async fn set_timebase(&self, seconds_per_div: f64) -> LabResult<f64> {
        let scale = self.model.snap_timebase(seconds_per_div)?;
        let mut bus = self.session.acquire().await?;
        bus.execute(&Command::SetTimebaseScale {
            seconds_per_div: scale,
        })
        .await?;
        Ok(bus.query_number(&Command::QueryTimebaseScale).await?)
    }

    /// Single waveform measurement on `channel`.
    pub async fn measure_channel(
        &self,
        function: MeasurementFunction,
        channel: u8,
    ) -> LabResult<MeasurementResult> {
        let request = MeasurementRequest::new(function).on_channel(channel);
        Ok(self.engine.measure_once(&self.session, &request).await?)
    }

    /// Capture the display as an image.
    pub async fn capture_screenshot(&self, format: ScreenshotFormat) -> LabResult<Vec<u8>> {
        let wait = self.session.context().read_timeout.max(SCREENSHOT_TIMEOUT);
        let mut bus = self.session.acquire().await?;
        let image = bus.query_block(&Command::Screenshot(format), wait).await?;
        debug!(bytes = image.len(), ?format, "screenshot captured");
        Ok(image)
    }

    /// Identity and connection details.
    pub fn instrument_info(&self) -> InstrumentInfo {
        InstrumentInfo::of(&self.session, self.model.name)
    }

    /// Close the session.
    pub async fn disconnect(&self) -> LabResult<()> {
        Ok(self.session.disconnect(None).await?)
    }

    fn check_channel(&self, channel: u8) -> Result<(), ValidationError> {
        if (1..=self.model.channels).contains(&channel) {
            Ok(())
        } else {
            Err(ValidationError::OutOfRange {
                parameter: "channel",
                value: f64::from(channel),
                constraint: Constraint::ChannelRange {
                    max: self.model.channels,
                },
            })
        }
    }
}

#[async_trait]
impl<T: Transport> Measure for Oscilloscope<T> {
    async fn measure(&self, request: &MeasurementRequest) -> LabResult<MeasurementResult> {
        Ok(self.engine.measure_once(&self.session, request).await?)
    }

    async fn measure_statistics(
        &self,
        request: &MeasurementRequest,
        count: usize,
        interval: Duration,
        cancel: &CancelToken,
    ) -> LabResult<StatisticalSummary> {
        Ok(self
            .engine
            .measure_statistics(&self.session, request, count, interval, cancel)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use crate::transport::MockTransport;

    async fn scope(mock: &MockTransport) -> Oscilloscope<MockTransport> {
        let scope = Oscilloscope::new(
            InstrumentAddress::new("TCPIP0::10.0.0.4::5025::SOCKET"),
            ScopeModel::KEYSIGHT_DSOX6004A,
            mock.clone(),
            SessionContext::new("scope"),
        );
        scope.connect().await.unwrap();
        scope
    }

    #[tokio::test]
    async fn test_configure_channel_snaps_and_reads_back() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;

        let settings = ScopeChannelSettings {
            volts_per_div: 0.45,
            offset: -0.25,
            coupling: Coupling::Ac,
            probe_attenuation: 10.0,
        };
        let state = scope.configure_channel(2, settings).await.unwrap();

        assert_eq!(state.channel, 2);
        assert!((state.scale - 0.5).abs() < 1e-12);
        assert!((state.offset + 0.25).abs() < 1e-12);
        let (scale, offset, coupling, probe) = mock.scope_channel(2).unwrap();
        assert!((scale - 0.5).abs() < 1e-12);
        assert!((offset + 0.25).abs() < 1e-12);
        assert_eq!(coupling, "AC");
        assert!((probe - 10.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_invalid_probe_and_channel_send_nothing() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;
        mock.clear_frames();

        let settings = ScopeChannelSettings {
            probe_attenuation: 20.0,
            ..Default::default()
        };
        let err = scope.configure_channel(1, settings).await.unwrap_err();
        assert_eq!(err.kind(), "validation.out_of_range");

        let err = scope
            .configure_channel(5, ScopeChannelSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Validation(ValidationError::OutOfRange {
                constraint: Constraint::ChannelRange { max: 4 },
                ..
            })
        ));
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_offset_sends_nothing() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;
        mock.clear_frames();

        for offset in [f64::NAN, f64::INFINITY] {
            let settings = ScopeChannelSettings {
                offset,
                ..Default::default()
            };
            let err = scope.configure_channel(2, settings).await.unwrap_err();
            assert!(matches!(
                err,
                LabError::Validation(ValidationError::OutOfRange {
                    parameter: "offset",
                    constraint: Constraint::Finite,
                    ..
                })
            ));
        }
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_function_is_rejected() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;
        mock.clear_frames();

        let request = MeasurementRequest::new(MeasurementFunction::DcVoltage).on_channel(1);
        let err = scope.measure(&request).await.unwrap_err();
        assert_eq!(err.kind(), "measurement.out_of_range");
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn test_timebase_snaps_to_step() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;

        let applied = scope.set_timebase(1.1e-6).await.unwrap();
        assert!((applied - 1e-6).abs() < 1e-15);
        assert!((mock.timebase() - 1e-6).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_measure_channel() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;
        mock.push_reading(1.25);

        let result = scope
            .measure_channel(MeasurementFunction::PeakToPeak, 3)
            .await
            .unwrap();
        assert!((result.value - 1.25).abs() < 1e-12);
        assert_eq!(result.unit, "V");
        assert_eq!(mock.count_frames(":MEASure:VPP? CHANnel3"), 1);
    }

    #[tokio::test]
    async fn test_screenshot_returns_block_payload() {
        let mock = MockTransport::keysight_dsox6004a();
        let scope = scope(&mock).await;
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x01];
        mock.set_screenshot(&png);

        let image = scope.capture_screenshot(ScreenshotFormat::Png).await.unwrap();
        assert_eq!(image, png.to_vec());
    }
}
