//! Bench multimeter facade.

use super::models::MultimeterModel;
use super::{session_from_definition, InstrumentInfo};
use crate::codec::{Command, DeviceErrorEntry, Dialect};
use crate::config::{DiscoveryMap, InstrumentDefinition, InstrumentKind, SessionSettings};
use crate::error::LabResult;
use crate::measurement::{
    CancelToken, Measure, MeasurementEngine, MeasurementFunction, MeasurementRequest,
    MeasurementResult, StatisticalSummary,
};
use crate::session::{InstrumentAddress, Session, SessionContext};
use crate::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// A Keithley DMM6500/DMM7510 multimeter.
#[derive(Debug)]
pub struct Multimeter<T: Transport> {
    session: Session<T>,
    engine: MeasurementEngine,
    model: MultimeterModel,
}

impl<T: Transport> Multimeter<T> {
    /// Meter at `address`; the identity must match `model`.
    pub fn new(
        address: InstrumentAddress,
        model: MultimeterModel,
        transport: T,
        context: SessionContext,
    ) -> Self {
        let session = Session::new(address, Dialect::PrecisionMultimeter, transport, context)
            .with_expected_model(model.pattern);
        Self {
            session,
            engine: MeasurementEngine::new(model.capability()),
            model,
        }
    }

    /// Meter described by a configuration entry.
    pub fn from_config(
        definition: &InstrumentDefinition,
        settings: &SessionSettings,
        discovered: &DiscoveryMap,
        transport: T,
    ) -> LabResult<Self> {
        let model = MultimeterModel::resolve(definition.model.as_deref());
        let mut session = session_from_definition(
            definition,
            InstrumentKind::Multimeter,
            settings,
            discovered,
            Dialect::PrecisionMultimeter,
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

    /// Engine used for measurements.
    pub fn engine(&self) -> &MeasurementEngine {
        &self.engine
    }

    /// Connect, then preset the meter and abort any running trigger model.
    pub async fn connect(&self) -> LabResult<()> {
        self.session
            .connect(self.session.context().connect_timeout)
            .await?;
        let mut bus = self.session.acquire().await?;
        bus.execute(&Command::Preset).await?;
        bus.execute(&Command::Abort).await?;
        info!(model = self.model.name, "multimeter ready");
        Ok(())
    }

    /// One capacitance reading in farads. `range` rounds up to the next
    /// supported range; `None` leaves autorange on.
    pub async fn measure_capacitance(&self, range: Option<f64>) -> LabResult<MeasurementResult> {
        let mut request = MeasurementRequest::new(MeasurementFunction::Capacitance);
        request.range = range;
        self.measure(&request).await
    }

    /// Drain the instrument error queue.
    pub async fn check_instrument_errors(&self) -> LabResult<Vec<DeviceErrorEntry>> {
        let mut bus = self.session.acquire().await?;
        let errors = bus.drain_error_queue().await?;
        for entry in &errors {
            warn!(error = %entry, "instrument error");
        }
        Ok(errors)
    }

    /// Identity and connection details.
    pub fn instrument_info(&self) -> InstrumentInfo {
        InstrumentInfo::of(&self.session, self.model.name)
    }

    /// Abort and clear status (best effort), then close the session.
    pub async fn disconnect(&self) -> LabResult<()> {
        if let Ok(mut bus) = self.session.acquire().await {
            for command in [Command::Abort, Command::ClearStatus] {
                if let Err(e) = bus.execute(&command).await {
                    warn!(command = %command, error = %e, "cleanup before disconnect failed");
                }
            }
        }
        Ok(self.session.disconnect(None).await?)
    }
}

#[async_trait]
impl<T: Transport> Measure for Multimeter<T> {
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
