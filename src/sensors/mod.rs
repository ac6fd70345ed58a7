//! Sensor sources polled by the broadcast server.
//!
//! The server only needs a side-effect-free read of the current PIR level.
//! Any hardware access stays behind the [`SensorSource`] trait.

pub mod boolean_sensor;
pub mod gpio;
pub mod simulated;

pub use boolean_sensor::BooleanSensor;
pub use gpio::GpioValueSensor;
pub use simulated::SimulatedSensor;

use crate::config::{SensorConfig, SensorKind};
use crate::protocol::PirState;
use std::sync::Arc;

/// A polled binary motion input.
///
/// Implementations must be cheap to call at the broadcast rate and must not
/// change any observable state of the sensor.
pub trait SensorSource: Send + Sync {
    fn read(&self) -> PirState;
}

/// Build the sensor source selected by configuration.
pub fn from_config(config: &SensorConfig) -> Arc<dyn SensorSource> {
    match config.kind {
        SensorKind::Gpio => Arc::new(GpioValueSensor::new(&config.gpio_value_path)),
        SensorKind::Simulated => Arc::new(SimulatedSensor::new(
            config.simulated_idle,
            config.simulated_burst,
        )),
    }
}
