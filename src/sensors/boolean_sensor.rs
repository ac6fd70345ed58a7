//! Shared boolean sensor state.
//!
//! A thread-safe PIR level that can be driven from any thread, e.g. by an
//! embedding application that reads the pin itself, or by tests.

use super::SensorSource;
use crate::protocol::PirState;
use std::sync::atomic::{AtomicBool, Ordering};

/// Thread-safe boolean sensor state.
///
/// # Example
/// ```ignore
/// let sensor = Arc::new(BooleanSensor::new(false));
/// let server = BroadcastServer::start(&config.server, sensor.clone()).await?;
///
/// // Driven by whatever owns the pin
/// sensor.set(true);
/// ```
pub struct BooleanSensor {
    state: AtomicBool,
}

impl BooleanSensor {
    /// Create a new boolean sensor with the given initial state.
    pub fn new(initial: bool) -> Self {
        Self {
            state: AtomicBool::new(initial),
        }
    }

    /// Get the current sensor state.
    pub fn get(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    /// Set the sensor state. Returns true if the value changed.
    pub fn set(&self, value: bool) -> bool {
        self.state.swap(value, Ordering::SeqCst) != value
    }
}

impl Default for BooleanSensor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SensorSource for BooleanSensor {
    fn read(&self) -> PirState {
        PirState::from(self.get())
    }
}
