//! Sensor simulation for testing without hardware.
//!
//! Produces motion bursts separated by idle gaps, both randomly jittered
//! around their configured means.

use super::SensorSource;
use crate::protocol::PirState;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

struct Schedule {
    /// End of the current motion burst.
    motion_until: Option<Instant>,
    next_burst: Instant,
}

pub struct SimulatedSensor {
    mean_idle: Duration,
    mean_burst: Duration,
    schedule: Mutex<Schedule>,
}

impl SimulatedSensor {
    pub fn new(mean_idle: Duration, mean_burst: Duration) -> Self {
        Self {
            mean_idle,
            mean_burst,
            schedule: Mutex::new(Schedule {
                motion_until: None,
                next_burst: Instant::now() + jitter(mean_idle),
            }),
        }
    }
}

/// Uniform in `[0.5, 1.5) * mean`.
fn jitter(mean: Duration) -> Duration {
    mean.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

impl SensorSource for SimulatedSensor {
    fn read(&self) -> PirState {
        let now = Instant::now();
        let mut schedule = self.schedule.lock();

        if schedule.motion_until.is_some_and(|until| now < until) {
            return PirState::Motion;
        }
        if now >= schedule.next_burst {
            let until = now + jitter(self.mean_burst);
            schedule.motion_until = Some(until);
            schedule.next_burst = until + jitter(self.mean_idle);
            return PirState::Motion;
        }
        PirState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle_before_first_burst() {
        let sensor = SimulatedSensor::new(Duration::from_secs(3600), Duration::from_secs(1));
        assert_eq!(sensor.read(), PirState::Idle);
    }

    #[test]
    fn test_burst_holds_motion() {
        let sensor = SimulatedSensor::new(Duration::ZERO, Duration::from_secs(3600));
        assert_eq!(sensor.read(), PirState::Motion);
        assert_eq!(sensor.read(), PirState::Motion);
    }

    #[test]
    fn test_jitter_bounds() {
        let mean = Duration::from_millis(1000);
        for _ in 0..100 {
            let value = jitter(mean);
            assert!(value >= Duration::from_millis(500));
            assert!(value < Duration::from_millis(1500));
        }
    }
}
