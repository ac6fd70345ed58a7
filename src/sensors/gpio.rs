//! PIR input read from a Linux sysfs GPIO value file.

use super::SensorSource;
use crate::protocol::PirState;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Reads `/sys/class/gpio/gpioN/value` (or any file holding `0` or `1`).
///
/// The pin must already be exported and configured as an input. An
/// unreadable or unexpected value reads as [`PirState::Idle`].
pub struct GpioValueSensor {
    path: PathBuf,
    /// Only the first failure is logged at warn level.
    warned: AtomicBool,
}

impl GpioValueSensor {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            warned: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn report(&self, reason: &str) {
        if self.warned.swap(true, Ordering::Relaxed) {
            debug!("GPIO {}: {}", self.path.display(), reason);
        } else {
            warn!("GPIO {}: {} (reading as idle)", self.path.display(), reason);
        }
    }
}

impl SensorSource for GpioValueSensor {
    fn read(&self) -> PirState {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match raw.trim() {
                "1" => PirState::Motion,
                "0" => PirState::Idle,
                other => {
                    self.report(&format!("unexpected value {:?}", other));
                    PirState::Idle
                }
            },
            Err(e) => {
                self.report(&e.to_string());
                PirState::Idle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_value_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pir-link-{}-{}-value",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_reads_sysfs_levels() {
        let path = temp_value_file("levels", "1\n");
        let sensor = GpioValueSensor::new(&path);
        assert_eq!(sensor.read(), PirState::Motion);

        std::fs::write(&path, "0\n").unwrap();
        assert_eq!(sensor.read(), PirState::Idle);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_garbage_reads_idle() {
        let path = temp_value_file("garbage", "high");
        let sensor = GpioValueSensor::new(&path);
        assert_eq!(sensor.read(), PirState::Idle);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_reads_idle() {
        let sensor = GpioValueSensor::new("/nonexistent/gpio24/value");
        assert_eq!(sensor.read(), PirState::Idle);
        assert_eq!(sensor.read(), PirState::Idle);
    }
}
