//! LED/buzzer output drivers
//!
//! The alert driver only ever sees [`OutputDriver`]. Two implementations:
//! - [`SysfsGpio`] - Linux sysfs GPIO (`/sys/class/gpio`), active-high
//! - [`LoggingOutput`] - logs transitions instead of touching hardware (dry run, replay)

use crate::domain::types::OutputPin;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long to wait for udev to create `gpioN/` after an export
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const EXPORT_SETTLE_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("gpio{pin}: {op} via {} failed: {source}", path.display())]
    Io {
        pin: u32,
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gpio{pin} did not appear under {} after export. Check the pin number and permissions.", root.display())]
    ExportTimeout { pin: u32, root: PathBuf },
}

/// Something that can assert or de-assert the alert outputs.
///
/// Owned by the alert driver's render thread; never shared.
pub trait OutputDriver: Send + 'static {
    fn set_output(&mut self, pin: OutputPin, asserted: bool) -> Result<(), OutputError>;

    fn set_all(&mut self, asserted: bool) -> Result<(), OutputError> {
        for pin in OutputPin::ALL {
            self.set_output(pin, asserted)?;
        }
        Ok(())
    }
}

/// Sysfs GPIO pair for the LED and buzzer
pub struct SysfsGpio {
    root: PathBuf,
    led: u32,
    buzzer: u32,
    /// Pins this process exported (and must unexport on release)
    exported: Vec<u32>,
    released: bool,
}

impl SysfsGpio {
    /// Export both pins (if needed), configure them as outputs and drive them low.
    pub fn open(root: impl AsRef<Path>, led: u32, buzzer: u32) -> Result<Self, OutputError> {
        let mut gpio = Self {
            root: root.as_ref().to_path_buf(),
            led,
            buzzer,
            exported: Vec::with_capacity(2),
            released: false,
        };

        for pin in [led, buzzer] {
            if !gpio.pin_dir(pin).exists() {
                gpio.write_attr(pin, "export", &gpio.root.join("export"), &pin.to_string())?;
                gpio.exported.push(pin);
                gpio.wait_for_export(pin)?;
            }
            gpio.write_attr(pin, "direction", &gpio.pin_dir(pin).join("direction"), "out")?;
            gpio.write_value(pin, false)?;
        }

        info!(root = %gpio.root.display(), led, buzzer, "gpio_opened");
        Ok(gpio)
    }

    /// De-assert both outputs and unexport what `open` exported.
    pub fn release(mut self) -> Result<(), OutputError> {
        self.released = true;
        self.cleanup()
    }

    /// Tries every step even after a failure; returns the first error.
    fn cleanup(&mut self) -> Result<(), OutputError> {
        let mut first_err = None;

        for pin in OutputPin::ALL {
            if let Err(e) = self.set_output(pin, false) {
                warn!(pin = %pin, error = %e, "gpio_deassert_failed");
                first_err.get_or_insert(e);
            }
        }
        for pin in std::mem::take(&mut self.exported) {
            let unexport = self.root.join("unexport");
            if let Err(e) = self.write_attr(pin, "unexport", &unexport, &pin.to_string()) {
                warn!(pin, error = %e, "gpio_unexport_failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(led = self.led, buzzer = self.buzzer, "gpio_released");
                Ok(())
            }
        }
    }

    fn pin_number(&self, pin: OutputPin) -> u32 {
        match pin {
            OutputPin::Led => self.led,
            OutputPin::Buzzer => self.buzzer,
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn wait_for_export(&self, pin: u32) -> Result<(), OutputError> {
        let dir = self.pin_dir(pin);
        for _ in 0..EXPORT_SETTLE_ATTEMPTS {
            if dir.exists() {
                return Ok(());
            }
            thread::sleep(EXPORT_SETTLE_STEP);
        }
        Err(OutputError::ExportTimeout { pin, root: self.root.clone() })
    }

    fn write_value(&self, pin: u32, asserted: bool) -> Result<(), OutputError> {
        let value = if asserted { "1" } else { "0" };
        self.write_attr(pin, "write value", &self.pin_dir(pin).join("value"), value)
    }

    fn write_attr(
        &self,
        pin: u32,
        op: &'static str,
        path: &Path,
        contents: &str,
    ) -> Result<(), OutputError> {
        fs::write(path, contents).map_err(|source| OutputError::Io {
            pin,
            op,
            path: path.to_path_buf(),
            source,
        })
    }
}

impl OutputDriver for SysfsGpio {
    fn set_output(&mut self, pin: OutputPin, asserted: bool) -> Result<(), OutputError> {
        self.write_value(self.pin_number(pin), asserted)
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "gpio_cleanup_failed");
        }
    }
}

/// Output driver that only logs, for running without hardware
#[derive(Debug, Default)]
pub struct LoggingOutput {
    led: bool,
    buzzer: bool,
}

impl LoggingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, pin: OutputPin) -> bool {
        match pin {
            OutputPin::Led => self.led,
            OutputPin::Buzzer => self.buzzer,
        }
    }
}

impl OutputDriver for LoggingOutput {
    fn set_output(&mut self, pin: OutputPin, asserted: bool) -> Result<(), OutputError> {
        let slot = match pin {
            OutputPin::Led => &mut self.led,
            OutputPin::Buzzer => &mut self.buzzer,
        };
        if *slot != asserted {
            debug!(pin = %pin, asserted, "output_changed");
        }
        *slot = asserted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(pins: &[u32]) -> TempDir {
        let root = TempDir::new().unwrap();
        for pin in pins {
            fs::create_dir_all(root.path().join(format!("gpio{pin}"))).unwrap();
        }
        root
    }

    fn read(root: &TempDir, rel: &str) -> String {
        fs::read_to_string(root.path().join(rel)).unwrap()
    }

    #[test]
    fn test_open_configures_outputs_low() {
        let root = fake_sysfs(&[27, 17]);
        let gpio = SysfsGpio::open(root.path(), 27, 17).unwrap();

        assert_eq!(read(&root, "gpio27/direction"), "out");
        assert_eq!(read(&root, "gpio17/direction"), "out");
        assert_eq!(read(&root, "gpio27/value"), "0");
        assert_eq!(read(&root, "gpio17/value"), "0");
        // Already present, so nothing was exported by us
        assert!(gpio.exported.is_empty());
    }

    #[test]
    fn test_set_output_maps_pins() {
        let root = fake_sysfs(&[27, 17]);
        let mut gpio = SysfsGpio::open(root.path(), 27, 17).unwrap();

        gpio.set_output(OutputPin::Led, true).unwrap();
        assert_eq!(read(&root, "gpio27/value"), "1");
        assert_eq!(read(&root, "gpio17/value"), "0");

        gpio.set_all(true).unwrap();
        assert_eq!(read(&root, "gpio17/value"), "1");
    }

    #[test]
    fn test_release_deasserts() {
        let root = fake_sysfs(&[27, 17]);
        let mut gpio = SysfsGpio::open(root.path(), 27, 17).unwrap();
        gpio.set_all(true).unwrap();

        gpio.release().unwrap();
        assert_eq!(read(&root, "gpio27/value"), "0");
        assert_eq!(read(&root, "gpio17/value"), "0");
        assert!(!root.path().join("unexport").exists());
    }

    #[test]
    fn test_release_unexports_even_when_a_write_fails() {
        let root = fake_sysfs(&[27, 17]);
        let mut gpio = SysfsGpio::open(root.path(), 27, 17).unwrap();
        gpio.set_all(true).unwrap();
        gpio.exported = vec![27, 17];
        fs::remove_dir_all(root.path().join("gpio27")).unwrap();

        let err = gpio.release().unwrap_err();

        assert!(matches!(err, OutputError::Io { pin: 27, .. }));
        // The other pin is still de-asserted and both are unexported
        assert_eq!(read(&root, "gpio17/value"), "0");
        assert_eq!(read(&root, "unexport"), "17");
    }

    #[test]
    fn test_drop_deasserts() {
        let root = fake_sysfs(&[27, 17]);
        {
            let mut gpio = SysfsGpio::open(root.path(), 27, 17).unwrap();
            gpio.set_all(true).unwrap();
        }
        assert_eq!(read(&root, "gpio27/value"), "0");
        assert_eq!(read(&root, "gpio17/value"), "0");
    }

    #[test]
    fn test_export_timeout_when_pin_never_appears() {
        let root = TempDir::new().unwrap();
        let err = SysfsGpio::open(root.path(), 27, 17).err().unwrap();

        assert!(matches!(err, OutputError::ExportTimeout { pin: 27, .. }));
        assert_eq!(read(&root, "export"), "27");
    }

    #[test]
    fn test_logging_output_tracks_state() {
        let mut out = LoggingOutput::new();
        out.set_all(true).unwrap();
        assert!(out.state(OutputPin::Led));
        assert!(out.state(OutputPin::Buzzer));
        out.set_output(OutputPin::Led, false).unwrap();
        assert!(!out.state(OutputPin::Led));
    }
}
