//! IO modules - sensor link and output pins
//!
//! - `transport` - Transport/session traits and the sensor's GATT identifiers
//! - `ble` - btleplug implementation of the transport
//! - `replay` - Scripted transport for dry runs and tests
//! - `gpio` - Output drivers (sysfs GPIO, logging)

pub mod ble;
pub mod gpio;
pub mod replay;
pub mod transport;

// Re-export commonly used types
pub use ble::{BleConfig, BleTransport};
pub use gpio::{LoggingOutput, OutputDriver, OutputError, SysfsGpio};
pub use replay::{parse_script, ReplayTransport, SessionScript};
pub use transport::{NotifySetup, Received, Session, Transport, TransportError};
