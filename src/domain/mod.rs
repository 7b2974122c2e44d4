//! Domain models - readings, alert targets and outputs
//!
//! - `DistanceSample` - one decoded sensor reading
//! - `AlertTarget` - the single value shared between the link and the alert driver
//! - `OutputPin` - the LED and buzzer outputs

pub mod types;

pub use types::{AlertTarget, DecodeError, DistanceSample, OutputPin, DISTANCE_PAYLOAD_LEN};
