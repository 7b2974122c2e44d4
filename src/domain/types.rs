//! Shared types for the proximity alert

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Width of a distance notification payload (one `f32`)
pub const DISTANCE_PAYLOAD_LEN: usize = 4;

/// A single distance reading in centimeters, as pushed by the ranging sensor.
///
/// Negative values are valid on the wire and mean "no signal".
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(transparent)]
pub struct DistanceSample(pub f32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("distance payload must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

impl DistanceSample {
    /// Decode a notification payload: exactly 4 bytes, little-endian IEEE-754 single.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; DISTANCE_PAYLOAD_LEN] = payload.try_into().map_err(|_| {
            DecodeError::WrongLength { expected: DISTANCE_PAYLOAD_LEN, actual: payload.len() }
        })?;
        Ok(Self(f32::from_le_bytes(bytes)))
    }

    /// Encode as a notification payload (used by the replay transport)
    pub fn encode(self) -> [u8; DISTANCE_PAYLOAD_LEN] {
        self.0.to_le_bytes()
    }

    pub fn cm(self) -> f32 {
        self.0
    }
}

impl fmt::Display for DistanceSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}cm", self.0)
    }
}

/// What the alert driver should currently render.
///
/// `Blinking` always carries a strictly positive half-period; build it with
/// [`AlertTarget::blinking`] to keep that invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertTarget {
    #[default]
    Idle,
    Blinking(Duration),
}

impl AlertTarget {
    /// Returns `Idle` for a zero interval, so a reader can never see `Blinking(0)`.
    pub fn blinking(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::Idle
        } else {
            Self::Blinking(interval)
        }
    }

    pub fn from_interval(interval: Option<Duration>) -> Self {
        interval.map_or(Self::Idle, Self::blinking)
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Idle => None,
            Self::Blinking(interval) => Some(*interval),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for AlertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Blinking(interval) => write!(f, "blinking({}ms)", interval.as_millis()),
        }
    }
}

/// The two outputs driven by the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputPin {
    Led,
    Buzzer,
}

impl OutputPin {
    pub const ALL: [OutputPin; 2] = [OutputPin::Led, OutputPin::Buzzer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Led => "led",
            Self::Buzzer => "buzzer",
        }
    }
}

impl fmt::Display for OutputPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
