//! Transport seam between the link supervisor and the radio
//!
//! The supervisor only needs three things from a transport: connect to an
//! address, enable notifications on one characteristic, and wait a bounded time
//! for the next event. Link loss is an ordinary [`Received`] variant, not an error.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Sensor service carrying the distance characteristic
pub const DISTANCE_SERVICE_UUID: Uuid = Uuid::from_u128(0x6009359f_df49_450e_b855_abd71b8e44c3);

/// Characteristic that notifies one little-endian `f32` per reading
pub const DISTANCE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4cdba726_4187_4827_badb_28ea8f906dd2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No Bluetooth adapter found. Ensure Bluetooth hardware is present and powered on.")]
    AdapterNotFound,

    #[error("Invalid device address '{0}'. Expected the form AA:BB:CC:DD:EE:FF.")]
    InvalidAddress(String),

    #[error("Device {address} not found within {timeout_ms}ms. Ensure it is powered on and in range.")]
    DeviceNotFound { address: String, timeout_ms: u64 },

    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Service {0} not found on device")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Characteristic {characteristic} does not support notifications")]
    NotifyUnsupported { characteristic: Uuid },

    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

impl TransportError {
    /// Errors raised while establishing the link (as opposed to setting it up)
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterNotFound
                | Self::InvalidAddress(_)
                | Self::DeviceNotFound { .. }
                | Self::ConnectFailed { .. }
        )
    }
}

/// Characteristic to enable notifications on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySetup {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl NotifySetup {
    pub fn notifications(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

impl Default for NotifySetup {
    fn default() -> Self {
        Self::notifications(DISTANCE_SERVICE_UUID, DISTANCE_CHARACTERISTIC_UUID)
    }
}

/// Outcome of one bounded wait on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Notification(Bytes),
    Timeout,
    LinkLost(String),
}

#[async_trait]
pub trait Transport: Send {
    type Session: Session;

    async fn connect(&mut self, address: &str) -> Result<Self::Session, TransportError>;
}

#[async_trait]
pub trait Session: Send {
    async fn subscribe(&mut self, setup: &NotifySetup) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification or link loss
    async fn receive(&mut self, timeout: Duration) -> Received;

    /// Best-effort teardown; the link may already be gone
    async fn close(&mut self);
}
