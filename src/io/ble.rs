//! BLE transport for the ranging sensor (btleplug)
//!
//! Connect flow:
//! 1. Open the first adapter and its event stream (before connecting, so an early
//!    disconnect is not missed)
//! 2. Scan until a peripheral with the configured address shows up
//! 3. Connect, discover services
//!
//! Link loss is reported from any of: a `DeviceDisconnected` adapter event, the
//! notification stream ending, or a failed liveness probe after a quiet wait.

use crate::io::transport::{NotifySetup, Received, Session, Transport, TransportError};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(250);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self { scan_timeout: Duration::from_secs(10), connect_timeout: Duration::from_secs(10) }
    }
}

pub struct BleTransport {
    config: BleConfig,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }
}

pub fn parse_address(address: &str) -> Result<BDAddr, TransportError> {
    address.trim().parse().map_err(|_| TransportError::InvalidAddress(address.to_string()))
}

async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::AdapterNotFound)
}

/// Whole milliseconds, saturating
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn poll_peripherals(
    adapter: &Adapter,
    address: BDAddr,
    scan_timeout: Duration,
) -> Result<Option<Peripheral>, btleplug::Error> {
    let deadline = Instant::now().checked_add(scan_timeout);

    loop {
        let peripherals = adapter.peripherals().await?;
        if let Some(p) = peripherals.into_iter().find(|p| p.address() == address) {
            return Ok(Some(p));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
        tokio::time::sleep(SCAN_POLL).await;
    }
}

async fn find_peripheral(
    adapter: &Adapter,
    address: BDAddr,
    scan_timeout: Duration,
) -> Result<Peripheral, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    let found = poll_peripherals(adapter, address, scan_timeout).await;

    // Stop scanning on every path, including a failed poll
    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "ble_stop_scan_failed");
    }

    found?.ok_or_else(|| TransportError::DeviceNotFound {
        address: address.to_string(),
        timeout_ms: millis(scan_timeout),
    })
}

#[async_trait]
impl Transport for BleTransport {
    type Session = BleSession;

    async fn connect(&mut self, address: &str) -> Result<BleSession, TransportError> {
        let addr = parse_address(address)?;
        let adapter = default_adapter().await?;
        let events = adapter.events().await?;

        debug!(
            address = %addr,
            scan_timeout_ms = %self.config.scan_timeout.as_millis(),
            "ble_scanning"
        );
        let peripheral = find_peripheral(&adapter, addr, self.config.scan_timeout).await?;

        let connect_failed = |reason: String| TransportError::ConnectFailed {
            address: addr.to_string(),
            reason,
        };
        match tokio::time::timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(connect_failed(e.to_string())),
            Err(_) => {
                return Err(connect_failed(format!(
                    "timed out after {}ms",
                    millis(self.config.connect_timeout)
                )))
            }
        }
        peripheral.discover_services().await.map_err(|e| connect_failed(e.to_string()))?;

        info!(address = %addr, "ble_connected");
        Ok(BleSession { peripheral, events, notifications: None, characteristic: None })
    }
}

pub struct BleSession {
    peripheral: Peripheral,
    events: EventStream,
    notifications: Option<NotificationStream>,
    characteristic: Option<Uuid>,
}

impl BleSession {
    fn find_characteristic(&self, setup: &NotifySetup) -> Result<Characteristic, TransportError> {
        let services = self.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == setup.service)
            .ok_or(TransportError::ServiceNotFound(setup.service))?;
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == setup.characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound {
                service: setup.service,
                characteristic: setup.characteristic,
            })
    }

    async fn probe(&mut self) -> Received {
        match self.peripheral.is_connected().await {
            Ok(true) => Received::Timeout,
            Ok(false) => Received::LinkLost("device no longer connected".to_string()),
            Err(e) => Received::LinkLost(format!("connection probe failed: {e}")),
        }
    }
}

#[async_trait]
impl Session for BleSession {
    async fn subscribe(&mut self, setup: &NotifySetup) -> Result<(), TransportError> {
        let characteristic = self.find_characteristic(setup)?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(TransportError::NotifyUnsupported { characteristic: characteristic.uuid });
        }

        // Open the stream first so the first notification after subscribing is kept
        let notifications = self.peripheral.notifications().await?;
        // The stack writes the enable value to the configuration descriptor
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        info!(
            service = %setup.service,
            characteristic = %setup.characteristic,
            "ble_subscribed"
        );
        self.notifications = Some(notifications);
        self.characteristic = Some(characteristic.uuid);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Received {
        let (Some(notifications), Some(characteristic)) =
            (self.notifications.as_mut(), self.characteristic)
        else {
            return Received::LinkLost("receive before subscribe".to_string());
        };
        let id = self.peripheral.id();
        let quiet = tokio::time::sleep(timeout);
        tokio::pin!(quiet);

        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(n) if n.uuid == characteristic => {
                        return Received::Notification(Bytes::from(n.value));
                    }
                    Some(n) => {
                        debug!(uuid = %n.uuid, "ble_unexpected_notification");
                    }
                    None => return Received::LinkLost("notification stream closed".to_string()),
                },
                event = self.events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(peer)) if peer == id => {
                        return Received::LinkLost("device disconnected".to_string());
                    }
                    Some(_) => {}
                    None => return Received::LinkLost("adapter event stream closed".to_string()),
                },
                _ = &mut quiet => break,
            }
        }

        // Some stacks drop disconnect events; check before calling it a quiet period
        self.probe().await
    }

    async fn close(&mut self) {
        self.notifications = None;
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(error = %e, "ble_disconnect_failed");
        }
    }
}
