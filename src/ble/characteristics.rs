//! GATT characteristic handling.
//!
//! Connections talk to an instrument through the [`GattClient`] trait.
//! [`PeripheralClient`] implements it for a `btleplug` peripheral.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Notification received from a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// UUID of the characteristic that sent the notification.
    pub uuid: Uuid,
    /// The notification data.
    pub value: Vec<u8>,
}

/// Stream of notifications from every subscribed characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// The GATT operations a connection needs.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Open the link.
    async fn connect(&self) -> Result<()>;

    /// Whether the link is up.
    async fn is_connected(&self) -> bool;

    /// Discover services and cache their characteristics.
    async fn discover_services(&self) -> Result<()>;

    /// Open the notification stream. Call before subscribing so no
    /// notification is missed.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, uuid: Uuid) -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;
}

/// [`GattClient`] over a `btleplug` peripheral.
pub struct PeripheralClient {
    peripheral: Peripheral,
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
}

impl PeripheralClient {
    /// Wrap a peripheral found by the scanner.
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    fn characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl GattClient for PeripheralClient {
    async fn connect(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral already connected at BLE level");
            return Ok(());
        }
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral.discover_services().await?;

        let mut chars = self.characteristics.write();
        chars.clear();
        for service in self.peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                chars.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Discovered {} characteristics", chars.len());
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(&uuid)?;
        self.peripheral.subscribe(&characteristic).await?;
        debug!("Subscribed to notifications from {}", uuid);
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(&uuid)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PeripheralClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralClient")
            .field("id", &self.peripheral.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_clone() {
        let n = Notification {
            uuid: crate::ble::uuids::STD_CHARACTERISTIC_UUID,
            value: vec![1, 2, 3],
        };
        assert_eq!(n.clone(), n);
    }
}
