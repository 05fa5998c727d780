//! BLE scanning functionality.
//!
//! The scanner runs short scan windows back to back, keeps advertisements
//! from instruments (matched by local name) and pushes each decoded frame
//! onto a shared [`BoundedQueue`] of [`ScanResult`]s.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use super::characteristics::{GattClient, PeripheralClient};
use crate::config::BleConfig;
use crate::error::{Error, Result};
use crate::protocol::advertisement::{self, AdvertisementFrame};
use crate::queue::BoundedQueue;
use crate::utils::{cancellable_sleep, time_boxed, unix_timestamp};

/// A decoded advertisement and a handle to the device that sent it.
#[derive(Clone)]
pub struct ScanResult {
    /// Advertised local name.
    pub name: String,
    /// Whether the device accepts GATT connections.
    pub connectable: bool,
    /// Reception time.
    pub unix_timestamp: i64,
    /// The decoded frame.
    pub frame: AdvertisementFrame,
    /// Client for connecting to the device.
    pub client: Arc<dyn GattClient>,
}

impl ScanResult {
    /// Serial number of the sender.
    pub fn serial_number(&self) -> u32 {
        self.frame.serial_number
    }
}

impl std::fmt::Debug for ScanResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanResult")
            .field("name", &self.name)
            .field("serial_number", &self.frame.serial_number)
            .field("connectable", &self.connectable)
            .field("unix_timestamp", &self.unix_timestamp)
            .finish()
    }
}

/// Start/stop control over a scanner.
#[async_trait]
pub trait ScanControl: Send + Sync {
    /// Start scanning; a no-op while already scanning.
    async fn start(&self) -> Result<()>;

    /// Stop scanning; a no-op while stopped.
    async fn stop(&self) -> Result<()>;

    /// Whether the scan task is running.
    fn is_scanning(&self) -> bool;
}

/// Keep an advertisement if it comes from an instrument.
///
/// Returns the decoded frame and whether the sender is connectable.
pub fn accept_advertisement(
    config: &BleConfig,
    name: Option<&str>,
    manufacturer_data: &HashMap<u16, Vec<u8>>,
) -> Option<(AdvertisementFrame, bool)> {
    let name = name?;
    if !config.is_instrument_name(name) {
        return None;
    }
    let raw = advertisement::frame_from_manufacturer_data(manufacturer_data)?;
    let frame = advertisement::decode(&raw)?;
    Some((frame, config.is_connectable_name(name)))
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Duty-cycled BLE scanner for instruments.
pub struct BleScanner {
    adapter: Adapter,
    config: BleConfig,
    queue: Arc<BoundedQueue<ScanResult>>,
    running: Mutex<Option<Running>>,
    span: Span,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(
        config: BleConfig,
        queue: Arc<BoundedQueue<ScanResult>>,
        span: Span,
    ) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            parent: &span,
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, config, queue, span))
    }

    /// Create a scanner on a specific adapter.
    pub fn with_adapter(
        adapter: Adapter,
        config: BleConfig,
        queue: Arc<BoundedQueue<ScanResult>>,
        span: Span,
    ) -> Self {
        Self {
            adapter,
            config,
            queue,
            running: Mutex::new(None),
            span,
        }
    }

    /// Queue the scan results are pushed to.
    pub fn queue(&self) -> &Arc<BoundedQueue<ScanResult>> {
        &self.queue
    }
}

#[async_trait]
impl ScanControl for BleScanner {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.as_ref().map_or(false, |r| !r.task.is_finished()) {
            debug!(parent: &self.span, "Already scanning, ignoring start request");
            return Ok(());
        }

        info!(parent: &self.span, "Starting BLE scan for instruments");
        let cancel = CancellationToken::new();
        let task = ScanTask {
            adapter: self.adapter.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(task.run().instrument(self.span.clone()));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(Running { cancel, task }) = running else {
            debug!(parent: &self.span, "Not scanning, ignoring stop request");
            return Ok(());
        };

        info!(parent: &self.span, "Stopping BLE scan");
        cancel.cancel();
        let limit = self.config.scan_window() + self.config.disconnect_timeout();
        if tokio::time::timeout(limit, task).await.is_err() {
            warn!(parent: &self.span, "Scan task did not stop within {:?}", limit);
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |r| !r.task.is_finished())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
    }
}

struct ScanTask {
    adapter: Adapter,
    config: BleConfig,
    queue: Arc<BoundedQueue<ScanResult>>,
    cancel: CancellationToken,
}

impl ScanTask {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            if let Err(e) = self.scan_window().await {
                warn!("Scan window failed: {}", e);
                if !cancellable_sleep(&self.cancel, self.config.scan_error_backoff()).await {
                    break;
                }
            }
        }

        if let Err(e) = time_boxed(
            "stop scan",
            self.config.disconnect_timeout(),
            async { Ok(self.adapter.stop_scan().await?) },
        )
        .await
        {
            debug!("Stopping the scan failed: {}", e);
        }
        debug!("Scan loop ended");
    }

    async fn scan_window(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let window = tokio::time::sleep(self.config.scan_window());
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = &mut window => break,
                event = events.next() => match event {
                    Some(CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data }) => {
                        self.handle_advertisement(id, &manufacturer_data).await;
                    }
                    Some(_) => {}
                    None => {
                        return Err(Error::Internal("adapter event stream ended".to_string()));
                    }
                },
            }
        }

        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn handle_advertisement(
        &self,
        id: PeripheralId,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) {
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };
        let name = match peripheral.properties().await {
            Ok(Some(p)) => p.local_name,
            _ => return,
        };

        let Some((frame, connectable)) =
            accept_advertisement(&self.config, name.as_deref(), manufacturer_data)
        else {
            return;
        };

        trace!("Advertisement from #{} ({:?})", frame.serial_number, name);
        let result = ScanResult {
            name: name.unwrap_or_default(),
            connectable,
            unix_timestamp: unix_timestamp(),
            frame,
            client: Arc::new(PeripheralClient::new(peripheral)),
        };
        if self.queue.push(result).is_some() {
            trace!("Scan queue full, dropped oldest result");
        }
    }
}
