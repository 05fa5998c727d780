//! Top-level supervisor for serial and BLE instruments.
//!
//! A [`DeviceManager`] runs one task that ticks both fleet managers, owns
//! the merged [`FleetAggregate`], and hands batches to an [`Uploader`] on a
//! fixed interval. Batches the uploader rejects are put back and offered
//! again with the next upload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::ble::BleFleetManager;
use crate::config::{Config, ManagerConfig};
use crate::data::{DeviceEvent, DeviceIdentity, DiagnosticRecord, EventSource, FleetAggregate};
use crate::queue::BoundedQueue;
use crate::serial::{SerialFleetManager, SystemSerial};
use crate::upload::Uploader;

/// Capacity of the device event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStatus {
    /// Whether serial instruments are being managed.
    pub serial_enabled: bool,
    /// Whether BLE instruments are being managed.
    pub ble_enabled: bool,
    /// Serial instruments with a confirmed identity and a live link.
    pub serial_devices: Vec<DeviceIdentity>,
    /// BLE instruments with a live GATT link.
    pub ble_devices: Vec<DeviceIdentity>,
    /// Seconds until the next hand-off to the uploader.
    pub seconds_until_upload: u64,
    /// Records waiting for the next upload.
    pub pending_records: usize,
}

struct Shared {
    serial_enabled: AtomicBool,
    ble_enabled: AtomicBool,
    status: RwLock<ManagerStatus>,
    diagnostics: BoundedQueue<(EventSource, DiagnosticRecord)>,
}

/// Supervises every instrument fleet.
pub struct DeviceManager {
    shared: Arc<Shared>,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl DeviceManager {
    /// Start managing the instruments attached to this machine.
    ///
    /// BLE is skipped with a warning when no adapter is available.
    pub async fn start(config: Config, uploader: Arc<dyn Uploader>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let span = info_span!("device_manager");
        let cap = config.manager.max_records_per_device;

        let serial = SerialFleetManager::new(
            Arc::new(SystemSerial),
            config.serial.clone(),
            cap,
            events.clone(),
            info_span!(parent: &span, "serial_fleet"),
        );
        let ble = match BleFleetManager::with_system_scanner(
            config.ble.clone(),
            cap,
            events.clone(),
            info_span!(parent: &span, "ble_fleet"),
        )
        .await
        {
            Ok(ble) => Some(ble),
            Err(e) => {
                warn!(parent: &span, "BLE unavailable, managing serial devices only: {}", e);
                None
            }
        };

        Self::spawn(config, Some(serial), ble, uploader, events, span)
    }

    /// Start supervising the given fleet managers.
    ///
    /// `events` must be the channel the fleet managers publish on.
    pub fn spawn(
        config: Config,
        serial: Option<SerialFleetManager>,
        ble: Option<BleFleetManager>,
        uploader: Arc<dyn Uploader>,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Self {
        let shared = Arc::new(Shared {
            serial_enabled: AtomicBool::new(config.serial.enabled),
            ble_enabled: AtomicBool::new(config.ble.enabled),
            status: RwLock::new(ManagerStatus::default()),
            diagnostics: BoundedQueue::new(config.ble.diagnostic_queue_capacity),
        });
        let cancel = CancellationToken::new();
        let stop_timeout = config.serial.shutdown_timeout()
            + config.ble.shutdown_timeout()
            + config.manager.upload_interval();

        let supervisor = Supervisor {
            pending: FleetAggregate::new(config.manager.max_records_per_device),
            config: config.manager,
            serial,
            ble,
            serial_active: false,
            ble_active: false,
            uploader,
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run().instrument(span));

        Self {
            shared,
            events,
            cancel,
            task: Mutex::new(Some(task)),
            stop_timeout,
        }
    }

    /// Subscribe to device events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Enable or disable serial instruments; takes effect on the next tick.
    pub fn set_serial_enabled(&self, enabled: bool) {
        self.shared.serial_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Enable or disable BLE instruments; takes effect on the next tick.
    pub fn set_ble_enabled(&self, enabled: bool) {
        self.shared.ble_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ManagerStatus {
        self.shared.status.read().clone()
    }

    /// Take the rejected payloads collected from every device.
    pub fn drain_diagnostics(&self) -> Vec<(EventSource, DiagnosticRecord)> {
        self.shared.diagnostics.drain_all()
    }

    /// Whether the supervisor task is still running.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop both fleets, try a last upload and wait for the supervisor.
    ///
    /// Returns `false` when the supervisor had to be aborted. Safe to call
    /// more than once.
    pub async fn stop(&self) -> bool {
        self.cancel.cancel();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return true;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Device manager task failed: {}", e);
                true
            }
            Err(_) => {
                error!(
                    "Device manager did not stop within {:?}, aborting",
                    self.stop_timeout
                );
                task.abort();
                false
            }
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    config: ManagerConfig,
    serial: Option<SerialFleetManager>,
    ble: Option<BleFleetManager>,
    serial_active: bool,
    ble_active: bool,
    pending: FleetAggregate,
    uploader: Arc<dyn Uploader>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        info!("Device manager started");
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_upload = Instant::now() + self.config.upload_interval();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.tick_fleets().await;
            if Instant::now() >= next_upload {
                self.upload().await;
                next_upload = Instant::now() + self.config.upload_interval();
            }
            self.publish_status(next_upload);
        }

        info!("Device manager stopping");
        if let Some(serial) = &mut self.serial {
            serial.shutdown().await;
        }
        if let Some(ble) = &mut self.ble {
            ble.shutdown().await;
        }
        self.serial_active = false;
        self.ble_active = false;
        self.collect();
        self.upload().await;
        self.publish_status(Instant::now());
        info!("Device manager stopped");
    }

    async fn tick_fleets(&mut self) {
        let serial_wanted = self.shared.serial_enabled.load(Ordering::SeqCst);
        if let Some(serial) = &mut self.serial {
            if serial_wanted {
                if !self.serial_active {
                    info!("Managing serial devices");
                }
                serial.tick().await;
                self.serial_active = true;
            } else if self.serial_active {
                info!("Serial devices disabled, closing sessions");
                serial.shutdown().await;
                self.serial_active = false;
            }
        }

        let ble_wanted = self.shared.ble_enabled.load(Ordering::SeqCst);
        if let Some(ble) = &mut self.ble {
            if ble_wanted {
                if !self.ble_active {
                    info!("Managing BLE devices");
                }
                ble.tick().await;
                self.ble_active = true;
            } else if self.ble_active {
                info!("BLE devices disabled, closing connections");
                ble.shutdown().await;
                self.ble_active = false;
            }
        }

        self.collect();
    }

    /// Move fleet data into the pending aggregate and diagnostics into the
    /// shared queue.
    fn collect(&mut self) {
        if let Some(serial) = &mut self.serial {
            let evicted = self.pending.merge(serial.take_data());
            if evicted > 0 {
                debug!("Pending data full, evicted {} serial records", evicted);
            }
            for (port, record) in serial.take_diagnostics() {
                self.shared
                    .diagnostics
                    .push((EventSource::SerialPort(port), record));
            }
        }
        if let Some(ble) = &mut self.ble {
            let evicted = self.pending.merge(ble.take_data());
            if evicted > 0 {
                debug!("Pending data full, evicted {} BLE records", evicted);
            }
            for (serial_number, record) in ble.take_diagnostics() {
                self.shared
                    .diagnostics
                    .push((EventSource::Ble(serial_number), record));
            }
        }
    }

    async fn upload(&mut self) {
        let batches = self.pending.take_batches();
        if batches.is_empty() {
            return;
        }

        let records: usize = batches.iter().map(|b| b.records.len()).sum();
        let limit = self.config.upload_interval();
        let accepted = tokio::time::timeout(limit, self.uploader.upload(batches.clone()))
            .await
            .unwrap_or(false);

        if accepted {
            debug!("Uploaded {} records from {} devices", records, batches.len());
        } else {
            warn!("Upload of {} records rejected, keeping them for the next try", records);
            let evicted = self.pending.restore(batches);
            if evicted > 0 {
                warn!("Dropped {} old records that no longer fit", evicted);
            }
        }
    }

    fn publish_status(&self, next_upload: Instant) {
        let status = ManagerStatus {
            serial_enabled: self.serial_active,
            ble_enabled: self.ble_active,
            serial_devices: self
                .serial
                .as_ref()
                .map(|s| s.connected_devices())
                .unwrap_or_default(),
            ble_devices: self
                .ble
                .as_ref()
                .map(|b| b.connected_devices())
                .unwrap_or_default(),
            seconds_until_upload: next_upload
                .saturating_duration_since(Instant::now())
                .as_secs(),
            pending_records: self.pending.len(),
        };
        *self.shared.status.write() = status;
    }
}
