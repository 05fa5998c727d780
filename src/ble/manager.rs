//! BLE fleet management.
//!
//! The [`BleFleetManager`] owns the scanner and one connection task per
//! connectable instrument. Each [`tick`](BleFleetManager::tick) turns the
//! queued scan results into connections and advertisement records, and
//! drains the connection results into a [`FleetAggregate`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use super::connection::{ConnectionHandle, DiagnosticQueue, ResultQueue};
use super::scanner::{BleScanner, ScanControl, ScanResult};
use crate::config::BleConfig;
use crate::data::{DeviceEvent, DeviceFamily, DeviceIdentity, DiagnosticRecord, FleetAggregate};
use crate::error::Result;
use crate::queue::BoundedQueue;

/// Runs the scanner and the connections of every BLE instrument.
pub struct BleFleetManager {
    config: BleConfig,
    scanner: Option<Arc<dyn ScanControl>>,
    scan_queue: Arc<BoundedQueue<ScanResult>>,
    results: Arc<ResultQueue>,
    diagnostics: Arc<DiagnosticQueue>,
    connections: HashMap<u32, ConnectionHandle>,
    aggregate: FleetAggregate,
    max_records_per_device: usize,
    events: broadcast::Sender<DeviceEvent>,
    span: Span,
}

impl BleFleetManager {
    /// Create a manager fed by `scan_queue`.
    ///
    /// `scanner` is started on the first tick and stopped on shutdown; with
    /// `None`, scan results are expected to be pushed by someone else.
    pub fn new(
        config: BleConfig,
        scanner: Option<Arc<dyn ScanControl>>,
        scan_queue: Arc<BoundedQueue<ScanResult>>,
        max_records_per_device: usize,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Self {
        let results = Arc::new(ResultQueue::new(config.result_queue_capacity));
        let diagnostics = Arc::new(DiagnosticQueue::new(config.diagnostic_queue_capacity));
        Self {
            config,
            scanner,
            scan_queue,
            results,
            diagnostics,
            connections: HashMap::new(),
            aggregate: FleetAggregate::new(max_records_per_device),
            max_records_per_device,
            events,
            span,
        }
    }

    /// Create a manager scanning on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_system_scanner(
        config: BleConfig,
        max_records_per_device: usize,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Result<Self> {
        let scan_queue = Arc::new(BoundedQueue::new(config.scan_queue_capacity));
        let scanner_span = info_span!(parent: &span, "ble_scanner");
        let scanner = BleScanner::new(config.clone(), scan_queue.clone(), scanner_span).await?;
        Ok(Self::new(
            config,
            Some(Arc::new(scanner)),
            scan_queue,
            max_records_per_device,
            events,
            span,
        ))
    }

    /// One supervision step.
    pub async fn tick(&mut self) {
        if let Some(scanner) = &self.scanner {
            if !scanner.is_scanning() {
                if let Err(e) = scanner.start().await {
                    warn!(parent: &self.span, "Could not start BLE scan: {}", e);
                }
            }
        }

        self.reap_finished();
        for result in self.scan_queue.drain_all() {
            self.handle_scan_result(result);
        }
        self.drain_results();
    }

    fn handle_scan_result(&mut self, result: ScanResult) {
        let serial_number = result.serial_number();

        if result.connectable && !self.connections.contains_key(&serial_number) {
            info!(parent: &self.span, "Found {} #{}, connecting", result.name, serial_number);
            let span = info_span!(parent: &self.span, "ble_connection", serial = serial_number);
            let handle = ConnectionHandle::spawn(
                serial_number,
                result.client.clone(),
                self.config.clone(),
                self.results.clone(),
                self.diagnostics.clone(),
                self.events.clone(),
                span,
            );
            self.connections.insert(serial_number, handle);
        }

        let linked = self
            .connections
            .get(&serial_number)
            .map_or(false, |c| c.state().is_connected());
        if !linked {
            let record = result.frame.to_record(result.unix_timestamp);
            self.aggregate.insert(serial_number, DeviceFamily::P2, record);
        }
    }

    fn reap_finished(&mut self) {
        let span = &self.span;
        self.connections.retain(|serial, connection| {
            if connection.is_finished() {
                warn!(parent: span, "Connection task for #{} exited", serial);
                false
            } else {
                true
            }
        });
    }

    fn drain_results(&mut self) {
        for (serial_number, record) in self.results.drain_all() {
            self.aggregate.insert(serial_number, DeviceFamily::P2, record);
        }
    }

    /// Take every queued diagnostic record, keyed by serial number.
    pub fn take_diagnostics(&mut self) -> Vec<(u32, DiagnosticRecord)> {
        self.diagnostics.drain_all()
    }

    /// Take the aggregate, leaving an empty one.
    pub fn take_data(&mut self) -> FleetAggregate {
        let empty = FleetAggregate::new(self.max_records_per_device);
        std::mem::replace(&mut self.aggregate, empty)
    }

    /// Identities of the instruments with a live GATT link.
    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices: Vec<DeviceIdentity> = self
            .connections
            .values()
            .filter(|c| c.state().is_connected())
            .map(|c| DeviceIdentity::ble(c.serial_number()))
            .collect();
        devices.sort_by_key(|d| d.serial_number);
        devices
    }

    /// Serial numbers with a connection task.
    pub fn connection_serials(&self) -> Vec<u32> {
        let mut serials: Vec<u32> = self.connections.keys().copied().collect();
        serials.sort_unstable();
        serials
    }

    /// Stop every connection, then the scanner.
    ///
    /// Connections that do not stop within the shutdown timeout are
    /// detached. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        for connection in self.connections.values() {
            connection.stop();
        }

        let timeout = self.config.shutdown_timeout();
        let span = &self.span;
        for (serial, mut connection) in self.connections.drain() {
            if connection.join(timeout).await {
                debug!(parent: span, "Connection to #{} stopped", serial);
            } else {
                error!(
                    parent: span,
                    "Connection to #{} did not stop within {:?}, detaching", serial, timeout
                );
            }
        }
        self.drain_results();

        if let Some(scanner) = &self.scanner {
            if let Err(e) = scanner.stop().await {
                error!(parent: &self.span, "Could not stop BLE scan: {}", e);
            }
        }
    }
}
