//! BLE connection management.
//!
//! One [`BleDeviceConnection`] task serves one instrument. On every
//! wall-clock second it either flushes the record assembled from that
//! second's notifications, or, with no link, tries to connect and subscribe.
//! Stopping always unsubscribes and disconnects, whatever state the task
//! was in.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use super::characteristics::{GattClient, Notification, NotificationStream};
use super::uuids;
use crate::config::BleConfig;
use crate::data::{
    ConnectionState, ConnectionType, DeviceEvent, DeviceIdentity, DiagnosticRecord, EventSource,
    MeasurementRecord,
};
use crate::error::Result;
use crate::protocol::NotificationKind;
use crate::queue::BoundedQueue;
use crate::utils::{cancellable_sleep, time_boxed, unix_timestamp, until_next_second, MonotonicClock};

/// Fleet-wide queue of `(serial number, record)` pairs.
pub type ResultQueue = BoundedQueue<(u32, MeasurementRecord)>;

/// Fleet-wide queue of `(serial number, diagnostic)` pairs.
pub type DiagnosticQueue = BoundedQueue<(u32, DiagnosticRecord)>;

/// Handle to a running connection task.
pub struct ConnectionHandle {
    serial_number: u32,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Start a connection task for `serial_number`.
    pub fn spawn(
        serial_number: u32,
        client: Arc<dyn GattClient>,
        config: BleConfig,
        results: Arc<ResultQueue>,
        diagnostics: Arc<DiagnosticQueue>,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Self {
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let cancel = CancellationToken::new();

        let connection = BleDeviceConnection {
            serial_number,
            client,
            config,
            results,
            diagnostics,
            events,
            state: state.clone(),
            cancel: cancel.clone(),
            clock: MonotonicClock::new(),
            current: None,
            stream: None,
            linked: false,
        };
        let task = tokio::spawn(connection.run().instrument(span));

        Self {
            serial_number,
            state,
            cancel,
            task: Some(task),
        }
    }

    /// Serial number this connection serves.
    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the task to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to exit.
    ///
    /// Returns `false` if it did not exit within `timeout`; the task is then
    /// detached.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        let outcome = tokio::time::timeout(timeout, task).await;
        self.task = None;
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Connection task for #{} failed: {}", self.serial_number, e);
                true
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("serial_number", &self.serial_number)
            .field("state", &self.state())
            .finish()
    }
}

/// The connection task itself.
struct BleDeviceConnection {
    serial_number: u32,
    client: Arc<dyn GattClient>,
    config: BleConfig,
    results: Arc<ResultQueue>,
    diagnostics: Arc<DiagnosticQueue>,
    events: broadcast::Sender<DeviceEvent>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    clock: MonotonicClock,
    /// Record assembled from this second's notifications, stamped on the
    /// first one.
    current: Option<MeasurementRecord>,
    stream: Option<NotificationStream>,
    /// A connect was attempted and not yet undone.
    linked: bool,
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Notification> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl BleDeviceConnection {
    async fn run(mut self) {
        let cancel = self.cancel.clone();

        loop {
            let wait = until_next_second(Utc::now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                notification = next_notification(&mut self.stream) => match notification {
                    Some(n) => self.handle_notification(n),
                    None => self.link_lost().await,
                },
                _ = tokio::time::sleep(wait) => {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        outcome = self.on_tick() => outcome,
                    };
                    if let Err(e) = outcome {
                        let backoff = if e.is_transient() {
                            warn!("Connection to #{} failed: {}", self.serial_number, e);
                            self.config.transient_backoff()
                        } else {
                            error!("Connection to #{} failed: {}", self.serial_number, e);
                            self.config.error_backoff()
                        };
                        if !cancellable_sleep(&cancel, backoff).await {
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Draining);
        self.flush();
        self.cleanup().await;
        self.set_state(ConnectionState::Closed);
        debug!("Connection task for #{} ended", self.serial_number);
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.state().is_connected() {
            if self.client.is_connected().await {
                self.flush();
                return Ok(());
            }
            self.link_lost().await;
        }
        self.connect().await
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => {
                info!("Connected to #{}", self.serial_number);
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(DeviceEvent::IdentityConfirmed {
                    source: EventSource::Ble(self.serial_number),
                    identity: DeviceIdentity::ble(self.serial_number),
                });
                Ok(())
            }
            Err(e) => {
                self.cleanup().await;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        self.linked = true;
        time_boxed("connect", self.config.connect_timeout(), self.client.connect()).await?;
        time_boxed(
            "discover services",
            self.config.connect_timeout(),
            self.client.discover_services(),
        )
        .await?;

        let stream = time_boxed(
            "open notifications",
            self.config.notify_timeout(),
            self.client.notifications(),
        )
        .await?;
        self.stream = Some(stream);

        for kind in NotificationKind::ALL {
            time_boxed(
                &format!("subscribe {}", kind),
                self.config.notify_timeout(),
                self.client.subscribe(uuids::notification_uuid(kind)),
            )
            .await?;
        }
        Ok(())
    }

    /// Release the link: unsubscribe every characteristic, then disconnect.
    async fn cleanup(&mut self) {
        self.stream = None;
        if !self.linked {
            return;
        }
        self.linked = false;

        for kind in NotificationKind::ALL {
            if let Err(e) = time_boxed(
                &format!("unsubscribe {}", kind),
                self.config.notify_timeout(),
                self.client.unsubscribe(uuids::notification_uuid(kind)),
            )
            .await
            {
                debug!("Unsubscribing {} on #{} failed: {}", kind, self.serial_number, e);
            }
        }

        if let Err(e) = time_boxed(
            "disconnect",
            self.config.disconnect_timeout(),
            self.client.disconnect(),
        )
        .await
        {
            warn!("Disconnecting #{} failed: {}", self.serial_number, e);
        }
    }

    async fn link_lost(&mut self) {
        if !self.state().is_connected() {
            self.stream = None;
            return;
        }
        warn!("Lost connection to #{}", self.serial_number);
        self.flush();
        self.cleanup().await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_notification(&mut self, notification: Notification) {
        let Some(kind) = uuids::notification_kind(&notification.uuid) else {
            trace!("Ignoring notification from {}", notification.uuid);
            return;
        };

        let record = self
            .current
            .get_or_insert_with(|| {
                MeasurementRecord::new(unix_timestamp(), ConnectionType::BleConnected)
            });
        if let Err(reject) = kind.apply(&notification.value, record) {
            debug!("Rejected {} notification from #{}: {}", kind, self.serial_number, reject);
            let diagnostic = DiagnosticRecord::new(unix_timestamp(), notification.value, reject);
            self.diagnostics.push((self.serial_number, diagnostic));
        }
    }

    /// Push the record assembled so far.
    ///
    /// The record keeps the second its first notification arrived in.
    fn flush(&mut self) {
        let Some(mut record) = self.current.take() else {
            return;
        };
        if record.is_empty() {
            return;
        }
        record.unix_timestamp = self.clock.clamp(record.unix_timestamp);
        if self.results.push((self.serial_number, record)).is_some() {
            trace!("Result queue full, dropped oldest record");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!(
                "#{} connection state changed: {} -> {}",
                self.serial_number, old_state, new_state
            );
            let _ = self.events.send(DeviceEvent::StateChanged {
                source: EventSource::Ble(self.serial_number),
                state: new_state,
            });
        }
    }
}
