//! Serial fleet management.
//!
//! The [`SerialFleetManager`] polls for instrument ports, runs one
//! [`SessionHandle`] per port and drains their queues into a
//! [`FleetAggregate`]. It is driven by its owner through [`tick`]; it does
//! not spawn a loop of its own.
//!
//! [`tick`]: SerialFleetManager::tick

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use super::port::{PortInfo, SerialBackend};
use super::session::{SessionExit, SessionHandle};
use crate::config::SerialConfig;
use crate::data::{DeviceEvent, DeviceIdentity, DiagnosticRecord, FleetAggregate};
use crate::error::{Error, Result};
use crate::protocol::DriverRegistry;

/// Runs the sessions of every serial instrument.
pub struct SerialFleetManager {
    backend: Arc<dyn SerialBackend>,
    config: SerialConfig,
    registry: DriverRegistry,
    sessions: HashMap<String, SessionHandle>,
    aggregate: FleetAggregate,
    max_records_per_device: usize,
    events: broadcast::Sender<DeviceEvent>,
    last_scan: Option<Instant>,
    span: Span,
}

impl SerialFleetManager {
    /// Create a manager; nothing is opened until the first [`tick`](Self::tick).
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        config: SerialConfig,
        max_records_per_device: usize,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Self {
        let registry = DriverRegistry::new(config.verbose_frequency, config.p2pro_output);
        Self {
            backend,
            config,
            registry,
            sessions: HashMap::new(),
            aggregate: FleetAggregate::new(max_records_per_device),
            max_records_per_device,
            events,
            last_scan: None,
            span,
        }
    }

    /// Replace the driver registry.
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// One supervision step: reap ended sessions, look for new ports when
    /// due, and drain every session queue into the aggregate.
    pub async fn tick(&mut self) {
        self.reap_finished().await;

        let scan_due = self
            .last_scan
            .map_or(true, |t| t.elapsed() >= self.config.scan_interval());
        if scan_due {
            self.last_scan = Some(Instant::now());
            if let Err(e) = self.discover().await {
                warn!(parent: &self.span, "Serial port discovery failed: {}", e);
            }
        }

        self.drain();
    }

    async fn discover(&mut self) -> Result<()> {
        let backend = self.backend.clone();
        let ports = tokio::task::spawn_blocking(move || backend.list_ports())
            .await
            .map_err(|e| Error::Internal(format!("port listing task failed: {}", e)))??;

        let candidates: Vec<PortInfo> = ports
            .into_iter()
            .filter(|port| port.matches(&self.config))
            .filter(|port| !self.sessions.contains_key(&port.name))
            .collect();

        for port in candidates {
            let family = port.family();
            info!(parent: &self.span, "Found {} on {}", family, port.name);
            let span = info_span!(parent: &self.span, "serial_session", port = %port.name);
            match SessionHandle::spawn(
                &port.name,
                family,
                self.backend.clone(),
                self.config.clone(),
                &self.registry,
                self.events.clone(),
                span,
            ) {
                Ok(handle) => {
                    self.sessions.insert(port.name.clone(), handle);
                }
                Err(e) => error!(parent: &self.span, "Could not start session on {}: {}", port.name, e),
            }
        }
        Ok(())
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(port, _)| port.clone())
            .collect();

        for port in finished {
            let Some(mut session) = self.sessions.remove(&port) else {
                continue;
            };
            // Records queued before the session ended still count.
            Self::drain_session(&mut self.aggregate, &session, &self.span);
            match session.join(self.config.shutdown_timeout()).await {
                Some(SessionExit::Disconnected(e)) => {
                    debug!(parent: &self.span, "Session on {} ended: {}; will retry", port, e)
                }
                Some(SessionExit::Stopped) | None => {}
            }
        }
    }

    fn drain(&mut self) {
        for session in self.sessions.values() {
            Self::drain_session(&mut self.aggregate, session, &self.span);
        }
    }

    fn drain_session(aggregate: &mut FleetAggregate, session: &SessionHandle, span: &Span) {
        let Some(identity) = session.identity() else {
            return;
        };
        let records = session.drain_measurements();
        if records.is_empty() {
            return;
        }
        let evicted = aggregate.extend(identity.serial_number, identity.device_family, records);
        if evicted > 0 {
            debug!(parent: span, "Aggregate for {} full, evicted {} records", identity, evicted);
        }
    }

    /// Take every diagnostic record queued by the sessions, keyed by port.
    pub fn take_diagnostics(&mut self) -> Vec<(String, DiagnosticRecord)> {
        self.sessions
            .iter()
            .flat_map(|(port, session)| {
                session
                    .drain_diagnostics()
                    .into_iter()
                    .map(move |record| (port.clone(), record))
            })
            .collect()
    }

    /// Take the aggregate, leaving an empty one.
    pub fn take_data(&mut self) -> FleetAggregate {
        let empty = FleetAggregate::new(self.max_records_per_device);
        std::mem::replace(&mut self.aggregate, empty)
    }

    /// Identities of the connected instruments.
    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices: Vec<DeviceIdentity> = self
            .sessions
            .values()
            .filter(|s| s.state().is_connected())
            .filter_map(|s| s.identity())
            .collect();
        devices.sort_by_key(|d| d.serial_number);
        devices
    }

    /// Ports with a live session.
    pub fn active_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.sessions.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Session of a port, for custom commands.
    pub fn session(&self, port: &str) -> Option<&SessionHandle> {
        self.sessions.get(port)
    }

    /// Stop every session and wait for each within the shutdown timeout.
    ///
    /// Sessions that do not exit in time are detached. Safe to call more
    /// than once.
    pub async fn shutdown(&mut self) {
        for session in self.sessions.values() {
            session.stop();
        }

        let timeout = self.config.shutdown_timeout();
        let span = &self.span;
        for (port, mut session) in self.sessions.drain() {
            match session.join(timeout).await {
                Some(_) => {
                    Self::drain_session(&mut self.aggregate, &session, span);
                    debug!(parent: span, "Session on {} stopped", port);
                }
                None => error!(
                    parent: span,
                    "Session on {} did not stop within {:?}, detaching", port, timeout
                ),
            }
        }
    }
}
