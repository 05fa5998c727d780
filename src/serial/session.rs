//! One serial instrument session.
//!
//! A session owns one port for its whole life and runs on a blocking
//! thread. It reads the identity once, starts the telemetry stream, then
//! loops over three duties: serving queued commands, the periodic serial
//! number health check, and reading lines. All writes happen on the session
//! thread, so command/response exchanges never interleave.
//!
//! The session ends as [`ConnectionState::Disconnected`] when the link fails
//! or the identity changes, and as [`ConnectionState::Closed`] when stopped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use super::port::{SerialBackend, SerialLink};
use crate::config::SerialConfig;
use crate::data::{
    ConnectionState, DecodeReject, DeviceEvent, DeviceFamily, DeviceIdentity, DiagnosticRecord,
    EventSource, MeasurementRecord, Transport,
};
use crate::error::{Error, Result};
use crate::protocol::commands::{self, Request};
use crate::protocol::serial_line::{clean_line, split_columns};
use crate::protocol::{DeviceDriver, DriverRegistry, LineDecode, LineDecoder};
use crate::queue::BoundedQueue;
use crate::utils::MonotonicClock;

/// Reads per secure serial number check.
const SECURE_READS: usize = 3;

/// How a session ended.
#[derive(Debug)]
pub enum SessionExit {
    /// Stopped on request.
    Stopped,
    /// The link failed or the identity changed; the port may be retried.
    Disconnected(Error),
}

/// State shared between a session thread and its handle.
#[derive(Debug)]
struct SessionShared {
    state: RwLock<ConnectionState>,
    identity: RwLock<Option<DeviceIdentity>>,
    measurements: BoundedQueue<MeasurementRecord>,
    diagnostics: BoundedQueue<DiagnosticRecord>,
}

struct CommandRequest {
    request: Request,
    reply: oneshot::Sender<Result<Vec<String>>>,
}

/// Handle to a running serial session.
pub struct SessionHandle {
    port: String,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    commands: mpsc::Sender<CommandRequest>,
    command_timeout: Duration,
    task: Option<JoinHandle<SessionExit>>,
}

impl SessionHandle {
    /// Open `port` and run a session for it on a blocking thread.
    pub fn spawn(
        port: &str,
        family: DeviceFamily,
        backend: Arc<dyn SerialBackend>,
        config: SerialConfig,
        registry: &DriverRegistry,
        events: broadcast::Sender<DeviceEvent>,
        span: Span,
    ) -> Result<Self> {
        let driver = registry
            .get(family)
            .ok_or_else(|| Error::Internal(format!("no driver registered for {}", family)))?;

        let shared = Arc::new(SessionShared {
            state: RwLock::new(ConnectionState::Disconnected),
            identity: RwLock::new(None),
            measurements: BoundedQueue::new(config.measurement_queue_capacity),
            diagnostics: BoundedQueue::new(config.diagnostic_queue_capacity),
        });
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let command_timeout = (config.response_timeout() + config.read_timeout())
            * (config.request_retries.max(1) * 2);

        let session = SerialDeviceSession {
            port: port.to_string(),
            family,
            driver,
            config,
            shared: shared.clone(),
            cancel: cancel.clone(),
            commands: commands_rx,
            events,
            decoder: None,
            identity: None,
            clock: MonotonicClock::new(),
        };

        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            session.run(backend)
        });

        Ok(Self {
            port: port.to_string(),
            shared,
            cancel,
            commands: commands_tx,
            command_timeout,
            task: Some(task),
        })
    }

    /// Port this session owns.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Confirmed identity, once read.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        *self.shared.identity.read()
    }

    /// Whether the session thread has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Take every queued measurement.
    pub fn drain_measurements(&self) -> Vec<MeasurementRecord> {
        self.shared.measurements.drain_all()
    }

    /// Take every queued diagnostic record.
    pub fn drain_diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.shared.diagnostics.drain_all()
    }

    /// Measurements evicted from the queue so far.
    pub fn dropped_measurements(&self) -> u64 {
        self.shared.measurements.dropped()
    }

    /// Send a custom command and wait for a response of
    /// `response_columns` columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the session has ended and
    /// [`Error::NoResponse`] when every attempt went unanswered.
    pub async fn write_line(&self, command: &str, response_columns: usize) -> Result<Vec<String>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(CommandRequest {
                request: Request::new(command, response_columns),
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        crate::utils::time_boxed("write_line", self.command_timeout, async {
            response.await.map_err(|_| Error::ConnectionLost)?
        })
        .await
    }

    /// Ask the session to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session thread to exit.
    ///
    /// Returns `None` if it did not exit within `timeout`; the thread is then
    /// detached.
    pub async fn join(&mut self, timeout: Duration) -> Option<SessionExit> {
        let task = self.task.as_mut()?;
        let outcome = tokio::time::timeout(timeout, task).await;
        self.task = None;
        match outcome {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => Some(SessionExit::Disconnected(Error::Internal(format!(
                "session task failed: {}",
                e
            )))),
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("port", &self.port)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

/// The session itself; lives on the blocking thread.
struct SerialDeviceSession {
    port: String,
    family: DeviceFamily,
    driver: Arc<dyn DeviceDriver>,
    config: SerialConfig,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<CommandRequest>,
    events: broadcast::Sender<DeviceEvent>,
    decoder: Option<LineDecoder>,
    identity: Option<DeviceIdentity>,
    clock: MonotonicClock,
}

impl SerialDeviceSession {
    fn run(mut self, backend: Arc<dyn SerialBackend>) -> SessionExit {
        self.set_state(ConnectionState::Connecting);

        let mut link = match backend.open(&self.port, &self.config) {
            Ok(link) => link,
            Err(e) => return self.finish(None, Err(e)),
        };

        let result = self
            .bootstrap(link.as_mut())
            .and_then(|()| self.stream(link.as_mut()));
        self.finish(Some(link), result)
    }

    /// Read identity, select the schema and start the stream.
    fn bootstrap(&mut self, link: &mut dyn SerialLink) -> Result<()> {
        for command in self.driver.verbose_off() {
            link.write_command(&command)?;
        }
        std::thread::sleep(Duration::from_millis(10));
        link.clear_input()?;

        let serial_number = self.secure_serial_number(link)?;
        let firmware_version = self.firmware_version(link)?;

        let identity = DeviceIdentity {
            serial_number,
            firmware_version,
            device_family: self.family,
            transport: Transport::Serial,
        };

        let selection = self.driver.select_schema(firmware_version);
        if selection.fallback {
            warn!(
                "{} firmware {} has no dedicated output layout, falling back to {}; please update the firmware",
                identity.device_family, firmware_version, selection.schema.name
            );
        }
        self.decoder = Some(LineDecoder::new(
            selection.schema,
            self.driver.tracks_catalyst(),
        ));

        self.identity = Some(identity);
        *self.shared.identity.write() = Some(identity);
        info!("Connected to {} on {}", identity, self.port);
        self.emit(DeviceEvent::IdentityConfirmed {
            source: self.source(),
            identity,
        });

        for command in self.driver.verbose_on() {
            link.write_command(&command)?;
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Read loop until cancelled or failed.
    fn stream(&mut self, link: &mut dyn SerialLink) -> Result<()> {
        let interval = self.config.health_check_interval();
        let mut next_check = Instant::now() + interval;

        while !self.cancel.is_cancelled() {
            self.serve_commands(link)?;

            if Instant::now() >= next_check {
                self.health_check(link)?;
                next_check = Instant::now() + interval;
            }

            if let Some(raw) = link.read_line()? {
                if let Some(columns) = self.handle_line(&raw) {
                    self.push_diagnostic(
                        raw,
                        DecodeReject::Unsolicited {
                            columns: columns.len(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Release the link and record the final state.
    fn finish(&mut self, link: Option<Box<dyn SerialLink>>, result: Result<()>) -> SessionExit {
        let stopped = self.cancel.is_cancelled();

        if let Some(mut link) = link {
            if stopped && result.is_ok() {
                self.set_state(ConnectionState::Draining);
                for command in self.driver.verbose_off() {
                    if let Err(e) = link.write_command(&command) {
                        debug!("Could not stop telemetry on {}: {}", self.port, e);
                    }
                }
                if self.config.power_off_on_shutdown {
                    if let Err(e) = link.write_command(commands::POWER_OFF) {
                        debug!("Could not power off {}: {}", self.port, e);
                    }
                }
            }
            drop(link);
        }

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Closed);
                info!("Session on {} closed", self.port);
                SessionExit::Stopped
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Session on {} disconnected: {}", self.port, e);
                } else {
                    error!("Session on {} failed: {}", self.port, e);
                }
                self.set_state(if stopped {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Disconnected
                });
                if stopped {
                    SessionExit::Stopped
                } else {
                    SessionExit::Disconnected(e)
                }
            }
        }
    }

    fn serve_commands(&mut self, link: &mut dyn SerialLink) -> Result<()> {
        while let Ok(CommandRequest { request, reply }) = self.commands.try_recv() {
            match self.request(link, &request) {
                Ok(columns) => {
                    let _ = reply.send(Ok(columns));
                }
                Err(e) if is_link_failure(&e) => {
                    let _ = reply.send(Err(Error::ConnectionLost));
                    return Err(e);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Ok(())
    }

    fn health_check(&mut self, link: &mut dyn SerialLink) -> Result<()> {
        let actual = self.secure_serial_number(link)?;
        match self.identity {
            Some(identity) if identity.serial_number != actual => Err(Error::IdentityMismatch {
                expected: identity.serial_number,
                actual,
            }),
            _ => {
                debug!("Health check passed on {}", self.port);
                Ok(())
            }
        }
    }

    /// Three reads of `N?` that must agree.
    fn secure_serial_number(&mut self, link: &mut dyn SerialLink) -> Result<u32> {
        let mut reads = Vec::with_capacity(SECURE_READS);
        for _ in 0..SECURE_READS {
            reads.push(self.serial_number(link)?);
        }
        if reads.windows(2).all(|w| w[0] == w[1]) {
            Ok(reads[0])
        } else {
            Err(Error::InconsistentSerialNumber { reads })
        }
    }

    fn serial_number(&mut self, link: &mut dyn SerialLink) -> Result<u32> {
        self.with_retries(link, |session, link| {
            let columns = session.exchange(link, &Request::serial_number())?;
            parse_single(&columns, "serial number")
        })
    }

    fn firmware_version(&mut self, link: &mut dyn SerialLink) -> Result<u16> {
        let result = self.with_retries(link, |session, link| {
            let columns = session.exchange(link, &Request::firmware_version())?;
            parse_single::<u16>(&columns, "firmware version")
        });
        match result {
            Ok(version) => Ok(version),
            Err(e) if is_link_failure(&e) => Err(e),
            Err(e) => {
                warn!("Could not read firmware version on {}: {}", self.port, e);
                Ok(0)
            }
        }
    }

    fn request(&mut self, link: &mut dyn SerialLink, request: &Request) -> Result<Vec<String>> {
        self.with_retries(link, |session, link| session.exchange(link, request))
    }

    /// Run `op` up to the configured number of attempts.
    ///
    /// Link failures end the attempts immediately.
    fn with_retries<T>(
        &mut self,
        link: &mut dyn SerialLink,
        mut op: impl FnMut(&mut Self, &mut dyn SerialLink) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.config.request_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match op(self, &mut *link) {
                Ok(value) => return Ok(value),
                Err(e) if is_link_failure(&e) => return Err(e),
                Err(e) => {
                    debug!("Attempt {}/{} on {} failed: {}", attempt, attempts, self.port, e);
                    last_error = Some(e);
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        Err(last_error.unwrap_or_else(|| Error::timeout("serial request")))
    }

    /// Write one command and wait for a line of the expected width.
    ///
    /// Telemetry lines received meanwhile are processed as usual.
    fn exchange(&mut self, link: &mut dyn SerialLink, request: &Request) -> Result<Vec<String>> {
        link.write_command(&request.command)?;
        let deadline = Instant::now() + self.config.response_timeout();

        while Instant::now() < deadline {
            let Some(raw) = link.read_line()? else {
                continue;
            };
            if let Some(columns) = self.handle_line(&raw) {
                if columns.len() == request.response_columns {
                    return Ok(columns);
                }
                self.push_diagnostic(
                    raw,
                    DecodeReject::Unsolicited {
                        columns: columns.len(),
                    },
                );
            }
        }

        Err(Error::NoResponse {
            command: request.command.clone(),
        })
    }

    /// Decode one line; returns its columns if it is not telemetry.
    fn handle_line(&mut self, raw: &[u8]) -> Option<Vec<String>> {
        let timestamp = self.clock.now();

        let Some(decoder) = self.decoder.as_mut() else {
            // No schema yet: everything is a response.
            return match clean_line(raw) {
                Ok(line) => Some(split_columns(&line).iter().map(|c| c.to_string()).collect()),
                Err(DecodeReject::Empty) => None,
                Err(reject) => {
                    self.push_diagnostic(raw.to_vec(), reject);
                    None
                }
            };
        };

        let decoded = decoder.decode(raw, timestamp);
        if let (Some(state), Some(identity)) = (decoded.catalyst_changed, self.identity) {
            info!("Catalyst of {} is now {}", identity, state);
            self.emit(DeviceEvent::CatalystChanged {
                serial_number: identity.serial_number,
                state,
            });
        }

        match decoded.outcome {
            LineDecode::Measurement(record) => {
                if self.shared.measurements.push(record).is_some() {
                    debug!("Measurement queue of {} full, dropped oldest", self.port);
                }
                None
            }
            LineDecode::Response { columns, .. } => Some(columns),
            LineDecode::Rejected(DecodeReject::Empty) => None,
            LineDecode::Rejected(reject) => {
                self.push_diagnostic(raw.to_vec(), reject);
                None
            }
        }
    }

    fn push_diagnostic(&mut self, raw: impl Into<bytes::Bytes>, reason: DecodeReject) {
        let record = DiagnosticRecord::new(self.clock.now(), raw, reason);
        debug!("Diagnostic on {}: {} ({:?})", self.port, record.reason, record.payload_lossy());
        self.shared.diagnostics.push(record);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), state);
        if previous != state {
            debug!("{}: {} -> {}", self.port, previous, state);
            self.emit(DeviceEvent::StateChanged {
                source: self.source(),
                state,
            });
        }
    }

    fn source(&self) -> EventSource {
        EventSource::SerialPort(self.port.clone())
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }
}

/// Whether the error means the port itself is gone.
fn is_link_failure(error: &Error) -> bool {
    matches!(error, Error::Io(_) | Error::Serial(_) | Error::ConnectionLost)
}

fn parse_single<T: std::str::FromStr>(columns: &[String], what: &str) -> Result<T> {
    columns
        .first()
        .and_then(|c| c.trim().parse().ok())
        .ok_or_else(|| Error::InvalidData {
            context: format!("{} response {:?}", what, columns),
        })
}
