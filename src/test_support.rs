//! In-memory fakes for the serial and BLE seams, used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::ble::characteristics::{GattClient, Notification, NotificationStream};
use crate::ble::scanner::ScanControl;
use crate::config::SerialConfig;
use crate::error::{Error, Result};
use crate::serial::port::{PortInfo, SerialBackend, SerialLink};

const FAKE_READ_DELAY: Duration = Duration::from_millis(2);

/// Send log output of the running test to the test harness.
///
/// Filtered by `RUST_LOG`; safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct InstrumentState {
    serial_number: u32,
    serial_sequence: VecDeque<u32>,
    firmware_version: u16,
    telemetry: Option<String>,
    responses: HashMap<String, String>,
    written: Vec<String>,
    outgoing: VecDeque<Vec<u8>>,
    streaming: bool,
    unplugged: bool,
    stall: Option<Duration>,
}

/// A scripted serial instrument.
///
/// Answers `N?` and `f?`, streams a fixed telemetry line while verbose
/// output is on, and records every command written to it.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeInstrument {
    state: Arc<Mutex<InstrumentState>>,
}

impl FakeInstrument {
    pub(crate) fn new(serial_number: u32, firmware_version: u16) -> Self {
        let instrument = Self::default();
        {
            let mut state = instrument.state.lock();
            state.serial_number = serial_number;
            state.firmware_version = firmware_version;
        }
        instrument
    }

    /// Line printed once per read while streaming.
    pub(crate) fn with_telemetry(self, line: impl Into<String>) -> Self {
        self.state.lock().telemetry = Some(line.into());
        self
    }

    /// Answers to the next `N?` queries, before the fixed serial number.
    pub(crate) fn with_serial_sequence(self, sequence: Vec<u32>) -> Self {
        self.state.lock().serial_sequence = sequence.into();
        self
    }

    /// Answer for a custom command.
    pub(crate) fn with_response(self, command: &str, response: &str) -> Self {
        self.state
            .lock()
            .responses
            .insert(command.to_string(), response.to_string());
        self
    }

    pub(crate) fn set_serial_number(&self, serial_number: u32) {
        self.state.lock().serial_number = serial_number;
    }

    /// Make every further read and write fail.
    pub(crate) fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    /// Block the next read for `duration`, ignoring any stop request.
    pub(crate) fn stall_next_read(&self, duration: Duration) {
        self.state.lock().stall = Some(duration);
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    fn link(&self) -> FakeLink {
        FakeLink {
            instrument: self.clone(),
        }
    }
}

fn broken_pipe() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
}

struct FakeLink {
    instrument: FakeInstrument,
}

impl SerialLink for FakeLink {
    fn write_command(&mut self, command: &str) -> Result<()> {
        let mut state = self.instrument.state.lock();
        if state.unplugged {
            return Err(broken_pipe());
        }
        state.written.push(command.to_string());

        let reply = match command {
            "N?" => {
                let serial = state
                    .serial_sequence
                    .pop_front()
                    .unwrap_or(state.serial_number);
                Some(serial.to_string())
            }
            "f?" => Some(state.firmware_version.to_string()),
            "X0000!" => {
                state.streaming = false;
                None
            }
            c if c.starts_with('X') && c.ends_with('!') => {
                state.streaming = true;
                None
            }
            c => state.responses.get(c).cloned(),
        };
        if let Some(reply) = reply {
            state.outgoing.push_back(format!("{}\r\n", reply).into_bytes());
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let stall = self.instrument.state.lock().stall.take();
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }

        {
            let mut state = self.instrument.state.lock();
            if state.unplugged {
                return Err(broken_pipe());
            }
            if let Some(line) = state.outgoing.pop_front() {
                return Ok(Some(line));
            }
        }

        std::thread::sleep(FAKE_READ_DELAY);

        let state = self.instrument.state.lock();
        match (&state.telemetry, state.streaming) {
            (Some(line), true) => Ok(Some(format!("{}\r\n", line).into_bytes())),
            _ => Ok(None),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.instrument.state.lock().outgoing.clear();
        Ok(())
    }
}

/// Serial backend over a set of fake instruments.
#[derive(Debug, Default)]
pub(crate) struct FakeSerialBackend {
    ports: Mutex<Vec<(PortInfo, FakeInstrument)>>,
    opens: AtomicUsize,
}

impl FakeSerialBackend {
    pub(crate) fn with_port(name: &str, instrument: FakeInstrument) -> Self {
        let backend = Self::default();
        backend.add_port(name, "Partector2", instrument);
        backend
    }

    pub(crate) fn add_port(&self, name: &str, product: &str, instrument: FakeInstrument) {
        let info = PortInfo {
            name: name.to_string(),
            vid: Some(0x0483),
            pid: Some(0x5740),
            manufacturer: Some(if product.to_ascii_lowercase().contains("partector") {
                "naneos".to_string()
            } else {
                "FTDI".to_string()
            }),
            product: Some(product.to_string()),
        };
        self.ports.lock().push((info, instrument));
    }

    pub(crate) fn remove_port(&self, name: &str) {
        self.ports.lock().retain(|(info, instrument)| {
            if info.name == name {
                instrument.unplug();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SerialBackend for FakeSerialBackend {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.lock().iter().map(|(info, _)| info.clone()).collect())
    }

    fn open(&self, port: &str, _config: &SerialConfig) -> Result<Box<dyn SerialLink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let ports = self.ports.lock();
        let (_, instrument) = ports
            .iter()
            .find(|(info, _)| info.name == port)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: port.to_string(),
            })?;
        Ok(Box::new(instrument.link()))
    }
}

#[derive(Debug, Default)]
struct GattState {
    linked: bool,
    subscriptions: Vec<Uuid>,
    sender: Option<mpsc::UnboundedSender<Notification>>,
    failing_connects: usize,
    hanging_connect: bool,
    hanging_unsubscribe: bool,
    hanging_disconnect: bool,
    connect_attempts: usize,
    unsubscribe_attempts: usize,
    disconnects: usize,
}

/// A scripted GATT peripheral.
///
/// Notifications pushed with [`notify`](Self::notify) reach the stream
/// returned by the last `notifications()` call.
#[derive(Debug, Default)]
pub(crate) struct FakeGattClient {
    state: Mutex<GattState>,
}

impl FakeGattClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connects with "device not found".
    pub(crate) fn failing_connects(self, count: usize) -> Self {
        self.state.lock().failing_connects = count;
        self
    }

    /// Never complete a connect.
    pub(crate) fn hanging_connect(self) -> Self {
        self.state.lock().hanging_connect = true;
        self
    }

    /// Never complete an unsubscribe.
    pub(crate) fn hanging_unsubscribe(self) -> Self {
        self.state.lock().hanging_unsubscribe = true;
        self
    }

    /// Never complete a disconnect.
    pub(crate) fn hanging_disconnect(self) -> Self {
        self.state.lock().hanging_disconnect = true;
        self
    }

    pub(crate) fn notify(&self, uuid: Uuid, value: Vec<u8>) {
        if let Some(sender) = &self.state.lock().sender {
            let _ = sender.unbounded_send(Notification { uuid, value });
        }
    }

    /// Drop the link as if the device went out of range.
    pub(crate) fn drop_link(&self) {
        let mut state = self.state.lock();
        state.linked = false;
        state.sender = None;
    }

    pub(crate) fn subscriptions(&self) -> Vec<Uuid> {
        self.state.lock().subscriptions.clone()
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub(crate) fn unsubscribe_attempts(&self) -> usize {
        self.state.lock().unsubscribe_attempts
    }
}

#[async_trait]
impl GattClient for FakeGattClient {
    async fn connect(&self) -> Result<()> {
        let hanging = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(Error::DeviceNotFound {
                    identifier: "fake peripheral".to_string(),
                });
            }
            if !state.hanging_connect {
                state.linked = true;
            }
            state.hanging_connect
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().linked
    }

    async fn discover_services(&self) -> Result<()> {
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().sender = Some(sender);
        Ok(receiver.boxed())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        if !state.linked {
            return Err(Error::NotConnected);
        }
        state.subscriptions.push(uuid);
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let hanging = {
            let mut state = self.state.lock();
            state.unsubscribe_attempts += 1;
            if !state.hanging_unsubscribe {
                state.subscriptions.retain(|u| *u != uuid);
            }
            state.hanging_unsubscribe
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let hanging = {
            let mut state = self.state.lock();
            state.disconnects += 1;
            if !state.hanging_disconnect {
                state.linked = false;
                state.sender = None;
            }
            state.hanging_disconnect
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Scanner stand-in that only tracks start/stop calls.
#[derive(Debug, Default)]
pub(crate) struct FakeScanner {
    scanning: AtomicBool,
    stops: AtomicUsize,
}

impl FakeScanner {
    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanControl for FakeScanner {
    async fn start(&self) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}
