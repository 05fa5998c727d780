//! USB-serial transport.
//!
//! - [`port`]: port discovery and line-oriented I/O
//! - [`session`]: one worker per instrument port
//! - [`manager`]: discovery and supervision of all sessions

pub mod manager;
pub mod port;
pub mod session;

pub use manager::SerialFleetManager;
pub use port::{PortInfo, SerialBackend, SerialLink, SystemSerial};
pub use session::{SessionExit, SessionHandle};
