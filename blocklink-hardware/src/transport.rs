//! Transport abstraction for serial hardware
//!
//! These traits are the seam between the session state machine and real
//! hardware. One implementation wraps `tokio-serial`; tests supply mocks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use blocklink_core::{ConnectionConfig, Result};

/// A serial device as seen by the OS enumerator, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Transport-assigned path (e.g. `/dev/ttyACM0`, `COM3`)
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// An exclusive handle on one open serial port.
///
/// The session owns at most one of these at a time; no other component may
/// read or write the port directly.
#[async_trait]
pub trait PortLink: Send {
    /// Path the port was opened on.
    fn path(&self) -> &str;

    /// Whether the port is still alive.
    ///
    /// Flips to `false` when the read side observes EOF or an I/O error,
    /// which is how a physically unplugged cable becomes visible on this
    /// transport.
    fn is_open(&self) -> bool;

    /// Write the full buffer.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Wait until all buffered outbound bytes are physically transmitted.
    async fn drain(&mut self) -> Result<()>;

    /// Close the port. Pending writes must be drained by the caller first.
    async fn close(&mut self) -> Result<()>;

    /// Take the incoming frame stream. Yields `None` once per handle; frames
    /// stop arriving when the port closes or the device disappears.
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>>;
}

/// Factory bundling enumeration and port opening.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Snapshot of currently attached serial devices.
    fn enumerate(&self) -> Result<Vec<PortCandidate>>;

    /// Open a port with the caller's connection parameters.
    async fn open(&self, path: &str, config: &ConnectionConfig) -> Result<Box<dyn PortLink>>;
}
