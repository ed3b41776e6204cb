//! Blocklink hardware layer
//!
//! Async serial transport seam: port enumeration, exclusive open-port
//! handles, and the USB vendor/product name table. The traits in
//! [`transport`] allow the session layer to be tested without hardware.

pub mod serial;
pub mod transport;
pub mod usb_ids;

pub use serial::SerialTransport;
pub use transport::{PortCandidate, PortLink, Transport};
