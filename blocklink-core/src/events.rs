//! Push events raised by a session toward the connected caller
//!
//! Each variant maps onto one "remote request" of the duplex RPC transport;
//! the tag is the wire method name and the fields are its params.

use serde::{Deserialize, Serialize};

/// Session push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A device passed the discovery filter for the first time this scan
    #[serde(rename_all = "camelCase")]
    DidDiscoverPeripheral { peripheral_id: String, name: String },

    /// An incoming data frame, forwarded only while read is enabled
    OnMessage { encoding: String, message: String },

    /// The device's physical presence became unverifiable
    PeripheralUnplug {},

    /// One line of streamed toolchain output
    UploadStdout { message: String },

    /// The upload pipeline completed
    UploadSuccess {},

    /// The upload pipeline failed; carries diagnostic text
    UploadError { message: String },
}

impl SessionEvent {
    /// Wire method name for this event.
    pub fn method(&self) -> &'static str {
        match self {
            SessionEvent::DidDiscoverPeripheral { .. } => "didDiscoverPeripheral",
            SessionEvent::OnMessage { .. } => "onMessage",
            SessionEvent::PeripheralUnplug {} => "peripheralUnplug",
            SessionEvent::UploadStdout { .. } => "uploadStdout",
            SessionEvent::UploadSuccess {} => "uploadSuccess",
            SessionEvent::UploadError { .. } => "uploadError",
        }
    }
}
