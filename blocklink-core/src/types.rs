//! Shared data model for peripherals, filters, and upload requests

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// A discovered serial device.
///
/// Created on each scan match and kept in the session's registry until the
/// next discovery request rebuilds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peripheral {
    /// Transport-assigned path, used as the opaque peripheral id
    pub id: String,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Friendly name resolved from the vendor/product table
    pub name: String,
}

/// Discovery filter over plug-and-play identifiers.
///
/// The wildcard `"*"` matches every enumerated device; any other entry must
/// match the device's `USB\VID_xxxx&PID_xxxx` key exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    pub pnpid: Vec<String>,
}

impl DiscoveryFilter {
    /// A filter matching every device.
    pub fn wildcard() -> Self {
        Self {
            pnpid: vec!["*".to_string()],
        }
    }

    /// An empty filter is not a valid discovery request.
    pub fn is_empty(&self) -> bool {
        self.pnpid.is_empty()
    }

    /// Whether a device's vendor/product key passes this filter.
    pub fn matches(&self, pnp_key: &str) -> bool {
        self.pnpid.iter().any(|f| f == "*" || f == pnp_key)
    }
}

/// Serial connection parameters, passed verbatim to the port-open primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

/// Board-family selector carried in upload requests.
///
/// The tag matches the wire value of `config.type` in the `upload` and
/// `uploadFirmware` methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BoardConfig {
    /// Compiled-language family: build with the CLI toolchain, then flash
    Arduino {
        /// Fully qualified board name for the build toolchain
        #[serde(default)]
        fqbn: Option<String>,
    },
    /// Interpreted-language family: probe firmware, write files, reflash on
    /// probe failure
    Microbit {},
}

impl BoardConfig {
    /// Board-family name used for per-board project directories.
    pub fn family(&self) -> &'static str {
        match self {
            BoardConfig::Arduino { .. } => "arduino",
            BoardConfig::Microbit {} => "microbit",
        }
    }
}

/// A decoded upload request: the user program plus its target board.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub board: BoardConfig,
    pub program: Vec<u8>,
}

impl UploadRequest {
    /// Program source as text.
    ///
    /// Upload payloads are produced by the block editor and are always valid
    /// UTF-8; anything else is rejected rather than lossily converted.
    pub fn program_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.program)
            .map_err(|e| LinkError::InvalidParams(format!("program is not UTF-8: {}", e)))
    }
}
