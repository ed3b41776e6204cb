//! Error types for the blocklink system

use thiserror::Error;

/// Core error type for blocklink operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// Discovery or connect attempted while a port is already open
    #[error("already connected to a peripheral")]
    AlreadyConnected,

    /// Discovery request carried no filter entries
    #[error("discovery request must include at least one filter")]
    InvalidFilter,

    /// Connect target is not in the current peripheral registry
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// OS-level port open failure
    #[error("failed to open port {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// Operation requires an open port
    #[error("no peripheral connected")]
    NotConnected,

    /// A write landed while the session was tearing the port down
    #[error("session is closing, write rejected")]
    SessionClosing,

    /// OS-level write failure
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Serial port errors
    #[error("serial port error: {0}")]
    Serial(String),

    /// Build subprocess failed
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Flash or filesystem-put subprocess failed
    #[error("flash failed: {0}")]
    FlashFailed(String),

    /// Another upload pipeline is already running on this session
    #[error("an upload is already in progress")]
    UploadInProgress,

    /// External tool exceeded its bounded wait
    #[error("subprocess timed out: {0}")]
    SubprocessTimeout(String),

    /// RPC method is not part of the session surface
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// RPC params failed to deserialize or are semantically invalid
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Message payload could not be decoded with the requested encoding
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for blocklink operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::InvalidParams(err.to_string())
    }
}
