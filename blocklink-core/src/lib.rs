//! Blocklink Core Library
//!
//! Shared types, events, and configuration for the blocklink
//! hardware-connectivity layer. This crate is used by both the hardware
//! transport and the session components.

pub mod config;
pub mod encoding;
pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types
pub use config::{default_config_path, default_user_data_dir, LinkConfig};
pub use encoding::PayloadEncoding;
pub use error::*;
pub use events::SessionEvent;
pub use types::*;
