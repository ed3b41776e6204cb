//! Blocklink session layer
//!
//! The device session state machine (discovery, connect, health monitoring,
//! I/O relay, disconnect), the RPC method dispatch, and the per-board-family
//! upload orchestration pipelines. The duplex RPC transport itself is an
//! external collaborator: it feeds method calls into [`dispatch::dispatch`]
//! and forwards [`blocklink_core::SessionEvent`]s back to the caller.

pub mod dispatch;
pub mod poll;
pub mod runner;
pub mod session;
pub mod upload;

pub use dispatch::dispatch;
pub use session::{DeviceSession, SerialSession, SessionState};
