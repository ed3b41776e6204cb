//! Upload orchestration
//!
//! Board-family pipelines share one shape: disconnect the current session,
//! perform the board-specific build/flash via subprocess invocations,
//! reconnect with the retained connection config, and report the outcome.
//! Each pipeline is a linear sequence of fallible steps; the first failure
//! short-circuits the rest and is reported as a single `uploadError`.

pub mod arduino;
pub mod microbit;

use std::sync::Arc;

use tracing::{info, warn};

use blocklink_core::{BoardConfig, LinkError, SessionEvent, UploadRequest};

use crate::session::{SessionCore, SessionState};

/// Pipeline failure, classified by how it is reported to the caller.
#[derive(Debug)]
pub(crate) enum PipelineError {
    /// Toolchain or staging failure: reported as `uploadError`
    Tool(String),
    /// Device left in an indeterminate state (a file-put failed):
    /// `uploadError` plus `peripheralUnplug`
    DeviceLost(String),
    /// Post-flash reconnect failed: the flash itself went through, but the
    /// board never re-enumerated. The reconnect already raised the unplug
    /// event; the pipeline still owes the caller a terminal `uploadError`.
    ReconnectLost,
}

impl From<LinkError> for PipelineError {
    fn from(err: LinkError) -> Self {
        PipelineError::Tool(err.to_string())
    }
}

pub(crate) type PipelineResult = std::result::Result<(), PipelineError>;

async fn report(core: &SessionCore, outcome: PipelineResult) {
    match outcome {
        Ok(()) => {
            info!("Upload finished");
            core.events.emit(SessionEvent::UploadSuccess {});
        }
        Err(PipelineError::Tool(message)) => {
            warn!("Upload failed: {}", message);
            core.events.emit(SessionEvent::UploadError { message });
        }
        Err(PipelineError::DeviceLost(message)) => {
            warn!("Upload failed with device in indeterminate state: {}", message);
            core.events.emit(SessionEvent::UploadError { message });
            core.events.emit(SessionEvent::PeripheralUnplug {});
        }
        Err(PipelineError::ReconnectLost) => {
            warn!("Device did not re-enumerate after flashing");
            core.events.emit(SessionEvent::UploadError {
                message: "device did not re-enumerate after flashing".to_string(),
            });
        }
    }
    core.settle_after_upload().await;
}

/// Run the program-upload pipeline for the request's board family.
pub(crate) async fn run_program(core: Arc<SessionCore>, request: UploadRequest) {
    core.set_state(SessionState::Uploading).await;
    let sink = core.log_sink();

    let outcome = match &request.board {
        BoardConfig::Arduino { fqbn } => {
            arduino::upload_program(&core, &request, fqbn.as_deref(), &sink).await
        }
        BoardConfig::Microbit {} => microbit::upload_program(&core, &request, &sink).await,
    };

    report(&core, outcome).await;
}

/// Run the firmware-reflash pipeline (build-then-flash family only).
pub(crate) async fn run_firmware(core: Arc<SessionCore>, fqbn: Option<&str>) {
    core.set_state(SessionState::Uploading).await;
    let sink = core.log_sink();
    let outcome = arduino::upload_firmware(&core, fqbn, &sink).await;
    report(&core, outcome).await;
}
