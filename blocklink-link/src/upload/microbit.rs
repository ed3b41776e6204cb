//! Probe-then-write pipeline with firmware-reflash fallback
//!
//! Interpreted-language boards carry a filesystem reachable through the
//! device's raw REPL. The pipeline stages files, probes firmware health with
//! a lightweight filesystem list, reflashes the baseline firmware when the
//! REPL is unreachable, writes each staged file, then reconnects and sends
//! the wake-up control byte.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use blocklink_core::{LinkConfig, LinkError, Result, UploadRequest};

use crate::runner::{run_streamed, LogSink};
use crate::session::SessionCore;

use super::{PipelineError, PipelineResult};

/// The exact text the filesystem tool prints when the device cannot enter
/// its raw REPL. Fragile by nature: tied to the tool's wording.
const REPL_FAILURE_MARKER: &str = "Could not enter raw REPL.";

/// Board-specific wake-up handshake sent after the post-flash reconnect.
const WAKE_BYTE: [u8; 1] = [0x04];

/// Firmware health as reported by the filesystem-list probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The device entered its raw REPL; firmware is usable
    Healthy,
    /// The REPL is unreachable; firmware is broken or absent
    ReplUnreachable,
}

/// Paths and parameters for one probe-then-write run.
pub struct MicrobitTool {
    python: PathBuf,
    uflash_script: PathBuf,
    ufs_script: PathBuf,
    project_dir: PathBuf,
    extension_dir: PathBuf,
    timeout: Duration,
}

impl MicrobitTool {
    pub fn new(config: &LinkConfig) -> Self {
        let python_dir = config.tools_dir.join("Python");
        Self {
            python: python_dir.join("python"),
            uflash_script: python_dir.join("Scripts").join("uflash-script.py"),
            ufs_script: python_dir.join("Scripts").join("ufs-script.py"),
            project_dir: config.project_dir("microbit"),
            extension_dir: config.extension_library_dir("Microbit"),
            timeout: config.subprocess_timeout(),
        }
    }

    /// Stage the files to write: the user program at a fixed
    /// project-relative path, plus every extension-library file if that
    /// directory exists.
    pub fn stage(&self, code: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.project_dir)?;
        let code_file = self.project_dir.join("main.py");
        debug!("Staging program at {}", code_file.display());
        std::fs::write(&code_file, code)?;

        let mut files = vec![code_file];
        if self.extension_dir.exists() {
            let mut extras: Vec<PathBuf> = std::fs::read_dir(&self.extension_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .collect();
            // Deterministic write order
            extras.sort();
            files.extend(extras);
        }
        Ok(files)
    }

    /// Probe firmware health with a filesystem list.
    ///
    /// Only the REPL-failure marker in the output matters; the exit status
    /// of the list itself is ignored.
    pub async fn probe_repl(&self) -> Result<ProbeOutcome> {
        let script = self.ufs_script.to_string_lossy().into_owned();
        let result =
            run_streamed(&self.python, &[&script, "ls"], &LogSink::null(), self.timeout).await?;

        if result.stdout.contains(REPL_FAILURE_MARKER) {
            info!("Device could not enter raw REPL, firmware reflash needed");
            Ok(ProbeOutcome::ReplUnreachable)
        } else {
            Ok(ProbeOutcome::Healthy)
        }
    }

    /// Reflash the baseline firmware. Slow (tens of seconds); all tool
    /// output is streamed to the caller throughout.
    pub async fn reflash(&self, sink: &LogSink) -> Result<()> {
        sink.log("Start flash standard firmware...");
        sink.log("This step will take tens of seconds, please wait");

        let script = self.uflash_script.to_string_lossy().into_owned();
        let result = run_streamed(&self.python, &[&script], sink, self.timeout).await?;
        if !result.success() {
            return Err(LinkError::FlashFailed("uflash failed to flash".to_string()));
        }
        sink.log("Flash Success.");
        Ok(())
    }

    /// Write one staged file to the device filesystem.
    ///
    /// Any output line during a put is a failure signal, even with a clean
    /// exit; a nonzero or indeterminate exit is fatal as well.
    pub async fn put(&self, file: &Path, sink: &LogSink) -> Result<()> {
        let script = self.ufs_script.to_string_lossy().into_owned();
        let file_arg = file.to_string_lossy().into_owned();
        let result =
            run_streamed(&self.python, &[&script, "put", &file_arg], sink, self.timeout).await?;

        if !result.stdout.trim().is_empty() {
            return Err(LinkError::FlashFailed(result.stdout.trim().to_string()));
        }
        match result.status {
            Some(0) => {
                sink.log(format!("{} write finish", file.display()));
                Ok(())
            }
            _ => Err(LinkError::FlashFailed("ufs failed to write".to_string())),
        }
    }
}

/// Program upload: stage, disconnect, probe (reflash on failure), put each
/// file, reconnect, wake the board.
pub(crate) async fn upload_program(
    core: &Arc<SessionCore>,
    request: &UploadRequest,
    sink: &LogSink,
) -> PipelineResult {
    let tool = MicrobitTool::new(&core.config);
    let code = request
        .program_text()
        .map_err(|e| PipelineError::Tool(e.to_string()))?;

    let files = tool.stage(code)?;

    // The filesystem tool needs the port free
    core.disconnect_internal().await?;

    if tool.probe_repl().await? == ProbeOutcome::ReplUnreachable {
        sink.log(REPL_FAILURE_MARKER);
        sink.log("Try to flash standard firmware to fix");
        tool.reflash(sink).await?;
    }

    sink.log("Writing files...");
    for file in &files {
        // A failed put leaves the device in an indeterminate state
        tool.put(file, sink)
            .await
            .map_err(|e| PipelineError::DeviceLost(e.to_string()))?;
    }

    core.reconnect_after_upload()
        .await
        .map_err(|_| PipelineError::ReconnectLost)?;

    // Board-specific handshake on the freshly reconnected port
    core.write_bytes(&WAKE_BYTE)
        .await
        .map_err(|e| PipelineError::Tool(e.to_string()))?;

    Ok(())
}
