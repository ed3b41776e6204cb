//! Build-then-flash pipeline for compiled-language boards
//!
//! Compiles the staged sketch with the bundled CLI toolchain, then flashes
//! the build output over the session's port: build → disconnect → flash →
//! reconnect. The build runs while still connected; only the flash needs the
//! port free.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use blocklink_core::{LinkConfig, LinkError, Result, UploadRequest};

use crate::runner::{run_streamed, LogSink};
use crate::session::SessionCore;

use super::{PipelineError, PipelineResult};

const DEFAULT_FQBN: &str = "arduino:avr:uno";

/// Paths and parameters for one build-then-flash run.
pub struct ArduinoTool {
    cli: PathBuf,
    project_dir: PathBuf,
    build_dir: PathBuf,
    firmware_dir: PathBuf,
    fqbn: String,
    timeout: Duration,
}

impl ArduinoTool {
    pub fn new(config: &LinkConfig, fqbn: Option<&str>) -> Self {
        let project_dir = config.project_dir("arduino");
        Self {
            cli: config.tools_dir.join("arduino-cli"),
            build_dir: project_dir.join("build"),
            project_dir,
            firmware_dir: config.tools_dir.join("firmware").join("arduino"),
            fqbn: fqbn.unwrap_or(DEFAULT_FQBN).to_string(),
            timeout: config.subprocess_timeout(),
        }
    }

    /// Write the sketch into the project directory.
    pub fn stage(&self, code: &str) -> Result<()> {
        std::fs::create_dir_all(&self.project_dir)?;
        let sketch = self.project_dir.join("project.ino");
        debug!("Staging sketch at {}", sketch.display());
        std::fs::write(sketch, code)?;
        Ok(())
    }

    /// Compile the staged sketch; diagnostics are carried on failure.
    pub async fn build(&self, sink: &LogSink) -> Result<()> {
        let build_dir = self.build_dir.to_string_lossy().into_owned();
        let project_dir = self.project_dir.to_string_lossy().into_owned();
        let args = [
            "compile",
            "--fqbn",
            &self.fqbn,
            "--build-path",
            &build_dir,
            &project_dir,
        ];

        let result = run_streamed(&self.cli, &args, sink, self.timeout).await?;
        if !result.success() {
            return Err(LinkError::BuildFailed(result.diagnostics().to_string()));
        }
        Ok(())
    }

    /// Flash the build output onto the board at `port_path`.
    pub async fn flash(&self, port_path: &str, sink: &LogSink) -> Result<()> {
        self.flash_dir(port_path, &self.build_dir.to_string_lossy(), sink)
            .await
    }

    /// Flash the prebuilt realtime firmware image.
    pub async fn flash_realtime_firmware(&self, port_path: &str, sink: &LogSink) -> Result<()> {
        self.flash_dir(port_path, &self.firmware_dir.to_string_lossy(), sink)
            .await
    }

    async fn flash_dir(&self, port_path: &str, input_dir: &str, sink: &LogSink) -> Result<()> {
        let args = [
            "upload",
            "-p",
            port_path,
            "--fqbn",
            &self.fqbn,
            "--input-dir",
            input_dir,
        ];

        let result = run_streamed(&self.cli, &args, sink, self.timeout).await?;
        if !result.success() {
            return Err(LinkError::FlashFailed(result.diagnostics().to_string()));
        }
        Ok(())
    }
}

/// Program upload: build, disconnect, flash, reconnect.
pub(crate) async fn upload_program(
    core: &Arc<SessionCore>,
    request: &UploadRequest,
    fqbn: Option<&str>,
    sink: &LogSink,
) -> PipelineResult {
    let tool = ArduinoTool::new(&core.config, fqbn);
    let code = request
        .program_text()
        .map_err(|e| PipelineError::Tool(e.to_string()))?;

    let port_path = core
        .connected_port_path()
        .await
        .ok_or_else(|| PipelineError::Tool("no open port".to_string()))?;

    tool.stage(code)?;
    tool.build(sink).await?;

    core.disconnect_internal().await?;
    tool.flash(&port_path, sink).await?;
    core.reconnect_after_upload()
        .await
        .map_err(|_| PipelineError::ReconnectLost)?;

    Ok(())
}

/// Firmware upload: disconnect, flash the prebuilt image, reconnect.
pub(crate) async fn upload_firmware(
    core: &Arc<SessionCore>,
    fqbn: Option<&str>,
    sink: &LogSink,
) -> PipelineResult {
    let tool = ArduinoTool::new(&core.config, fqbn);

    let port_path = core
        .connected_port_path()
        .await
        .ok_or_else(|| PipelineError::Tool("no open port".to_string()))?;

    core.disconnect_internal().await?;
    tool.flash_realtime_firmware(&port_path, sink).await?;
    core.reconnect_after_upload()
        .await
        .map_err(|_| PipelineError::ReconnectLost)?;

    Ok(())
}
