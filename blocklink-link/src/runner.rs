//! Subprocess runner with live output streaming
//!
//! Invokes an external toolchain executable, forwards stdout/stderr lines to
//! a sink as they arrive (for `uploadStdout` relay), and resolves with the
//! exit status plus the captured text. Exit-status interpretation is left to
//! the caller; different tools signal failure differently.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use blocklink_core::{LinkError, Result};

/// Terminal result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct SubprocessResult {
    /// Exit code; `None` when the process was terminated by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl SubprocessResult {
    /// Whether the tool exited with code zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Diagnostic text for error reporting: stderr if any, else stdout.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Sink for streamed output lines.
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(String) + Send + Sync>);

impl LogSink {
    pub fn new(f: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A sink that discards all lines.
    pub fn null() -> Self {
        Self::new(|_| {})
    }

    pub fn log(&self, line: impl Into<String>) {
        (self.0.as_ref())(line.into());
    }
}

/// Run an external tool, streaming its output line by line into `sink`.
///
/// The wait is bounded by `timeout`; on expiry the child is killed and
/// [`LinkError::SubprocessTimeout`] is returned, so a hung tool cannot
/// stall an upload pipeline indefinitely.
pub async fn run_streamed(
    program: &Path,
    args: &[&str],
    sink: &LogSink,
    timeout: Duration,
) -> Result<SubprocessResult> {
    debug!("Running {} {:?}", program.display(), args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            LinkError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to launch {}: {}", program.display(), e),
            ))
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let out_sink = sink.clone();
    let stdout_task = tokio::spawn(async move {
        let mut collected = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
            out_sink.log(line);
        }
        collected
    });

    let err_sink = sink.clone();
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
            err_sink.log(line);
        }
        collected
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!("{} exceeded {:?}, killing", program.display(), timeout);
            let _ = child.kill().await;
            return Err(LinkError::SubprocessTimeout(format!(
                "{} did not exit within {:?}",
                program.display(),
                timeout
            )));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    debug!(
        "{} exited with {:?} ({} stdout bytes, {} stderr bytes)",
        program.display(),
        status.code(),
        stdout.len(),
        stderr.len()
    );

    Ok(SubprocessResult {
        status: status.code(),
        stdout,
        stderr,
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn capture_sink() -> (LogSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink = LogSink::new(move |line| captured.lock().unwrap().push(line));
        (sink, lines)
    }

    #[tokio::test]
    async fn test_captures_status_and_streams() {
        let (sink, lines) = capture_sink();
        let result = run_streamed(
            &PathBuf::from("/bin/sh"),
            &["-c", "echo out1; echo err1 1>&2; exit 3"],
            &sink,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.status, Some(3));
        assert!(!result.success());
        assert!(result.stdout.contains("out1"));
        assert!(result.stderr.contains("err1"));
        assert_eq!(result.diagnostics(), "err1");

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&"out1".to_string()));
        assert!(lines.contains(&"err1".to_string()));
    }

    #[tokio::test]
    async fn test_success_exit_code() {
        let sink = LogSink::null();
        let result = run_streamed(
            &PathBuf::from("/bin/sh"),
            &["-c", "exit 0"],
            &sink,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_bounded_wait_kills_hung_tool() {
        let sink = LogSink::null();
        let result = run_streamed(
            &PathBuf::from("/bin/sh"),
            &["-c", "sleep 30"],
            &sink,
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(LinkError::SubprocessTimeout(_))));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let sink = LogSink::null();
        let result = run_streamed(
            &PathBuf::from("/nonexistent/tool"),
            &[],
            &sink,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(LinkError::Io(_))));
    }

    #[test]
    fn test_diagnostics_prefers_stderr() {
        let result = SubprocessResult {
            status: Some(1),
            stdout: "progress\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(result.diagnostics(), "progress");
    }
}
