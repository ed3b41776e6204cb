//! Upload pipeline integration tests driven by stub toolchain executables.
//!
//! The stubs are small shell scripts standing in for the bundled CLI and
//! Python toolchains; behavior is steered with marker files and every
//! invocation is appended to a log for ordering assertions.

#![cfg(unix)]

mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;

use blocklink_core::{
    BoardConfig, ConnectionConfig, DiscoveryFilter, LinkError, SessionEvent, UploadRequest,
};
use blocklink_link::{DeviceSession, SerialSession, SessionState};

use support::{candidate, mock_session, test_config, MockTransport};

struct ToolRig {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    log: PathBuf,
    transport: Arc<MockTransport>,
    session: SerialSession,
    rx: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
}

impl ToolRig {
    fn new(vendor_id: u16, product_id: u16) -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().to_path_buf();
        let log = root.join("invocations.log");
        write_stubs(&root, &log)?;

        let transport = Arc::new(MockTransport::with_devices(vec![candidate(
            "/dev/ttyACM0",
            vendor_id,
            product_id,
        )]));
        let (session, rx) = mock_session(transport.clone(), test_config(&root));
        Ok(Self {
            _tmp: tmp,
            root,
            log,
            transport,
            session,
            rx,
        })
    }

    async fn connect(&mut self) -> Result<()> {
        self.session.discover(DiscoveryFilter::wildcard()).await?;
        let event = timeout(Duration::from_secs(2), self.rx.recv())
            .await?
            .expect("discovery event");
        assert_eq!(event.method(), "didDiscoverPeripheral");
        self.session
            .connect("/dev/ttyACM0", ConnectionConfig::default())
            .await?;
        Ok(())
    }

    fn mark(&self, marker: &str) {
        std::fs::write(self.root.join(marker), "").unwrap();
    }

    fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    /// Collect events until the pipeline reports success or failure.
    async fn events_until_outcome(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), self.rx.recv())
                .await
                .expect("pipeline outcome within deadline")
                .expect("event channel open");
            let done = matches!(
                event,
                SessionEvent::UploadSuccess {} | SessionEvent::UploadError { .. }
            );
            events.push(event);
            if done {
                return events;
            }
        }
    }
}

/// Install the stub `arduino-cli` and `python` executables.
fn write_stubs(root: &Path, log: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tools = root.join("tools");
    std::fs::create_dir_all(tools.join("Python"))?;

    let cli = format!(
        r#"#!/bin/sh
echo "arduino-cli $*" >> {log}
case "$1" in
  compile)
    [ -f {root}/fail_compile ] && {{ echo "exit status 1: region overflowed" >&2; exit 1; }}
    [ -f {root}/slow_compile ] && sleep 2
    echo "Sketch uses 444 bytes of program storage space."
    exit 0
    ;;
  upload)
    [ -f {root}/fail_upload ] && {{ echo "avrdude: stk500_recv(): programmer is not responding" >&2; exit 1; }}
    echo "Flashing complete"
    exit 0
    ;;
esac
exit 0
"#,
        log = log.display(),
        root = root.display()
    );

    let python = format!(
        r#"#!/bin/sh
echo "python $*" >> {log}
case "$1" in
  *uflash*)
    echo "Flashing Python to: /media/MICROBIT/micropython.hex"
    exit 0
    ;;
  *ufs*)
    case "$2" in
      ls)
        [ -f {root}/repl_broken ] && {{ echo "Could not enter raw REPL."; exit 1; }}
        echo "main.py"
        exit 0
        ;;
      put)
        [ -f {root}/put_fails ] && {{ echo "Could not enter raw REPL."; exit 0; }}
        exit 0
        ;;
    esac
    ;;
esac
exit 0
"#,
        log = log.display(),
        root = root.display()
    );

    for (path, content) in [
        (tools.join("arduino-cli"), cli),
        (tools.join("Python").join("python"), python),
    ] {
        std::fs::write(&path, content)?;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(())
}

fn arduino_request(program: &str) -> UploadRequest {
    UploadRequest {
        board: BoardConfig::Arduino { fqbn: None },
        program: program.as_bytes().to_vec(),
    }
}

fn microbit_request(program: &str) -> UploadRequest {
    UploadRequest {
        board: BoardConfig::Microbit {},
        program: program.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_arduino_upload_builds_then_flashes() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;

    rig.session
        .upload(arduino_request("void setup() {}\nvoid loop() {}\n"))
        .await?;
    let events = rig.events_until_outcome().await;
    assert!(matches!(events.last(), Some(SessionEvent::UploadSuccess {})));

    // Build output was streamed to the caller
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::UploadStdout { message } if message.contains("Sketch uses")
    )));

    let log = rig.invocations();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("arduino-cli compile"));
    assert!(log[0].contains("--fqbn arduino:avr:uno"));
    assert!(log[1].starts_with("arduino-cli upload"));
    assert!(log[1].contains("-p /dev/ttyACM0"));
    assert!(log[1].contains("--input-dir"));

    // The port was closed for flashing and reopened afterwards
    assert_eq!(rig.transport.open_count(), 2);
    assert_eq!(rig.transport.hooks(0).close_count(), 1);

    // The staged sketch landed in the project directory
    let sketch = rig.root.join("data/arduino/project/project.ino");
    assert!(std::fs::read_to_string(sketch)?.contains("void loop()"));
    Ok(())
}

#[tokio::test]
async fn test_arduino_build_failure_keeps_connection() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;
    rig.mark("fail_compile");

    rig.session.upload(arduino_request("broken")).await?;
    let events = rig.events_until_outcome().await;
    match events.last() {
        Some(SessionEvent::UploadError { message }) => {
            assert!(message.contains("region overflowed"));
        }
        other => panic!("expected uploadError, got {:?}", other),
    }

    // The build runs before disconnect: the port never closed
    assert_eq!(rig.transport.open_count(), 1);
    assert_eq!(rig.transport.hooks(0).close_count(), 0);
    // No upload invocation after the failed compile
    assert_eq!(rig.invocations().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_arduino_flash_failure_reports_error() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;
    rig.mark("fail_upload");

    rig.session.upload(arduino_request("void loop() {}")).await?;
    let events = rig.events_until_outcome().await;
    match events.last() {
        Some(SessionEvent::UploadError { message }) => {
            assert!(message.contains("programmer is not responding"));
        }
        other => panic!("expected uploadError, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_arduino_firmware_upload_skips_build() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;

    rig.session
        .upload_firmware(BoardConfig::Arduino { fqbn: None })
        .await?;
    let events = rig.events_until_outcome().await;
    assert!(matches!(events.last(), Some(SessionEvent::UploadSuccess {})));

    let log = rig.invocations();
    assert_eq!(log.len(), 1);
    assert!(log[0].starts_with("arduino-cli upload"));
    assert!(log[0].contains("firmware/arduino"));
    assert_eq!(rig.transport.open_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_microbit_upload_healthy_firmware() -> Result<()> {
    let mut rig = ToolRig::new(0x0D28, 0x0204)?;
    rig.connect().await?;

    rig.session
        .upload(microbit_request("from microbit import *\n"))
        .await?;
    let events = rig.events_until_outcome().await;
    assert!(matches!(events.last(), Some(SessionEvent::UploadSuccess {})));

    let log = rig.invocations();
    // Probe, then one put for main.py; the healthy probe skips uflash
    assert_eq!(log.len(), 2);
    assert!(log[0].contains("ufs-script.py ls"));
    assert!(log[1].contains("ufs-script.py put"));
    assert!(log[1].contains("main.py"));
    assert!(!log.iter().any(|l| l.contains("uflash")));

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::UploadStdout { message } if message == "Writing files..."
    )));

    // The wake-up byte went out on the reconnected port
    assert_eq!(rig.transport.open_count(), 2);
    assert_eq!(rig.transport.hooks(1).written(), vec![vec![0x04]]);
    Ok(())
}

#[tokio::test]
async fn test_microbit_broken_repl_reflashes_first() -> Result<()> {
    let mut rig = ToolRig::new(0x0D28, 0x0204)?;
    rig.connect().await?;
    rig.mark("repl_broken");

    rig.session.upload(microbit_request("pass")).await?;
    let events = rig.events_until_outcome().await;
    assert!(matches!(events.last(), Some(SessionEvent::UploadSuccess {})));

    let log = rig.invocations();
    assert_eq!(log.len(), 3);
    assert!(log[0].contains("ufs-script.py ls"));
    assert!(log[1].contains("uflash-script.py"));
    assert!(log[2].contains("ufs-script.py put"));

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::UploadStdout { message } if message == "Could not enter raw REPL."
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::UploadStdout { message } if message == "Flash Success."
    )));
    Ok(())
}

#[tokio::test]
async fn test_microbit_put_failure_flags_device_lost() -> Result<()> {
    let mut rig = ToolRig::new(0x0D28, 0x0204)?;
    rig.connect().await?;
    rig.mark("put_fails");

    rig.session.upload(microbit_request("pass")).await?;
    let events = rig.events_until_outcome().await;
    match events.last() {
        Some(SessionEvent::UploadError { .. }) => {}
        other => panic!("expected uploadError, got {:?}", other),
    }

    // The failed put leaves the device unaccounted for
    let trailing = timeout(Duration::from_secs(2), rig.rx.recv())
        .await?
        .expect("unplug event");
    assert!(matches!(trailing, SessionEvent::PeripheralUnplug {}));

    // No reconnect attempt after the failure
    assert_eq!(rig.transport.open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_failure_after_flash_reports_unplug_and_error() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;
    // The board vanishes for good once the flash frees the port
    rig.transport.set_fail_open(true);

    rig.session.upload(arduino_request("void loop() {}")).await?;
    let events = rig.events_until_outcome().await;

    // The caller gets both the unplug hint and a terminal upload event
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::PeripheralUnplug {})));
    match events.last() {
        Some(SessionEvent::UploadError { message }) => {
            assert!(message.contains("re-enumerate"));
        }
        other => panic!("expected uploadError, got {:?}", other),
    }

    // Build and flash both ran; only the reopen failed
    let log = rig.invocations();
    assert_eq!(log.len(), 2);
    assert!(log[1].starts_with("arduino-cli upload"));
    assert_eq!(rig.transport.open_count(), 1);
    assert_eq!(rig.session.state().await, SessionState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_second_upload_is_rejected_while_running() -> Result<()> {
    let mut rig = ToolRig::new(0x2341, 0x0043)?;
    rig.connect().await?;
    rig.mark("slow_compile");

    let first = {
        let session = rig.session.clone();
        tokio::spawn(async move { session.upload(arduino_request("void loop() {}")).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let result = rig.session.upload(arduino_request("void loop() {}")).await;
    assert!(matches!(result, Err(LinkError::UploadInProgress)));

    first.await??;
    let events = rig.events_until_outcome().await;
    assert!(matches!(events.last(), Some(SessionEvent::UploadSuccess {})));
    Ok(())
}
