//! Shared test doubles: an in-memory transport with scriptable devices.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use blocklink_core::{ConnectionConfig, LinkConfig, LinkError, Result, SessionEvent};
use blocklink_hardware::{PortCandidate, PortLink, Transport};
use blocklink_link::SerialSession;

/// Handles into one opened [`MockPort`], kept by the transport so tests can
/// poke the port after the session took ownership of it.
#[derive(Clone)]
pub struct PortHooks {
    pub path: String,
    pub open: Arc<AtomicBool>,
    pub closes: Arc<AtomicUsize>,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl PortHooks {
    /// Simulate a physical unplug: liveness probes start failing.
    pub fn unplug(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

pub struct MockPort {
    path: String,
    open: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    frames: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    close_delay: Duration,
}

#[async_trait]
impl PortLink for MockPort {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::WriteFailed("port is gone".to_string()));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.frames.take()
    }
}

/// Scriptable transport: a mutable device list plus hooks into every port it
/// hands out.
#[derive(Default)]
pub struct MockTransport {
    devices: Mutex<Vec<PortCandidate>>,
    hooks: Mutex<Vec<PortHooks>>,
    fail_open: AtomicBool,
    close_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<PortCandidate>) -> Self {
        let transport = Self::new();
        *transport.devices.lock().unwrap() = devices;
        transport
    }

    pub fn set_devices(&self, devices: Vec<PortCandidate>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent close linger, widening the teardown window.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub fn open_count(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    pub fn hooks(&self, index: usize) -> PortHooks {
        self.hooks.lock().unwrap()[index].clone()
    }

    pub fn last_hooks(&self) -> PortHooks {
        self.hooks.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn enumerate(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn open(&self, path: &str, _config: &ConnectionConfig) -> Result<Box<dyn PortLink>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::OpenFailed {
                path: path.to_string(),
                reason: "port vanished".to_string(),
            });
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let hooks = PortHooks {
            path: path.to_string(),
            open: Arc::new(AtomicBool::new(true)),
            closes: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(Mutex::new(Vec::new())),
            frames: frames_tx,
        };
        let port = MockPort {
            path: path.to_string(),
            open: hooks.open.clone(),
            closes: hooks.closes.clone(),
            writes: hooks.writes.clone(),
            frames: Some(frames_rx),
            close_delay: *self.close_delay.lock().unwrap(),
        };
        self.hooks.lock().unwrap().push(hooks);
        Ok(Box::new(port))
    }
}

pub fn candidate(path: &str, vendor_id: u16, product_id: u16) -> PortCandidate {
    PortCandidate {
        path: path.to_string(),
        vendor_id,
        product_id,
    }
}

/// A session wired to a mock transport with fast poll intervals.
pub fn mock_session(
    transport: Arc<MockTransport>,
    config: LinkConfig,
) -> (SerialSession, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SerialSession::new(transport, config, tx), rx)
}

/// Config pointing inside a temp dir, with intervals short enough for tests.
pub fn test_config(root: &std::path::Path) -> LinkConfig {
    LinkConfig {
        user_data_dir: root.join("data"),
        tools_dir: root.join("tools"),
        discovery_interval_ms: 10,
        health_interval_ms: 5,
        subprocess_timeout_secs: 20,
    }
}

/// Collect the events currently queued, without waiting for more.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
