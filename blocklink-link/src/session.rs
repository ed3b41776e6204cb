//! Device session state machine
//!
//! One session per connected caller. The session owns the open port handle
//! exclusively, serializes discovery/connect/disconnect/read/write, runs the
//! connection health monitor, and delegates upload requests to the
//! board-family pipelines in [`crate::upload`].

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blocklink_core::{
    BoardConfig, ConnectionConfig, DiscoveryFilter, LinkConfig, LinkError, PayloadEncoding,
    Peripheral, Result, SessionEvent, UploadRequest,
};
use blocklink_hardware::{usb_ids, PortLink, Transport};

use crate::poll::PollTask;
use crate::runner::LogSink;
use crate::upload;

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port open, no scan active
    Idle,
    /// Discovery polling is active
    Discovering,
    /// A port open is in flight
    Connecting,
    /// A port is open and health-monitored
    Connected,
    /// An upload pipeline is driving the port
    Uploading,
    /// Teardown in progress; writes are rejected
    Disconnecting,
}

impl SessionState {
    /// String representation for logs and status queries
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Uploading => "uploading",
            SessionState::Disconnecting => "disconnecting",
        }
    }
}

/// Push-event channel toward the RPC transport.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Send an event; a dropped receiver means the caller went away, which
    /// is not an error for the session.
    pub fn emit(&self, event: SessionEvent) {
        debug!("Emitting event: {}", event.method());
        if self.tx.send(event).is_err() {
            warn!("Event receiver dropped, discarding event");
        }
    }
}

/// The RPC method surface shared by all transport kinds.
///
/// A sibling wireless-transport session would implement this same trait;
/// [`crate::dispatch::dispatch`] maps wire method names onto it.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    async fn discover(&self, filter: DiscoveryFilter) -> Result<()>;
    async fn connect(&self, peripheral_id: &str, config: ConnectionConfig) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn write(&self, message: &str, encoding: PayloadEncoding) -> Result<usize>;
    async fn read(&self, enable: bool) -> Result<()>;
    async fn upload(&self, request: UploadRequest) -> Result<()>;
    async fn upload_firmware(&self, board: BoardConfig) -> Result<()>;
    async fn get_services(&self) -> Result<Vec<String>>;
    async fn dispose(&self);
}

/// Mutable session state, guarded by one mutex.
///
/// The mutex is the teardown/write exclusion: a write issued while
/// disconnect holds the port observes `port == None` and fails with
/// `SessionClosing` instead of racing the close.
struct SessionInner {
    state: SessionState,
    port: Option<Box<dyn PortLink>>,
    registry: HashMap<String, Peripheral>,
    last_connect: Option<(String, ConnectionConfig)>,
    scan_task: Option<PollTask>,
    health_task: Option<PollTask>,
    read_pump: Option<JoinHandle<()>>,
}

pub(crate) struct SessionCore {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: EventSender,
    pub(crate) config: LinkConfig,
    inner: Mutex<SessionInner>,
    read_enabled: Arc<AtomicBool>,
    upload_gate: Mutex<()>,
}

/// Device session over the serial transport.
#[derive(Clone)]
pub struct SerialSession {
    core: Arc<SessionCore>,
}

impl SerialSession {
    /// Create a session. Push events flow out through `events`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                transport,
                events: EventSender::new(events),
                config,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Idle,
                    port: None,
                    registry: HashMap::new(),
                    last_connect: None,
                    scan_task: None,
                    health_task: None,
                    read_pump: None,
                }),
                read_enabled: Arc::new(AtomicBool::new(false)),
                upload_gate: Mutex::new(()),
            }),
        }
    }

    /// Current state, for status queries and tests.
    pub async fn state(&self) -> SessionState {
        self.core.inner.lock().await.state
    }
}

impl SessionCore {
    /// One discovery scan: enumerate, filter, report devices not yet seen
    /// this scan session.
    async fn scan_once(&self, filter: &DiscoveryFilter) {
        let candidates = match self.transport.enumerate() {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!("Port enumeration failed: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        // A stale tick can land after connect cancelled the scan
        if inner.state != SessionState::Discovering {
            return;
        }

        for candidate in candidates {
            let key = usb_ids::pnp_key(candidate.vendor_id, candidate.product_id);
            if !filter.matches(&key) {
                continue;
            }
            if inner.registry.contains_key(&candidate.path) {
                continue;
            }

            let name = usb_ids::display_name(
                candidate.vendor_id,
                candidate.product_id,
                &candidate.path,
            );
            info!("Discovered peripheral {} ({})", candidate.path, key);
            inner.registry.insert(
                candidate.path.clone(),
                Peripheral {
                    id: candidate.path.clone(),
                    vendor_id: candidate.vendor_id,
                    product_id: candidate.product_id,
                    name: name.clone(),
                },
            );
            self.events.emit(SessionEvent::DidDiscoverPeripheral {
                peripheral_id: candidate.path,
                name,
            });
        }
    }

    fn spawn_scan(self: &Arc<Self>, filter: DiscoveryFilter) -> PollTask {
        let core = Arc::clone(self);
        PollTask::spawn(self.config.discovery_interval(), move || {
            let core = Arc::clone(&core);
            let filter = filter.clone();
            async move {
                core.scan_once(&filter).await;
                ControlFlow::Continue(())
            }
        })
    }

    /// Health monitor: probe port liveness; on the first failed probe, stop
    /// ticking and hand teardown plus the unplug event to a fresh task so
    /// the monitor never aborts itself mid-teardown.
    fn spawn_monitor(self: &Arc<Self>) -> PollTask {
        let core = Arc::clone(self);
        PollTask::spawn(self.config.health_interval(), move || {
            let core = Arc::clone(&core);
            async move {
                let alive = {
                    let inner = core.inner.lock().await;
                    match inner.port.as_ref() {
                        Some(port) => port.is_open(),
                        // Torn down elsewhere, nothing left to monitor
                        None => return ControlFlow::Break(()),
                    }
                };
                if alive {
                    return ControlFlow::Continue(());
                }

                warn!("Connection lost, tearing down session");
                let teardown = Arc::clone(&core);
                tokio::spawn(async move {
                    if let Err(e) = teardown.disconnect_internal().await {
                        warn!("Teardown after connection loss failed: {}", e);
                    }
                    teardown.events.emit(SessionEvent::PeripheralUnplug {});
                });
                ControlFlow::Break(())
            }
        })
    }

    /// Open the port and attach monitor + read pump.
    ///
    /// The caller must have set the state to `Connecting` (or `Uploading`)
    /// under the lock first. When `after_upload` is set, an open failure
    /// additionally raises an unplug event: the board may have failed to
    /// re-enumerate after flashing.
    async fn open_and_attach(
        self: &Arc<Self>,
        path: &str,
        config: &ConnectionConfig,
        after_upload: bool,
    ) -> Result<()> {
        match self.transport.open(path, config).await {
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = SessionState::Idle;
                }
                warn!("Failed to open {}: {}", path, e);
                if after_upload {
                    self.events.emit(SessionEvent::PeripheralUnplug {});
                }
                Err(e)
            }
            Ok(mut port) => {
                let frames = port.take_frames();
                let mut inner = self.inner.lock().await;
                inner.port = Some(port);
                inner.last_connect = Some((path.to_string(), *config));
                inner.state = SessionState::Connected;
                if let Some(rx) = frames {
                    inner.read_pump = Some(spawn_read_pump(
                        self.events.clone(),
                        self.read_enabled.clone(),
                        rx,
                    ));
                }
                inner.health_task = Some(self.spawn_monitor());
                info!("Connected to {}", path);
                Ok(())
            }
        }
    }

    /// Teardown path shared by `disconnect`, the health monitor, and the
    /// upload pipelines.
    ///
    /// Takes the port out of the shared state before touching it, so a
    /// second concurrent disconnect observes no port and no-ops: exactly one
    /// OS-level close happens per open handle.
    pub(crate) async fn disconnect_internal(&self) -> Result<()> {
        let (port, health_task, read_pump) = {
            let mut inner = self.inner.lock().await;
            if inner.port.is_none() {
                // Covers both "never connected" and a concurrent teardown
                return Ok(());
            }
            inner.state = SessionState::Disconnecting;
            (
                inner.port.take(),
                inner.health_task.take(),
                inner.read_pump.take(),
            )
        };

        if let Some(task) = health_task {
            task.cancel();
        }
        if let Some(pump) = read_pump {
            pump.abort();
        }

        let mut port = port.expect("port presence checked under lock");
        // Closing with writes still buffered corrupts in-flight bytes on
        // some platforms
        if let Err(e) = port.drain().await {
            warn!("Drain before close failed: {}", e);
        }
        let close_result = port.close().await;

        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Idle;
        }
        info!("Disconnected");
        close_result
    }

    /// Write raw bytes to the open port and wait for the drain.
    pub(crate) async fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        match inner.port.as_mut() {
            None => {
                if inner.state == SessionState::Disconnecting {
                    Err(LinkError::SessionClosing)
                } else {
                    Err(LinkError::NotConnected)
                }
            }
            Some(port) => {
                port.write_all(data).await?;
                port.drain().await?;
                Ok(data.len())
            }
        }
    }

    /// Path of the currently open port, if any.
    pub(crate) async fn connected_port_path(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.port.as_ref().map(|p| p.path().to_string())
    }

    /// Reconnect with the retained connection parameters after a flash.
    pub(crate) async fn reconnect_after_upload(self: &Arc<Self>) -> Result<()> {
        let (path, config) = {
            let mut inner = self.inner.lock().await;
            if inner.port.is_some() {
                return Err(LinkError::AlreadyConnected);
            }
            let retained = inner.last_connect.clone().ok_or(LinkError::NotConnected)?;
            inner.state = SessionState::Connecting;
            retained
        };
        self.open_and_attach(&path, &config, true).await
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        self.inner.lock().await.state = state;
    }

    /// Settle the state once an upload pipeline has run its course: back to
    /// `Connected` if a port survived (or was reopened), `Idle` otherwise.
    pub(crate) async fn settle_after_upload(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = if inner.port.is_some() {
            SessionState::Connected
        } else {
            SessionState::Idle
        };
    }

    /// Sink that relays toolchain output lines as `uploadStdout` events.
    pub(crate) fn log_sink(&self) -> LogSink {
        let events = self.events.clone();
        LogSink::new(move |line| events.emit(SessionEvent::UploadStdout { message: line }))
    }
}

/// Forward incoming frames as `onMessage` events while read is enabled.
///
/// Frames are always received (so unplug detection keeps working); the flag
/// only gates forwarding.
fn spawn_read_pump(
    events: EventSender,
    read_enabled: Arc<AtomicBool>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if read_enabled.load(Ordering::SeqCst) {
                events.emit(SessionEvent::OnMessage {
                    encoding: PayloadEncoding::Base64.as_str().to_string(),
                    message: PayloadEncoding::Base64.encode(&frame),
                });
            }
        }
    })
}

#[async_trait]
impl DeviceSession for SerialSession {
    async fn discover(&self, filter: DiscoveryFilter) -> Result<()> {
        let core = &self.core;
        let mut inner = core.inner.lock().await;
        if inner.port.is_some()
            || !matches!(
                inner.state,
                SessionState::Idle | SessionState::Discovering
            )
        {
            return Err(LinkError::AlreadyConnected);
        }
        if filter.is_empty() {
            return Err(LinkError::InvalidFilter);
        }

        // A repeated discover restarts the scan session from scratch
        if let Some(old) = inner.scan_task.take() {
            old.cancel();
        }
        inner.registry.clear();
        inner.state = SessionState::Discovering;
        inner.scan_task = Some(core.spawn_scan(filter));
        info!("Discovery started");
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str, config: ConnectionConfig) -> Result<()> {
        let core = &self.core;
        let path = {
            let mut inner = core.inner.lock().await;
            if inner.port.is_some()
                || !matches!(
                    inner.state,
                    SessionState::Idle | SessionState::Discovering
                )
            {
                return Err(LinkError::AlreadyConnected);
            }
            let peripheral = inner
                .registry
                .get(peripheral_id)
                .ok_or_else(|| LinkError::UnknownPeripheral(peripheral_id.to_string()))?;
            let path = peripheral.id.clone();

            // Discovery stops the instant a connect attempt begins
            if let Some(scan) = inner.scan_task.take() {
                scan.cancel();
            }
            inner.state = SessionState::Connecting;
            path
        };

        core.open_and_attach(&path, &config, false).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.core.disconnect_internal().await
    }

    async fn write(&self, message: &str, encoding: PayloadEncoding) -> Result<usize> {
        let data = encoding.decode(message)?;
        self.core.write_bytes(&data).await
    }

    async fn read(&self, enable: bool) -> Result<()> {
        self.core.read_enabled.store(enable, Ordering::SeqCst);
        Ok(())
    }

    async fn upload(&self, request: UploadRequest) -> Result<()> {
        let core = &self.core;
        let _gate = core
            .upload_gate
            .try_lock()
            .map_err(|_| LinkError::UploadInProgress)?;

        if core.connected_port_path().await.is_none() {
            return Err(LinkError::NotConnected);
        }

        upload::run_program(Arc::clone(core), request).await;
        Ok(())
    }

    async fn upload_firmware(&self, board: BoardConfig) -> Result<()> {
        let core = &self.core;
        let _gate = core
            .upload_gate
            .try_lock()
            .map_err(|_| LinkError::UploadInProgress)?;

        if core.connected_port_path().await.is_none() {
            return Err(LinkError::NotConnected);
        }

        match board {
            BoardConfig::Arduino { fqbn } => {
                upload::run_firmware(Arc::clone(core), fqbn.as_deref()).await;
                Ok(())
            }
            BoardConfig::Microbit {} => Err(LinkError::InvalidParams(
                "firmware upload is not supported for this board family".to_string(),
            )),
        }
    }

    async fn get_services(&self) -> Result<Vec<String>> {
        // The serial transport exposes no services
        Ok(Vec::new())
    }

    async fn dispose(&self) {
        if let Err(e) = self.core.disconnect_internal().await {
            warn!("Disconnect during dispose failed: {}", e);
        }
        let mut inner = self.core.inner.lock().await;
        if let Some(scan) = inner.scan_task.take() {
            scan.cancel();
        }
        inner.registry.clear();
        inner.last_connect = None;
        inner.state = SessionState::Idle;
        self.core.read_enabled.store(false, Ordering::SeqCst);
        info!("Session disposed");
    }
}
