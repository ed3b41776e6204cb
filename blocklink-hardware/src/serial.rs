//! Real serial transport backed by `tokio-serial`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use blocklink_core::{ConnectionConfig, LinkError, Result};

use crate::transport::{PortCandidate, PortLink, Transport};

/// Builder-level timeout handed to `tokio-serial`; actual reads pend on the
/// async reactor, so this only bounds blocking setup calls.
const OPEN_TIMEOUT: Duration = Duration::from_millis(1000);

fn map_data_bits(bits: u8) -> Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(LinkError::Config(format!("unsupported data bits: {}", other))),
    }
}

fn map_stop_bits(bits: u8) -> Result<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(LinkError::Config(format!("unsupported stop bits: {}", other))),
    }
}

/// Serial transport over the OS serial-port driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransport;

impl SerialTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn enumerate(&self) -> Result<Vec<PortCandidate>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| LinkError::Serial(format!("failed to enumerate ports: {}", e)))?;

        let candidates = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                tokio_serial::SerialPortType::UsbPort(info) => Some(PortCandidate {
                    path: port.port_name,
                    vendor_id: info.vid,
                    product_id: info.pid,
                }),
                _ => None,
            })
            .collect();

        Ok(candidates)
    }

    async fn open(&self, path: &str, config: &ConnectionConfig) -> Result<Box<dyn PortLink>> {
        let link = SerialLink::open(path, config)?;
        Ok(Box::new(link))
    }
}

/// One open serial port: a write half plus a background read pump feeding
/// incoming frames into an unbounded channel.
pub struct SerialLink {
    path: String,
    writer: WriteHalf<SerialStream>,
    open: Arc<AtomicBool>,
    frames: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    read_task: JoinHandle<()>,
}

impl SerialLink {
    /// Open a serial port with the caller's connection parameters.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        debug!("Opening serial port {} at {} baud", path, config.baud_rate);

        let stream = tokio_serial::new(path, config.baud_rate)
            .timeout(OPEN_TIMEOUT)
            .data_bits(map_data_bits(config.data_bits)?)
            .stop_bits(map_stop_bits(config.stop_bits)?)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::OpenFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let (reader, writer) = tokio::io::split(stream);
        let open = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(read_pump(reader, frame_tx, open.clone()));

        Ok(Self {
            path: path.to_string(),
            writer,
            open,
            frames: Some(frame_rx),
            read_task,
        })
    }
}

/// Pump incoming bytes into the frame channel until EOF or error.
///
/// EOF on a serial stream means the device disappeared (USB unplugged); the
/// shared `open` flag is the liveness signal the health monitor probes.
async fn read_pump(
    mut reader: ReadHalf<SerialStream>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("Serial port returned EOF, device may have been unplugged");
                break;
            }
            Ok(n) => {
                if frames.send(buf[..n].to_vec()).is_err() {
                    // Receiver gone, session no longer cares about frames
                    break;
                }
            }
            Err(e) => {
                warn!("Serial read error: {}", e);
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
}

#[async_trait]
impl PortLink for SerialLink {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn drain(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| LinkError::WriteFailed(format!("drain failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing serial port {}", self.path);
        self.open.store(false, Ordering::SeqCst);
        self.read_task.abort();
        self.writer
            .shutdown()
            .await
            .map_err(|e| LinkError::Serial(format!("close failed: {}", e)))
    }

    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.frames.take()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
