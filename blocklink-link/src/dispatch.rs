//! RPC method dispatch
//!
//! Maps wire method names and JSON params onto the [`DeviceSession`] trait.
//! The duplex RPC transport calls [`dispatch`] for each incoming request and
//! forwards the session's push events back out; nothing here knows how the
//! transport moves bytes.

use serde::Deserialize;
use serde_json::{json, Value};

use blocklink_core::{
    BoardConfig, ConnectionConfig, DiscoveryFilter, LinkError, PayloadEncoding, Result,
    UploadRequest,
};

use crate::session::DeviceSession;

#[derive(Debug, Deserialize)]
struct DiscoverParams {
    filters: DiscoveryFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    peripheral_id: String,
    peripheral_config: PeripheralConfig,
}

#[derive(Debug, Deserialize)]
struct PeripheralConfig {
    config: ConnectionConfig,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    message: String,
    #[serde(default)]
    encoding: PayloadEncoding,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    #[serde(default = "default_true")]
    enable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    message: String,
    config: BoardConfig,
    #[serde(default)]
    encoding: PayloadEncoding,
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| LinkError::InvalidParams(e.to_string()))
}

/// Dispatch one RPC call onto a session.
///
/// Each call produces exactly one completion value or error; asynchronous
/// outcomes (discovery hits, upload progress) follow as push events.
pub async fn dispatch<S: DeviceSession + ?Sized>(
    session: &S,
    method: &str,
    params: Value,
) -> Result<Value> {
    match method {
        "discover" => {
            let p: DiscoverParams = parse(params)?;
            session.discover(p.filters).await?;
            Ok(Value::Null)
        }
        "connect" => {
            let p: ConnectParams = parse(params)?;
            session
                .connect(&p.peripheral_id, p.peripheral_config.config)
                .await?;
            Ok(Value::Null)
        }
        "disconnect" => {
            session.disconnect().await?;
            Ok(Value::Null)
        }
        "write" => {
            let p: WriteParams = parse(params)?;
            let written = session.write(&p.message, p.encoding).await?;
            Ok(json!(written))
        }
        "read" => {
            let p: ReadParams = if params.is_null() {
                ReadParams { enable: true }
            } else {
                parse(params)?
            };
            session.read(p.enable).await?;
            Ok(Value::Null)
        }
        "upload" => {
            let p: UploadParams = parse(params)?;
            let program = p.encoding.decode(&p.message)?;
            session
                .upload(UploadRequest {
                    board: p.config,
                    program,
                })
                .await?;
            Ok(Value::Null)
        }
        "uploadFirmware" => {
            let board: BoardConfig = parse(params)?;
            session.upload_firmware(board).await?;
            Ok(Value::Null)
        }
        "getServices" => {
            let services = session.get_services().await?;
            Ok(json!(services))
        }
        other => Err(LinkError::MethodNotFound(other.to_string())),
    }
}
