//! Management-plane JSON-RPC adapter: a `HostManagerConnection` wraps a
//! `tokio-tungstenite` websocket and speaks the `UTIL_CXL_MEM_*`/
//! `UTIL_REINIT` envelope described in `opencxl/cxl/component/
//! host_manager_conn.py`'s `UtilConnServer`. It is a thin collaborator —
//! only envelope (de)serialization and 64-byte-alignment validation live
//! here; the actual CXL.mem access is delegated to a registered
//! [`CxlMemHost`] per host id.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::CxlError;

const CXL_MEM_QUANTUM: usize = 64;

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CxlError> {
    if s.len() % 2 != 0 {
        return Err(CxlError::Decode("odd-length hex string".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| CxlError::Decode(e.to_string())))
        .collect()
}

/// Delegate a `HostManagerConnection` forwards `UTIL_CXL_MEM_*`/
/// `UTIL_REINIT` requests to, one per attached host. Mirrors the split
/// between `UtilConnServer` (envelope) and each host's own
/// `HOST_CXL_MEM_*` handler in the original.
pub trait CxlMemHost: Send + Sync {
    fn read(&self, addr: u64) -> BoxFuture<'_, Result<[u8; CXL_MEM_QUANTUM], CxlError>>;
    fn write(&self, addr: u64, data: [u8; CXL_MEM_QUANTUM]) -> BoxFuture<'_, Result<(), CxlError>>;
    fn birsp(&self, low_addr: u64, opcode: u8) -> BoxFuture<'_, Result<(), CxlError>>;
    fn reinit(&self, hpa_base: u64) -> BoxFuture<'_, Result<(), CxlError>>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params")]
enum HostManagerRequest {
    #[serde(rename = "UTIL_CXL_MEM_READ")]
    UtilCxlMemRead { host_id: u8, addr: u64 },
    #[serde(rename = "UTIL_CXL_MEM_WRITE")]
    UtilCxlMemWrite { host_id: u8, addr: u64, data: String },
    #[serde(rename = "UTIL_CXL_MEM_BIRSP")]
    UtilCxlMemBirsp { host_id: u8, low_addr: u64, opcode: u8 },
    #[serde(rename = "UTIL_REINIT")]
    UtilReinit { host_id: u8, hpa_base: u64 },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum HostManagerResponse {
    Ok { result: serde_json::Value },
    Err { error: JsonRpcError },
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

const ERROR_INVALID_PARAMS: i32 = -32602;
const ERROR_INTERNAL: i32 = -32603;

fn misaligned_error() -> HostManagerResponse {
    HostManagerResponse::Err { error: JsonRpcError { code: ERROR_INVALID_PARAMS, message: "misaligned address".into() } }
}

fn internal_error(message: impl Into<String>) -> HostManagerResponse {
    HostManagerResponse::Err { error: JsonRpcError { code: ERROR_INTERNAL, message: message.into() } }
}

/// Binds `UTIL_CXL_MEM_*`/`UTIL_REINIT` requests arriving over one
/// websocket to the per-host backends registered against it.
pub struct HostManagerConnection {
    hosts: HashMap<u8, Arc<dyn CxlMemHost>>,
}

impl HostManagerConnection {
    pub fn new() -> Self {
        HostManagerConnection { hosts: HashMap::new() }
    }

    pub fn register_host(&mut self, host_id: u8, host: Arc<dyn CxlMemHost>) {
        self.hosts.insert(host_id, host);
    }

    async fn dispatch(&self, request: HostManagerRequest) -> HostManagerResponse {
        match request {
            HostManagerRequest::UtilCxlMemRead { host_id, addr } => {
                if addr % CXL_MEM_QUANTUM as u64 != 0 {
                    return misaligned_error();
                }
                let Some(host) = self.hosts.get(&host_id) else {
                    return internal_error(format!("port{host_id} is not a USP"));
                };
                match host.read(addr).await {
                    Ok(data) => HostManagerResponse::Ok { result: serde_json::json!({ "data": encode_hex(&data) }) },
                    Err(e) => internal_error(e.to_string()),
                }
            }
            HostManagerRequest::UtilCxlMemWrite { host_id, addr, data } => {
                if addr % CXL_MEM_QUANTUM as u64 != 0 {
                    return misaligned_error();
                }
                let Some(host) = self.hosts.get(&host_id) else {
                    return internal_error(format!("port{host_id} is not a USP"));
                };
                let bytes = match decode_hex(&data) {
                    Ok(b) if b.len() == CXL_MEM_QUANTUM => b,
                    Ok(_) => return internal_error("data must be exactly 64 bytes"),
                    Err(e) => return internal_error(e.to_string()),
                };
                let mut buf = [0u8; CXL_MEM_QUANTUM];
                buf.copy_from_slice(&bytes);
                match host.write(addr, buf).await {
                    Ok(()) => HostManagerResponse::Ok { result: serde_json::json!({}) },
                    Err(e) => internal_error(e.to_string()),
                }
            }
            HostManagerRequest::UtilCxlMemBirsp { host_id, low_addr, opcode } => {
                let Some(host) = self.hosts.get(&host_id) else {
                    return internal_error(format!("port{host_id} is not a USP"));
                };
                match host.birsp(low_addr, opcode).await {
                    Ok(()) => HostManagerResponse::Ok { result: serde_json::json!({}) },
                    Err(e) => internal_error(e.to_string()),
                }
            }
            HostManagerRequest::UtilReinit { host_id, hpa_base } => {
                let Some(host) = self.hosts.get(&host_id) else {
                    return internal_error(format!("port{host_id} is not a USP"));
                };
                match host.reinit(hpa_base).await {
                    Ok(()) => HostManagerResponse::Ok { result: serde_json::json!({}) },
                    Err(e) => internal_error(e.to_string()),
                }
            }
        }
    }

    /// Serves one accepted websocket connection until the peer closes it:
    /// each inbound text frame is parsed as a [`HostManagerRequest`] and
    /// answered in place on the same socket.
    pub async fn serve(&self, stream: WebSocketStream<TcpStream>) -> Result<(), CxlError> {
        let (mut sink, mut source) = stream.split();
        while let Some(message) = source.next().await {
            let message = message.map_err(|e| CxlError::Transport(e.to_string()))?;
            let Message::Text(text) = message else { continue };
            let response = match serde_json::from_str::<HostManagerRequest>(&text) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => internal_error(e.to_string()),
            };
            let body = serde_json::to_string(&response).map_err(|e| CxlError::Internal(e.to_string()))?;
            sink.send(Message::Text(body)).await.map_err(|e| CxlError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}

impl Default for HostManagerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHost;

    impl CxlMemHost for EchoHost {
        fn read(&self, addr: u64) -> BoxFuture<'_, Result<[u8; CXL_MEM_QUANTUM], CxlError>> {
            Box::pin(async move {
                let mut buf = [0u8; CXL_MEM_QUANTUM];
                buf[0] = (addr & 0xFF) as u8;
                Ok(buf)
            })
        }
        fn write(&self, _addr: u64, _data: [u8; CXL_MEM_QUANTUM]) -> BoxFuture<'_, Result<(), CxlError>> {
            Box::pin(async move { Ok(()) })
        }
        fn birsp(&self, _low_addr: u64, _opcode: u8) -> BoxFuture<'_, Result<(), CxlError>> {
            Box::pin(async move { Ok(()) })
        }
        fn reinit(&self, _hpa_base: u64) -> BoxFuture<'_, Result<(), CxlError>> {
            Box::pin(async move { Ok(()) })
        }
    }

    #[tokio::test]
    async fn misaligned_read_is_rejected_before_touching_host() {
        let mut conn = HostManagerConnection::new();
        conn.register_host(0, Arc::new(EchoHost));
        let response = conn.dispatch(HostManagerRequest::UtilCxlMemRead { host_id: 0, addr: 1 }).await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn aligned_read_reaches_the_host_backend() {
        let mut conn = HostManagerConnection::new();
        conn.register_host(0, Arc::new(EchoHost));
        let response = conn.dispatch(HostManagerRequest::UtilCxlMemRead { host_id: 0, addr: 64 }).await;
        let json = serde_json::to_value(&response).unwrap();
        let data = json["result"]["data"].as_str().unwrap();
        assert_eq!(data.len(), CXL_MEM_QUANTUM * 2);
    }

    #[tokio::test]
    async fn write_requires_exactly_64_bytes_of_hex() {
        let mut conn = HostManagerConnection::new();
        conn.register_host(0, Arc::new(EchoHost));
        let short_data = encode_hex(&[0u8; 10]);
        let response = conn.dispatch(HostManagerRequest::UtilCxlMemWrite { host_id: 0, addr: 0, data: short_data }).await;
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_some());
    }

    #[tokio::test]
    async fn unknown_host_id_is_an_internal_error() {
        let conn = HostManagerConnection::new();
        let response = conn.dispatch(HostManagerRequest::UtilReinit { host_id: 9, hpa_base: 0 }).await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], -32603);
    }
}
