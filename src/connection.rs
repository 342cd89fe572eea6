//! Switch connection manager: the TCP server a switch listens on for
//! incoming device/host connections, plus the client-side helper a
//! device uses to dial in. Every connection starts with a sideband
//! handshake (`ConnectionRequest` carrying the requested port index,
//! answered with `ConnectionAccept`/`ConnectionReject`) before the
//! [`crate::processor::PacketProcessor`] takes over the byte stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::cci_executor::CciExecutor;
use crate::component::{ComponentStatus, StatusTracker};
use crate::error::CxlError;
use crate::event::{EventBus, FabricEvent, PortUpdateEvent};
use crate::fifo::CxlConnection;
use crate::packet::get_packet;
use crate::packet::sideband::{SidebandPacket, SidebandType};
use crate::port::PortDevice;
use crate::processor::{ComponentType, PacketProcessor, PortResponder};

/// Static configuration for one switch port: whether it faces upstream
/// (host-facing) or downstream (device-facing), which decides the
/// [`ComponentType`] its packet processor runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    pub port_type: PortType,
    pub cxl_cache: bool,
    pub cxl_mem: bool,
    /// HDM Decoder Capability `decoder_count` encoding this port's
    /// component register block reports; see
    /// `fabric::hdm::decoder_count_from_register`.
    pub decoder_count_register: u8,
}

struct SwitchPort {
    config: PortConfig,
    connected: watch::Sender<bool>,
    connection: Arc<Mutex<CxlConnection>>,
    device: Arc<Mutex<PortDevice>>,
}

/// Owns one [`CxlConnection`] per configured port and the TCP server that
/// binds incoming sockets to them by handshake. Mirrors the fixed-port
/// topology a physical CXL switch is wired with: ports are declared up
/// front, not discovered. Each port also owns the [`PortDevice`] that
/// answers its config-space/MMIO traffic, and every port shares the same
/// optional [`CciExecutor`] for its CCI traffic, matching one CCI mailbox
/// per switch reachable from any port.
pub struct SwitchConnectionManager {
    host: String,
    port: u16,
    connection_timeout: Duration,
    ports: Vec<SwitchPort>,
    events: EventBus,
    tracker: StatusTracker,
    cci_executor: Option<Arc<CciExecutor>>,
}

impl SwitchConnectionManager {
    pub fn new(
        port_configs: Vec<PortConfig>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<(Self, watch::Receiver<ComponentStatus>), CxlError> {
        let ports = port_configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| {
                let device = PortDevice::new(index, config.port_type, config.decoder_count_register)?;
                Ok(SwitchPort {
                    config,
                    connected: watch::channel(false).0,
                    connection: Arc::new(Mutex::new(CxlConnection::new())),
                    device: Arc::new(Mutex::new(device)),
                })
            })
            .collect::<Result<Vec<_>, CxlError>>()?;
        let (tracker, rx) = StatusTracker::new();
        Ok((
            SwitchConnectionManager {
                host: host.into(),
                port,
                connection_timeout: Duration::from_millis(5000),
                ports,
                events: EventBus::new(64),
                tracker,
                cci_executor: None,
            },
            rx,
        ))
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Attaches the CCI executor every port's responder forwards CCI
    /// traffic to. Without one, CCI requests are answered `Unsupported`.
    pub fn with_cci_executor(mut self, executor: Arc<CciExecutor>) -> Self {
        self.cci_executor = Some(executor);
        self
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn connection(&self, port_index: usize) -> Result<Arc<Mutex<CxlConnection>>, CxlError> {
        self.ports
            .get(port_index)
            .map(|p| p.connection.clone())
            .ok_or_else(|| CxlError::Validation(format!("port {port_index} is unsupported")))
    }

    pub fn is_connected(&self, port_index: usize) -> bool {
        self.ports.get(port_index).map(|p| *p.connected.borrow()).unwrap_or(false)
    }

    /// Runs the accept loop until cancelled. Each accepted socket is
    /// handled on its own task so a slow or malicious handshake on one
    /// port cannot block the others.
    pub async fn run(self: Arc<Self>) -> Result<(), CxlError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(CxlError::from)?;
        log::info!("switch connection manager listening on {}:{}", self.host, self.port);
        self.tracker.set(ComponentStatus::Running);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    continue;
                }
            };
            log::info!("accepted a new socket connection from {peer}");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_client(stream).await {
                    log::error!("connection handler error: {e}");
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream) -> Result<(), CxlError> {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let port_index = match tokio::time::timeout(
            self.connection_timeout,
            self.wait_for_connection_request(&mut reader),
        )
        .await
        {
            Ok(Ok(index)) => index,
            Ok(Err(e)) => {
                log::debug!("handshake error: {e}");
                self.send_rejection(&mut writer).await;
                return Err(e);
            }
            Err(_) => {
                log::debug!("handshake timed out");
                self.send_rejection(&mut writer).await;
                return Err(CxlError::Timeout);
            }
        };

        self.send_confirmation(&mut writer).await?;
        self.update_connection_status(port_index, true);
        log::info!("bound incoming connection to port {port_index}");

        let connection = self.ports[port_index].connection.clone();
        let component_type = self.component_type_for(port_index);
        let responder = Arc::new(PortResponder {
            port: self.ports[port_index].device.clone(),
            completer_id: port_index as u16,
            cci_executor: self.cci_executor.clone(),
        });
        let (processor, _status_rx) = PacketProcessor::new(component_type);
        let processor = processor.with_responder(responder);
        let mut guard = connection.lock().await;
        let result = processor.run(&mut reader, &mut writer, &mut *guard).await;
        drop(guard);

        self.update_connection_status(port_index, false);
        log::info!("closed connection for port {port_index}");
        result
    }

    fn component_type_for(&self, port_index: usize) -> ComponentType {
        let config = self.ports[port_index].config;
        match config.port_type {
            PortType::Downstream => ComponentType::RootOrDownstream,
            PortType::Upstream => ComponentType::UpstreamOrDevice {
                cxl_cache: config.cxl_cache,
                cxl_mem: config.cxl_mem,
            },
        }
    }

    fn update_connection_status(&self, port_index: usize, connected: bool) {
        let _ = self.ports[port_index].connected.send(connected);
        self.events.publish(FabricEvent::Port(PortUpdateEvent { port_id: port_index, connected }));
    }

    async fn wait_for_connection_request<R: tokio::io::AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<usize, CxlError> {
        let packet = get_packet(reader)
            .await?
            .ok_or_else(|| CxlError::Protocol("connection closed before handshake completed".into()))?;
        let sideband = match packet {
            crate::packet::Packet::Sideband(s) => s,
            _ => return Err(CxlError::Protocol("expected a sideband packet for the handshake".into())),
        };
        if !sideband.is_connection_request() {
            return Err(CxlError::Protocol("expected a connection request".into()));
        }
        let port_index = sideband.port.ok_or_else(|| {
            CxlError::Protocol("connection request is missing a port index".into())
        })? as usize;
        if port_index >= self.ports.len() {
            return Err(CxlError::Validation(format!("invalid port number: {port_index}")));
        }
        if *self.ports[port_index].connected.borrow() {
            return Err(CxlError::Protocol(format!("connection already exists for port {port_index}")));
        }
        Ok(port_index)
    }

    async fn send_confirmation<W: tokio::io::AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), CxlError> {
        use tokio::io::AsyncWriteExt;
        let packet = SidebandPacket::create(SidebandType::ConnectionAccept);
        writer.write_all(&packet.encode()).await.map_err(CxlError::from)
    }

    async fn send_rejection<W: tokio::io::AsyncWrite + Unpin>(&self, writer: &mut W) {
        use tokio::io::AsyncWriteExt;
        let packet = SidebandPacket::create(SidebandType::ConnectionReject);
        let _ = writer.write_all(&packet.encode()).await;
    }
}

/// Dials a switch port from the device side of a connection: sends the
/// connection request and waits for `ConnectionAccept`, leaving the
/// stream positioned for [`crate::processor::PacketProcessor::run`].
pub async fn connect_to_switch(
    addr: impl tokio::net::ToSocketAddrs,
    port_index: u8,
) -> Result<TcpStream, CxlError> {
    use tokio::io::AsyncWriteExt;

    let mut stream = TcpStream::connect(addr).await.map_err(CxlError::from)?;
    stream.set_nodelay(true).ok();
    let request = SidebandPacket::connection_request(port_index);
    stream.write_all(&request.encode()).await.map_err(CxlError::from)?;

    let response = get_packet(&mut stream)
        .await?
        .ok_or_else(|| CxlError::Transport("connection closed during handshake".into()))?;
    match response {
        crate::packet::Packet::Sideband(s) if s.sideband_type == SidebandType::ConnectionAccept => Ok(stream),
        crate::packet::Packet::Sideband(s) if s.sideband_type == SidebandType::ConnectionReject => {
            Err(CxlError::Protocol("switch rejected the connection request".into()))
        }
        _ => Err(CxlError::Protocol("unexpected response to connection request".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_configs() -> Vec<PortConfig> {
        vec![
            PortConfig { port_type: PortType::Downstream, cxl_cache: false, cxl_mem: false, decoder_count_register: 0 },
            PortConfig { port_type: PortType::Upstream, cxl_cache: true, cxl_mem: true, decoder_count_register: 0 },
        ]
    }

    #[tokio::test]
    async fn new_manager_starts_with_all_ports_disconnected() {
        let (manager, _rx) = SwitchConnectionManager::new(port_configs(), "127.0.0.1", 0).unwrap();
        assert_eq!(manager.port_count(), 2);
        assert!(!manager.is_connected(0));
        assert!(!manager.is_connected(1));
    }

    #[tokio::test]
    async fn invalid_port_in_handshake_is_rejected() {
        let (manager, _rx) = SwitchConnectionManager::new(port_configs(), "127.0.0.1", 0).unwrap();
        let request = SidebandPacket::connection_request(5);
        let bytes = request.encode();
        let mut reader = std::io::Cursor::new(bytes);
        let result = manager.wait_for_connection_request(&mut reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn component_type_matches_port_config() {
        let (manager, _rx) = SwitchConnectionManager::new(port_configs(), "127.0.0.1", 0).unwrap();
        assert_eq!(manager.component_type_for(0), ComponentType::RootOrDownstream);
        assert_eq!(
            manager.component_type_for(1),
            ComponentType::UpstreamOrDevice { cxl_cache: true, cxl_mem: true }
        );
    }
}
