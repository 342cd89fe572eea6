//! Packet processor: reads packets off one end of a TCP connection and
//! fans them into the right FIFO by packet class, and drains the
//! opposite-direction FIFOs back onto the wire. One processor runs per
//! connection endpoint (switch side or device side). A connection-local
//! [`CxlResponder`], if one was attached, answers every inbound cfg/mmio/
//! CCI request so the matching response makes its way back out over the
//! same FIFOs the outgoing half drains.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::component::{ComponentStatus, StatusTracker};
use crate::error::CxlError;
use crate::fifo::{disconnect_sentinel, is_disconnect_sentinel, CxlConnection};
use crate::packet::cci::{CciMessage, ReturnCode};
use crate::packet::{cxl_io::CxlIoPacket, get_packet, Packet};

/// Component role a processor is configured for, matching the FIFOs it
/// wires up: root/downstream-port-facing roles only carry cfg+mmio;
/// upstream/device-facing roles additionally carry cxl.mem and/or
/// cxl.cache depending on device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    RootOrDownstream,
    UpstreamOrDevice { cxl_cache: bool, cxl_mem: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlpFifoType {
    Cfg,
    Mmio,
}

/// Tracks config-space/MMIO requests awaiting their completion so a
/// returning `Cpl`/`CplD` can be routed back to the FIFO that issued the
/// original request. A `tid` already present in the table is a protocol
/// violation: CXL.io allows at most one request in flight per
/// `(requester_id, tag)`. Shared between the incoming and outgoing halves
/// of a connection since either direction can originate a request: a host
/// reads its own completions off the incoming stream, but a port that
/// itself issues requests downstream (relaying, or a device-side
/// responder) sees its completions the same way, so both `run_incoming`
/// and `run_outgoing_all` push/pop against the same table.
#[derive(Default)]
struct TlpTable {
    entries: HashMap<u32, TlpFifoType>,
}

impl TlpTable {
    fn push(&mut self, packet: &CxlIoPacket, fifo_type: TlpFifoType) -> Result<(), CxlError> {
        let tid = packet.transaction_id();
        if self.entries.insert(tid, fifo_type).is_some() {
            return Err(CxlError::Protocol(format!(
                "tid {tid:#06x} already exists in the TLP table"
            )));
        }
        Ok(())
    }

    fn pop(&mut self, packet: &CxlIoPacket) -> Result<TlpFifoType, CxlError> {
        let tid = packet.transaction_id();
        self.entries
            .remove(&tid)
            .ok_or_else(|| CxlError::Protocol(format!("tid {tid:#06x} not found in the TLP table")))
    }

    /// Applied to a packet on its way out over the wire, symmetric with the
    /// push/pop `dispatch_cxl_io` applies to a packet just read off it: a
    /// non-posted request leaving through `fifo_type` gets an entry so the
    /// completion that eventually arrives on the incoming side can be
    /// routed back to it; a completion leaving pops the entry a request
    /// arriving on the incoming side pushed.
    fn track_outgoing(&mut self, packet: &Packet, fifo_type: TlpFifoType) -> Result<(), CxlError> {
        let Packet::CxlIo(io) = packet else { return Ok(()) };
        if io.is_cpl() {
            self.pop(io).map(|_| ())
        } else if io.is_cfg() || (io.is_mmio() && !io.is_mem_write()) {
            self.push(io, fifo_type)
        } else {
            Ok(())
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Answers config-space, MMIO, and CCI requests that a connection's
/// incoming reader routed into its host-to-target FIFOs. `PacketProcessor`
/// drains each host-to-target queue through an attached responder and
/// pushes the result onto the matching target-to-host queue for the
/// outgoing half to write out.
pub trait CxlResponder: Send + Sync {
    fn handle_cfg(&self, req: CxlIoPacket) -> BoxFuture<'_, Result<CxlIoPacket, CxlError>>;
    fn handle_mmio(&self, req: CxlIoPacket) -> BoxFuture<'_, Result<Option<CxlIoPacket>, CxlError>>;
    fn handle_cci(&self, req: CciMessage) -> BoxFuture<'_, CciMessage>;
}

/// The default responder a physical port runs: its own
/// [`crate::port::PortDevice`] for config-space/MMIO, and the switch's
/// shared CCI executor, if any, for management traffic. Ports with no
/// management role are built with `cci_executor: None` and answer CCI
/// requests with `Unsupported` rather than silently dropping them.
pub struct PortResponder {
    pub port: Arc<Mutex<crate::port::PortDevice>>,
    pub completer_id: u16,
    pub cci_executor: Option<Arc<crate::cci_executor::CciExecutor>>,
}

impl CxlResponder for PortResponder {
    fn handle_cfg(&self, req: CxlIoPacket) -> BoxFuture<'_, Result<CxlIoPacket, CxlError>> {
        Box::pin(async move {
            let mut port = self.port.lock().await;
            port.handle_cfg(self.completer_id, &req)
        })
    }

    fn handle_mmio(&self, req: CxlIoPacket) -> BoxFuture<'_, Result<Option<CxlIoPacket>, CxlError>> {
        Box::pin(async move {
            let mut port = self.port.lock().await;
            port.handle_mmio(self.completer_id, &req)
        })
    }

    fn handle_cci(&self, req: CciMessage) -> BoxFuture<'_, CciMessage> {
        Box::pin(async move {
            match &self.cci_executor {
                Some(executor) => executor.dispatch(&req).await,
                None => CciMessage::response(req.message_tag, req.command_opcode, ReturnCode::Unsupported, vec![]),
            }
        })
    }
}

/// Drives the incoming (reader -> FIFOs), outgoing (FIFOs -> writer), and
/// responding (host_to_target FIFOs -> responder -> target_to_host FIFOs)
/// halves of a connection.
pub struct PacketProcessor {
    component_type: ComponentType,
    tracker: StatusTracker,
    responder: Option<Arc<dyn CxlResponder>>,
}

impl PacketProcessor {
    pub fn new(component_type: ComponentType) -> (Self, tokio::sync::watch::Receiver<ComponentStatus>) {
        let (tracker, rx) = StatusTracker::new();
        (
            PacketProcessor {
                component_type,
                tracker,
                responder: None,
            },
            rx,
        )
    }

    /// Attaches the responder this processor drains `host_to_target_rx`
    /// through. Without one, inbound requests are read and discarded so
    /// the unbounded FIFOs don't grow forever, but never answered.
    pub fn with_responder(mut self, responder: Arc<dyn CxlResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Run all three halves of the processor to completion: the reader
    /// side until EOF/protocol error (at which point it injects the
    /// disconnect sentinel into every outgoing FIFO), the writer side
    /// until it has drained every FIFO class past its sentinel, and the
    /// responder side until its three host-to-target FIFOs are drained
    /// past their sentinels too. Takes the target-to-host and
    /// host-to-target receivers out of `connection` (each is drained by
    /// exactly one task for the connection's lifetime).
    pub async fn run<R, W>(
        &self,
        mut reader: R,
        writer: W,
        connection: &mut CxlConnection,
    ) -> Result<(), CxlError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.tracker.set(ComponentStatus::Running);

        let cfg_rx = connection.cfg_fifo.target_to_host_rx.take().expect("taken once");
        let mmio_rx = connection.mmio_fifo.target_to_host_rx.take().expect("taken once");
        let cci_rx = connection.cci_fifo.target_to_host_rx.take().expect("taken once");
        let cxl_mem_rx = match self.component_type {
            ComponentType::UpstreamOrDevice { cxl_mem: true, .. } => {
                connection.cxl_mem_fifo.target_to_host_rx.take()
            }
            _ => None,
        };
        let cxl_cache_rx = match self.component_type {
            ComponentType::UpstreamOrDevice { cxl_cache: true, .. } => {
                connection.cxl_cache_fifo.target_to_host_rx.take()
            }
            _ => None,
        };

        let cfg_req_rx = connection.cfg_fifo.host_to_target_rx.take().expect("taken once");
        let mmio_req_rx = connection.mmio_fifo.host_to_target_rx.take().expect("taken once");
        let cci_req_rx = connection.cci_fifo.host_to_target_rx.take().expect("taken once");

        let tlp_table = Mutex::new(TlpTable::default());

        let incoming = self.run_incoming(&mut reader, connection, &tlp_table);
        let outgoing = run_outgoing_all(writer, &tlp_table, cfg_rx, mmio_rx, cxl_mem_rx, cxl_cache_rx, cci_rx);
        let responding = self.run_responding(connection, cfg_req_rx, mmio_req_rx, cci_req_rx);
        let (incoming_result, outgoing_result, responding_result) = tokio::join!(incoming, outgoing, responding);

        self.tracker.set(ComponentStatus::Stopped);
        incoming_result?;
        outgoing_result?;
        responding_result
    }

    async fn run_incoming<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        connection: &CxlConnection,
        tlp_table: &Mutex<TlpTable>,
    ) -> Result<(), CxlError> {
        loop {
            let packet = match get_packet(reader).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("incoming packet processor stopping: {e}");
                    break;
                }
            };
            if let Err(e) = self.dispatch_incoming(packet, connection, tlp_table).await {
                log::debug!("incoming packet processor stopping: {e}");
                break;
            }
        }
        self.notify_outgoing_of_disconnect(connection);
        Ok(())
    }

    async fn dispatch_incoming(
        &self,
        packet: Packet,
        connection: &CxlConnection,
        tlp_table: &Mutex<TlpTable>,
    ) -> Result<(), CxlError> {
        match packet {
            Packet::CxlIo(io) => self.dispatch_cxl_io(io, connection, tlp_table).await,
            Packet::CxlMem(mem) => match &self.component_type {
                ComponentType::UpstreamOrDevice { cxl_mem: true, .. } => {
                    send(&connection.cxl_mem_fifo.host_to_target_tx, Packet::CxlMem(mem))
                }
                _ => Err(CxlError::Protocol("cxl.mem packet on a connection with no cxl.mem FIFO".into())),
            },
            Packet::CxlCache(cache) => match &self.component_type {
                ComponentType::UpstreamOrDevice { cxl_cache: true, .. } => {
                    send(&connection.cxl_cache_fifo.host_to_target_tx, Packet::CxlCache(cache))
                }
                _ => Err(CxlError::Protocol("cxl.cache packet on a connection with no cxl.cache FIFO".into())),
            },
            Packet::Cci(msg) => send(&connection.cci_fifo.host_to_target_tx, Packet::Cci(msg)),
            Packet::Sideband(_) => Err(CxlError::Protocol("unexpected sideband packet mid-stream".into())),
        }
    }

    async fn dispatch_cxl_io(
        &self,
        io: CxlIoPacket,
        connection: &CxlConnection,
        tlp_table: &Mutex<TlpTable>,
    ) -> Result<(), CxlError> {
        if io.is_cpl() {
            let fifo_type = tlp_table.lock().await.pop(&io)?;
            let fifo = match fifo_type {
                TlpFifoType::Cfg => &connection.cfg_fifo.host_to_target_tx,
                TlpFifoType::Mmio => &connection.mmio_fifo.host_to_target_tx,
            };
            send(fifo, Packet::CxlIo(io))
        } else if io.is_cfg() {
            tlp_table.lock().await.push(&io, TlpFifoType::Cfg)?;
            send(&connection.cfg_fifo.host_to_target_tx, Packet::CxlIo(io))
        } else if io.is_mmio() {
            if !io.is_mem_write() {
                tlp_table.lock().await.push(&io, TlpFifoType::Mmio)?;
            }
            send(&connection.mmio_fifo.host_to_target_tx, Packet::CxlIo(io))
        } else {
            Err(CxlError::Protocol("unexpected CXL.io packet shape".into()))
        }
    }

    fn notify_outgoing_of_disconnect(&self, connection: &CxlConnection) {
        let _ = connection.cfg_fifo.target_to_host_tx.send(disconnect_sentinel());
        let _ = connection.mmio_fifo.target_to_host_tx.send(disconnect_sentinel());
        let _ = connection.cxl_mem_fifo.target_to_host_tx.send(disconnect_sentinel());
        let _ = connection.cxl_cache_fifo.target_to_host_tx.send(disconnect_sentinel());
        let _ = connection.cci_fifo.target_to_host_tx.send(disconnect_sentinel());
    }

    /// Drains each `host_to_target_rx` queue `run_incoming` fed and answers
    /// it through the attached responder, pushing the response onto
    /// `target_to_host_tx` for `run_outgoing_all` to write out and track.
    async fn run_responding(
        &self,
        connection: &CxlConnection,
        mut cfg_rx: mpsc::UnboundedReceiver<Packet>,
        mut mmio_rx: mpsc::UnboundedReceiver<Packet>,
        mut cci_rx: mpsc::UnboundedReceiver<Packet>,
    ) -> Result<(), CxlError> {
        let Some(responder) = self.responder.clone() else {
            let drain_cfg = async { while cfg_rx.recv().await.is_some() {} };
            let drain_mmio = async { while mmio_rx.recv().await.is_some() {} };
            let drain_cci = async { while cci_rx.recv().await.is_some() {} };
            tokio::join!(drain_cfg, drain_mmio, drain_cci);
            return Ok(());
        };

        let cfg_task = async {
            while let Some(p) = cfg_rx.recv().await {
                if is_disconnect_sentinel(&p) {
                    break;
                }
                if let Packet::CxlIo(req) = p {
                    let response = responder.handle_cfg(req).await?;
                    send(&connection.cfg_fifo.target_to_host_tx, Packet::CxlIo(response))?;
                }
            }
            Ok::<(), CxlError>(())
        };
        let mmio_task = async {
            while let Some(p) = mmio_rx.recv().await {
                if is_disconnect_sentinel(&p) {
                    break;
                }
                if let Packet::CxlIo(req) = p {
                    if let Some(response) = responder.handle_mmio(req).await? {
                        send(&connection.mmio_fifo.target_to_host_tx, Packet::CxlIo(response))?;
                    }
                }
            }
            Ok::<(), CxlError>(())
        };
        let cci_task = async {
            while let Some(p) = cci_rx.recv().await {
                if is_disconnect_sentinel(&p) {
                    break;
                }
                if let Packet::Cci(req) = p {
                    let response = responder.handle_cci(req).await;
                    send(&connection.cci_fifo.target_to_host_tx, Packet::Cci(response))?;
                }
            }
            Ok::<(), CxlError>(())
        };
        let (a, b, c) = tokio::join!(cfg_task, mmio_task, cci_task);
        a.and(b).and(c)
    }
}

fn send(tx: &mpsc::UnboundedSender<Packet>, packet: Packet) -> Result<(), CxlError> {
    tx.send(packet).map_err(|_| CxlError::Internal("FIFO receiver dropped".into()))
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<(), CxlError> {
    writer.write_all(&packet.encode()).await.map_err(CxlError::from)
}

/// Drains every outgoing FIFO class onto `writer` until each has produced
/// its disconnect sentinel, tracking cfg/mmio traffic against `tlp_table`
/// symmetrically with `PacketProcessor::dispatch_cxl_io` on the incoming
/// side. Takes ownership of the receivers (as `CxlConnection::new` leaves
/// them) since each is drained by exactly one task for the lifetime of the
/// connection.
pub async fn run_outgoing_all<W: AsyncWrite + Unpin>(
    writer: W,
    tlp_table: &Mutex<TlpTable>,
    mut cfg_rx: mpsc::UnboundedReceiver<Packet>,
    mut mmio_rx: mpsc::UnboundedReceiver<Packet>,
    mut cxl_mem_rx: Option<mpsc::UnboundedReceiver<Packet>>,
    mut cxl_cache_rx: Option<mpsc::UnboundedReceiver<Packet>>,
    mut cci_rx: mpsc::UnboundedReceiver<Packet>,
) -> Result<(), CxlError> {
    let writer = Mutex::new(writer);

    let cfg_task = async {
        while let Some(p) = cfg_rx.recv().await {
            if is_disconnect_sentinel(&p) {
                break;
            }
            tlp_table.lock().await.track_outgoing(&p, TlpFifoType::Cfg)?;
            write_packet(&mut *writer.lock().await, &p).await?;
        }
        Ok::<(), CxlError>(())
    };
    let mmio_task = async {
        while let Some(p) = mmio_rx.recv().await {
            if is_disconnect_sentinel(&p) {
                break;
            }
            tlp_table.lock().await.track_outgoing(&p, TlpFifoType::Mmio)?;
            write_packet(&mut *writer.lock().await, &p).await?;
        }
        Ok::<(), CxlError>(())
    };
    let cci_task = async {
        while let Some(p) = cci_rx.recv().await {
            if is_disconnect_sentinel(&p) {
                break;
            }
            write_packet(&mut *writer.lock().await, &p).await?;
        }
        Ok::<(), CxlError>(())
    };
    let mem_task = async {
        if let Some(rx) = cxl_mem_rx.as_mut() {
            while let Some(p) = rx.recv().await {
                if is_disconnect_sentinel(&p) {
                    break;
                }
                write_packet(&mut *writer.lock().await, &p).await?;
            }
        }
        Ok::<(), CxlError>(())
    };
    let cache_task = async {
        if let Some(rx) = cxl_cache_rx.as_mut() {
            while let Some(p) = rx.recv().await {
                if is_disconnect_sentinel(&p) {
                    break;
                }
                write_packet(&mut *writer.lock().await, &p).await?;
            }
        }
        Ok::<(), CxlError>(())
    };

    let (a, b, c, d, e) = tokio::join!(cfg_task, mmio_task, cci_task, mem_task, cache_task);
    a.and(b).and(c).and(d).and(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tlp_table_rejects_duplicate_tid() {
        let mut table = TlpTable::default();
        let req = CxlIoPacket::cfg_rd(0, 0x10, None);
        table.push(&req, TlpFifoType::Cfg).unwrap();
        assert!(table.push(&req, TlpFifoType::Cfg).is_err());
    }

    #[tokio::test]
    async fn tlp_table_pop_without_push_is_protocol_error() {
        let mut table = TlpTable::default();
        let req = CxlIoPacket::cfg_rd(0, 0x10, None);
        assert!(table.pop(&req).is_err());
    }

    #[tokio::test]
    async fn track_outgoing_pushes_requests_and_pops_matching_completions() {
        let mut table = TlpTable::default();
        let req = CxlIoPacket::cfg_rd(0x0008, 0x10, Some(0x55));
        table
            .track_outgoing(&Packet::CxlIo(req.clone()), TlpFifoType::Cfg)
            .unwrap();
        let cpl = CxlIoPacket::completion_data(0, 0x0300, 0x55, vec![0; 4], 0);
        table.track_outgoing(&Packet::CxlIo(cpl), TlpFifoType::Cfg).unwrap();
        assert!(table.pop(&req).is_err(), "the completion must already have consumed the entry");
    }
}
