//! Per-connection FIFO plumbing. A [`CxlConnection`] carries one
//! bidirectional [`FifoPair`] per packet class (config space, MMIO,
//! CXL.mem, CXL.cache); the packet processor on each end drains one
//! direction and fills the other.

use tokio::sync::mpsc;

use crate::packet::Packet;

/// A disconnect sentinel injected into every outgoing FIFO of a connection
/// when its incoming reader task observes EOF or a protocol error, so each
/// outgoing writer task wakes up and exits instead of blocking forever.
pub fn disconnect_sentinel() -> Packet {
    Packet::Sideband(crate::packet::sideband::SidebandPacket::disconnected())
}

pub fn is_disconnect_sentinel(packet: &Packet) -> bool {
    matches!(packet, Packet::Sideband(s) if s.is_disconnected())
}

/// One direction of packet flow, backed by an unbounded mpsc channel: a
/// FIFO never applies backpressure to the side filling it, so a consumer
/// running behind never stalls the connection's reader or writer task.
pub struct Fifo {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl Fifo {
    pub fn new() -> (mpsc::UnboundedSender<Packet>, mpsc::UnboundedReceiver<Packet>) {
        mpsc::unbounded_channel()
    }
}

/// Host-to-target and target-to-host queues for one packet class.
pub struct FifoPair {
    pub host_to_target_tx: mpsc::UnboundedSender<Packet>,
    pub host_to_target_rx: Option<mpsc::UnboundedReceiver<Packet>>,
    pub target_to_host_tx: mpsc::UnboundedSender<Packet>,
    pub target_to_host_rx: Option<mpsc::UnboundedReceiver<Packet>>,
}

impl FifoPair {
    pub fn new() -> Self {
        let (h2t_tx, h2t_rx) = Fifo::new();
        let (t2h_tx, t2h_rx) = Fifo::new();
        FifoPair {
            host_to_target_tx: h2t_tx,
            host_to_target_rx: Some(h2t_rx),
            target_to_host_tx: t2h_tx,
            target_to_host_rx: Some(t2h_rx),
        }
    }
}

impl Default for FifoPair {
    fn default() -> Self {
        Self::new()
    }
}

/// The five FIFO pairs a connection's packet processor multiplexes onto a
/// single TCP byte stream: config space, MMIO, CXL.mem, CXL.cache, CCI.
pub struct CxlConnection {
    pub cfg_fifo: FifoPair,
    pub mmio_fifo: FifoPair,
    pub cxl_mem_fifo: FifoPair,
    pub cxl_cache_fifo: FifoPair,
    pub cci_fifo: FifoPair,
}

impl CxlConnection {
    pub fn new() -> Self {
        CxlConnection {
            cfg_fifo: FifoPair::new(),
            mmio_fifo: FifoPair::new(),
            cxl_mem_fifo: FifoPair::new(),
            cxl_cache_fifo: FifoPair::new(),
            cci_fifo: FifoPair::new(),
        }
    }
}

impl Default for CxlConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_pair_delivers_in_both_directions() {
        let mut pair = FifoPair::new();
        pair.host_to_target_tx
            .send(disconnect_sentinel())
            .unwrap();
        let received = pair.host_to_target_rx.as_mut().unwrap().recv().await.unwrap();
        assert!(is_disconnect_sentinel(&received));
    }
}
