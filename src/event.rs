//! Fabric event bus: connection-manager and virtual-switch state changes
//! broadcast to any interested management-plane listener (the CCI
//! executor's `GetPhysicalPortState`/notification path, the JSON-RPC
//! adapter).

use tokio::sync::broadcast;

/// A physical port's connection state flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortUpdateEvent {
    pub port_id: usize,
    pub connected: bool,
}

/// A vPPB's bind state transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchUpdateEvent {
    pub vppb_id: usize,
    pub bound: bool,
}

#[derive(Debug, Clone)]
pub enum FabricEvent {
    Port(PortUpdateEvent),
    Switch(SwitchUpdateEvent),
}

/// Thin wrapper over a broadcast channel: late subscribers simply miss
/// events published before they subscribed, matching the fire-and-forget
/// semantics of the original event handler callback.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FabricEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: FabricEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(FabricEvent::Port(PortUpdateEvent {
            port_id: 1,
            connected: true,
        }));
        let event = rx.recv().await.unwrap();
        match event {
            FabricEvent::Port(p) => assert_eq!(p.port_id, 1),
            _ => panic!("wrong event variant"),
        }
    }
}
