//! RunnableComponent: the INIT -> RUNNING -> STOPPED lifecycle shared by
//! every long-lived task in the fabric (connection manager, packet
//! processors, virtual switches).

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Init,
    Running,
    Stopped,
}

/// Tracks a component's lifecycle status so other tasks can `wait_for_ready`
/// without polling. Cloning shares the same underlying watch channel.
#[derive(Clone)]
pub struct StatusTracker {
    tx: watch::Sender<ComponentStatus>,
}

impl StatusTracker {
    pub fn new() -> (Self, watch::Receiver<ComponentStatus>) {
        let (tx, rx) = watch::channel(ComponentStatus::Init);
        (StatusTracker { tx }, rx)
    }

    pub fn set(&self, status: ComponentStatus) {
        let _ = self.tx.send(status);
    }

    pub fn current(&self) -> ComponentStatus {
        *self.tx.borrow()
    }
}

/// Wait on a status receiver until the component reports
/// [`ComponentStatus::Running`].
pub async fn wait_for_ready(rx: &mut watch::Receiver<ComponentStatus>) {
    while *rx.borrow() != ComponentStatus::Running {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_ready_returns_once_running() {
        let (tracker, mut rx) = StatusTracker::new();
        let waiter = tokio::spawn(async move {
            wait_for_ready(&mut rx).await;
        });
        tracker.set(ComponentStatus::Running);
        waiter.await.unwrap();
    }
}
