//! Peer connect/disconnect notifications, serialized for the tick thread.
//!
//! The transport holds a cloneable [`LifecycleSender`] and pushes events
//! from its own threads without ever blocking. The server loop owns the
//! single [`PeerLifecycleQueue`] and drains it in arrival order at the top
//! of every tick.

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::client::ClientId;

/// A peer-level change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A peer finished connecting.
    Connected(ClientId),
    /// A peer went away.
    Disconnected {
        /// The departed peer.
        id: ClientId,
        /// Whether the peer timed out rather than closing cleanly.
        timeout: bool,
    },
}

impl LifecycleEvent {
    /// The peer the event concerns.
    pub fn client(&self) -> ClientId {
        match *self {
            Self::Connected(id) | Self::Disconnected { id, .. } => id,
        }
    }
}

/// Producer half. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct LifecycleSender {
    tx: Sender<LifecycleEvent>,
}

impl LifecycleSender {
    /// Reports a new peer.
    pub fn connected(&self, id: ClientId) {
        self.push(LifecycleEvent::Connected(id));
    }

    /// Reports a departed peer.
    pub fn disconnected(&self, id: ClientId, timeout: bool) {
        self.push(LifecycleEvent::Disconnected { id, timeout });
    }

    /// Pushes an event. Events sent after the consumer is gone are dropped.
    pub fn push(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "lifecycle consumer gone, dropping event");
        }
    }
}

/// Consumer half, owned by the server loop.
#[derive(Debug)]
pub struct PeerLifecycleQueue {
    rx: Receiver<LifecycleEvent>,
    tx: Sender<LifecycleEvent>,
}

impl PeerLifecycleQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { rx, tx }
    }

    /// Returns a producer handle for the transport.
    pub fn sender(&self) -> LifecycleSender {
        LifecycleSender {
            tx: self.tx.clone(),
        }
    }

    /// Removes and returns every queued event in arrival order.
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        self.rx.try_iter().collect()
    }

    /// Number of undrained events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no event is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for PeerLifecycleQueue {
    fn default() -> Self {
        Self::new()
    }
}
