//! Connection registry: one actor task owns the table of live peer sessions.
//! Everything else talks to it through `RegistryHandle`.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// What the registry keeps per live session: the way to ask it to stop.
pub struct PeerHandle {
    stop: watch::Sender<bool>,
}

impl PeerHandle {
    pub fn new(stop: watch::Sender<bool>) -> Self {
        Self { stop }
    }

    fn request_stop(&self) {
        // The peer task may already be gone; its Closed event is on the way.
        let _ = self.stop.send(true);
    }
}

pub enum RegistryEvent {
    /// A connection finished its TLS handshake. `ack` receives false if the id is already taken.
    Accepted {
        id: String,
        handle: PeerHandle,
        ack: oneshot::Sender<bool>,
    },
    /// Sent exactly once by a registered peer task after its stream is closed.
    Closed(String),
    /// Ask every session to stop; `done` fires once the table is empty.
    StopAll(oneshot::Sender<()>),
}

/// Actor state. Entries are removed only on `Closed`.
#[derive(Default)]
pub struct Registry {
    peers: HashMap<String, PeerHandle>,
    stopping: bool,
    drained: Vec<oneshot::Sender<()>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Accepted { id, handle, ack } => {
                let accepted = self.accept(id, handle);
                let _ = ack.send(accepted);
            }
            RegistryEvent::Closed(id) => {
                if self.peers.remove(&id).is_some() {
                    info!(peer = %id, live = self.peers.len(), "session closed");
                } else {
                    warn!(peer = %id, "close for unknown session");
                }
                self.notify_if_drained();
            }
            RegistryEvent::StopAll(done) => {
                info!(live = self.peers.len(), "stopping all sessions");
                self.stopping = true;
                for handle in self.peers.values() {
                    handle.request_stop();
                }
                self.drained.push(done);
                self.notify_if_drained();
            }
        }
    }

    fn accept(&mut self, id: String, handle: PeerHandle) -> bool {
        if self.peers.contains_key(&id) {
            warn!(peer = %id, "rejecting duplicate session id");
            return false;
        }
        if self.stopping {
            handle.request_stop();
        }
        debug!(peer = %id, "session registered");
        self.peers.insert(id, handle);
        true
    }

    fn notify_if_drained(&mut self) {
        if self.stopping && self.peers.is_empty() {
            for done in self.drained.drain(..) {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
impl Registry {
    fn len(&self) -> usize {
        self.peers.len()
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }
}

/// Cloneable sender side of the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl RegistryHandle {
    /// Register a session. False if the id is taken or the registry is gone.
    pub async fn register(&self, id: String, stop: watch::Sender<bool>) -> bool {
        let (ack, rx) = oneshot::channel();
        let event = RegistryEvent::Accepted {
            id,
            handle: PeerHandle::new(stop),
            ack,
        };
        if self.tx.send(event).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn closed(&self, id: String) {
        let _ = self.tx.send(RegistryEvent::Closed(id));
    }

    /// Stop every session and wait until all of them reported closure.
    pub async fn stop_all(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(RegistryEvent::StopAll(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the actor. It runs until every handle is dropped.
pub fn spawn() -> RegistryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut registry = Registry::new();
        while let Some(event) = rx.recv().await {
            registry.handle(event);
        }
        debug!("registry stopped");
    });
    RegistryHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(registry: &mut Registry, id: &str) -> (bool, watch::Receiver<bool>) {
        let (stop, stop_rx) = watch::channel(false);
        let (ack, mut ack_rx) = oneshot::channel();
        registry.handle(RegistryEvent::Accepted {
            id: id.to_string(),
            handle: PeerHandle::new(stop),
            ack,
        });
        (ack_rx.try_recv().unwrap(), stop_rx)
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut registry = Registry::new();
        let (first, _a) = accepted(&mut registry, "10.0.0.1:4000");
        let (second, _b) = accepted(&mut registry, "10.0.0.1:4000");
        assert!(first);
        assert!(!second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_all_signals_but_keeps_entries_until_closed() {
        let mut registry = Registry::new();
        let (_, a) = accepted(&mut registry, "a");
        let (_, b) = accepted(&mut registry, "b");
        let (done, mut done_rx) = oneshot::channel();
        registry.handle(RegistryEvent::StopAll(done));
        assert!(*a.borrow());
        assert!(*b.borrow());
        assert_eq!(registry.len(), 2);
        assert!(done_rx.try_recv().is_err());

        registry.handle(RegistryEvent::Closed("a".into()));
        assert!(done_rx.try_recv().is_err());
        registry.handle(RegistryEvent::Closed("b".into()));
        assert!(registry.is_empty());
        assert!(done_rx.try_recv().is_ok());
    }

    #[test]
    fn stop_all_on_empty_table_finishes_at_once() {
        let mut registry = Registry::new();
        let (done, mut done_rx) = oneshot::channel();
        registry.handle(RegistryEvent::StopAll(done));
        assert!(done_rx.try_recv().is_ok());
    }

    #[test]
    fn late_arrival_during_shutdown_is_stopped() {
        let mut registry = Registry::new();
        let (_, first) = accepted(&mut registry, "a");
        let (done, _done_rx) = oneshot::channel();
        registry.handle(RegistryEvent::StopAll(done));
        assert!(*first.borrow());
        let (ok, late) = accepted(&mut registry, "b");
        assert!(ok);
        assert!(*late.borrow());
    }

    #[test]
    fn close_of_unknown_id_is_harmless() {
        let mut registry = Registry::new();
        let (_, _a) = accepted(&mut registry, "a");
        registry.handle(RegistryEvent::Closed("zzz".into()));
        assert!(registry.contains("a"));
    }

    #[tokio::test]
    async fn actor_round_trip() {
        let registry = spawn();
        let (stop, mut stop_rx) = watch::channel(false);
        assert!(registry.register("peer".into(), stop).await);
        let (dup, _dup_rx) = watch::channel(false);
        assert!(!registry.register("peer".into(), dup).await);

        let closer = registry.clone();
        let peer = tokio::spawn(async move {
            stop_rx.changed().await.unwrap();
            closer.closed("peer".into());
        });
        registry.stop_all().await;
        peer.await.unwrap();
    }
}
