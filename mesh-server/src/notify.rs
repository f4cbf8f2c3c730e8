//! C6 — notifier hub: tells connected agents "your config changed, go
//! pull it" over a long-lived websocket, the way the teacher's server
//! pushes config refreshes to `innernet` clients after a peer/cidr
//! mutation, generalized from its polling model to a push channel.
//!
//! Grounded on the gateway-style websocket registry pattern used for
//! session fan-out in the pack (a `DashMap` keyed by connection identity,
//! each entry holding a bounded `mpsc::Sender`): see
//! `NerfedChou-Quantum-Chain/crates/qc-16-api-gateway`'s connection
//! registry and ping/pump task.

use dashmap::DashMap;
use mesh_core::{NetworkId, PeerId};
use tokio::sync::mpsc;

/// A single event delivered to a connected agent: its config changed and
/// it should re-pull (spec.md §4.6). No payload beyond the fact of
/// change — the agent fetches the authoritative config over the regular
/// pull endpoint, avoiding any risk of the push channel and the pulled
/// state diverging.
#[derive(Clone, Copy, Debug)]
pub struct RefreshEvent;

/// Bounded per-connection queue depth. A slow or wedged agent drops its
/// oldest pending refresh rather than blocking the notifier or growing
/// without bound (spec.md §4.6 "best-effort, oldest-drop").
const CHANNEL_CAPACITY: usize = 16;

/// Registry of live agent connections, keyed by `(network, peer)`. One
/// process-wide instance lives in `Context` and is shared by the
/// websocket handler (which registers/unregisters on connect/disconnect)
/// and the orchestration service (which notifies after a mutation).
#[derive(Default)]
pub struct Hub {
    channels: DashMap<(NetworkId, PeerId), mpsc::Sender<RefreshEvent>>,
}

impl Hub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Registers a new connection, returning the receiving end of its
    /// bounded channel. Replaces any previous connection for the same
    /// peer (a reconnect supersedes the stale one; spec.md §4.6 "at most
    /// one active channel per peer").
    pub fn register(&self, network_id: NetworkId, peer_id: PeerId) -> mpsc::Receiver<RefreshEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.channels.insert((network_id, peer_id), tx);
        rx
    }

    /// Removes a connection. Idempotent: unregistering a peer that is no
    /// longer (or never was) registered is a no-op.
    pub fn unregister(&self, network_id: &NetworkId, peer_id: &PeerId) {
        self.channels.remove(&(network_id.clone(), peer_id.clone()));
    }

    /// Pushes a refresh event to the given peer if it is connected. A
    /// full queue drops the new event rather than blocking — the agent
    /// will still see the change on its next scheduled pull, so a
    /// dropped push notification is never a correctness issue, only a
    /// latency one.
    pub fn notify(&self, network_id: &NetworkId, peer_id: &PeerId) {
        if let Some(tx) = self.channels.get(&(network_id.clone(), peer_id.clone())) {
            let _ = tx.try_send(RefreshEvent);
        }
    }

    /// Notifies every peer currently connected for a network — used after
    /// a network-wide mutation like a cidr change or a policy edit that
    /// can affect everyone's generated config (spec.md §4.4).
    pub fn notify_network(&self, network_id: &NetworkId) {
        for entry in self.channels.iter() {
            let (net, _peer) = entry.key();
            if net == network_id {
                let _ = entry.value().try_send(RefreshEvent);
            }
        }
    }

    pub fn is_connected(&self, network_id: &NetworkId, peer_id: &PeerId) -> bool {
        self.channels.contains_key(&(network_id.clone(), peer_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (NetworkId, PeerId) {
        (NetworkId::new(), PeerId::new())
    }

    #[tokio::test]
    async fn notify_delivers_to_registered_peer() {
        let hub = Hub::new();
        let (network_id, peer_id) = ids();
        let mut rx = hub.register(network_id.clone(), peer_id.clone());

        assert!(hub.is_connected(&network_id, &peer_id));
        hub.notify(&network_id, &peer_id);

        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn notify_is_a_noop_for_unregistered_peer() {
        let hub = Hub::new();
        let (network_id, peer_id) = ids();
        // No register() call; notify must not panic or block.
        hub.notify(&network_id, &peer_id);
        assert!(!hub.is_connected(&network_id, &peer_id));
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = Hub::new();
        let (network_id, peer_id) = ids();
        let _rx = hub.register(network_id.clone(), peer_id.clone());
        hub.unregister(&network_id, &peer_id);
        assert!(!hub.is_connected(&network_id, &peer_id));
    }

    #[tokio::test]
    async fn full_queue_drops_newest_rather_than_blocking() {
        let hub = Hub::new();
        let (network_id, peer_id) = ids();
        let _rx = hub.register(network_id.clone(), peer_id.clone());
        for _ in 0..(CHANNEL_CAPACITY + 5) {
            hub.notify(&network_id, &peer_id);
        }
        // try_send never blocks regardless of how many notifies overflow the queue.
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_channel() {
        let hub = Hub::new();
        let (network_id, peer_id) = ids();
        let mut first = hub.register(network_id.clone(), peer_id.clone());
        let mut second = hub.register(network_id.clone(), peer_id.clone());

        hub.notify(&network_id, &peer_id);
        assert!(second.recv().await.is_some());
        // The superseded receiver's sender was dropped, so its channel closes.
        assert!(first.recv().await.is_none());
    }
}
