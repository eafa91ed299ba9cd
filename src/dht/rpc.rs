use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use super::node_id::NodeId;

// A reply this late counts as a miss for branching purposes, but is
// still accepted if it eventually arrives.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(1);

// A reply this late is a failure and the observer is reaped.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(15);

// One outstanding RPC. Lives in the manager's transaction map from send
// until reply, hard timeout, or abort.
#[derive(Debug, Clone)]
pub struct Observer {

    // The traversal that issued the query.
    pub traversal_id: u32,

    pub endpoint: SocketAddr,

    // Unknown (None) when querying a node we only have an endpoint for.
    pub node_id: Option<NodeId>,

    pub sent_at: Instant,

    pub short_timeout: bool,

    pub done: bool,

}

#[derive(Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Short,
    Hard,
}

#[derive(Debug)]
pub struct TimeoutEvent {

    pub traversal_id: u32,

    pub endpoint: SocketAddr,

    pub node_id: Option<NodeId>,

    pub kind: TimeoutKind,

}

// Owns the txid -> observer map. Replies are matched on (txid, source
// endpoint); anything else is dropped on the floor.
#[derive(Debug, Default)]
pub struct RpcManager {

    transactions: HashMap<u16, Observer>,

    next_txid: u16,

}

impl RpcManager {

    pub fn new() -> Self {
        Self {
            transactions: HashMap::new(),
            next_txid: rand::random(),
        }
    }

    pub fn num_outstanding(&self) -> usize {
        self.transactions.values().filter(|o| !o.done).count()
    }

    // Register an outbound query and allocate its transaction id.
    pub fn register(
        &mut self,
        traversal_id: u32,
        endpoint: SocketAddr,
        node_id: Option<NodeId>,
        now: Instant,
    ) -> u16 {
        // Linear probe past ids still in flight; with 16 bits of space
        // and bounded branch factors collisions are rare.
        let mut txid = self.next_txid;
        while self.transactions.contains_key(&txid) {
            txid = txid.wrapping_add(1);
        }
        self.next_txid = txid.wrapping_add(1);

        self.transactions.insert(txid, Observer {
            traversal_id,
            endpoint,
            node_id,
            sent_at: now,
            short_timeout: false,
            done: false,
        });
        txid
    }

    // Match an incoming reply. Returns the observer with its round-trip
    // time, or None if the txid is unknown or the source doesn't match
    // the endpoint we queried.
    pub fn incoming(&mut self, txid: u16, source: SocketAddr, now: Instant) -> Option<(Observer, Duration)> {
        match self.transactions.get(&txid) {
            Some(observer) if observer.endpoint == source => {
                let observer = self.transactions.remove(&txid).unwrap();
                let rtt = now.saturating_duration_since(observer.sent_at);
                Some((observer, rtt))
            }
            Some(observer) => {
                tracing::debug!(
                    "reply for txid {} from {} but sent to {}; dropped",
                    txid, source, observer.endpoint,
                );
                None
            }
            None => {
                tracing::trace!("reply with unknown txid {} from {}", txid, source);
                None
            }
        }
    }

    // Sweep the transaction map. Short timeouts fire once per observer
    // and leave it in place; hard timeouts reap it.
    pub fn tick(&mut self, now: Instant) -> Vec<TimeoutEvent> {
        let mut events = Vec::new();

        let expired: Vec<u16> = self
            .transactions
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.sent_at) >= HARD_TIMEOUT)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in expired {
            let observer = self.transactions.remove(&txid).unwrap();
            events.push(TimeoutEvent {
                traversal_id: observer.traversal_id,
                endpoint: observer.endpoint,
                node_id: observer.node_id,
                kind: TimeoutKind::Hard,
            });
        }

        for observer in self.transactions.values_mut() {
            if !observer.short_timeout
                && now.saturating_duration_since(observer.sent_at) >= SHORT_TIMEOUT
            {
                observer.short_timeout = true;
                events.push(TimeoutEvent {
                    traversal_id: observer.traversal_id,
                    endpoint: observer.endpoint,
                    node_id: observer.node_id,
                    kind: TimeoutKind::Short,
                });
            }
        }

        events
    }

    // Drop every observer belonging to an aborted traversal.
    pub fn abort_traversal(&mut self, traversal_id: u32) {
        self.transactions.retain(|_, o| o.traversal_id != traversal_id);
    }
}
