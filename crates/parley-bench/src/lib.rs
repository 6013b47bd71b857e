//! Shared helpers for Parley benchmarks and load tools.

use parley_core::{Broker, ConnectionId, Message};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A broker seeded with `n` connected peers, plus their delivery queues.
pub struct SeededBroker {
    /// The broker under test.
    pub broker: Broker,
    /// Ids of the seeded peers, in join order.
    pub ids: Vec<ConnectionId>,
    /// Each peer's delivery queue.
    pub inboxes: Vec<mpsc::UnboundedReceiver<Arc<Message>>>,
}

/// Build a broker with `n` registered peers.
#[must_use]
pub fn seed_broker(n: usize) -> SeededBroker {
    let broker = Broker::new();
    let mut ids = Vec::with_capacity(n);
    let mut inboxes = Vec::with_capacity(n);

    for i in 0..n {
        let (id, rx) = broker.join(format!("peer{i}")).expect("seed under limit");
        ids.push(id);
        inboxes.push(rx);
    }

    SeededBroker {
        broker,
        ids,
        inboxes,
    }
}

/// Drain every queued delivery, returning how many there were.
pub fn drain_inboxes(seeded: &mut SeededBroker) -> usize {
    let mut total = 0;
    for rx in &mut seeded.inboxes {
        while rx.try_recv().is_ok() {
            total += 1;
        }
    }
    total
}
