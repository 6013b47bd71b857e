//! Dispatch policy: who receives a given inbound message.
//!
//! The policy is a strategy seam between the broker loop and the registry so
//! richer routing (direct messages, rooms) can be dropped in without touching
//! loop mechanics.

use crate::message::{ConnectionId, Message};
use crate::registry::Registry;

/// Decides the fan-out targets for one message.
pub trait RoutePolicy: Send + Sync {
    /// Compute the ordered recipient set for `message`.
    ///
    /// The sender must never appear in the output.
    fn route(&self, registry: &Registry, message: &Message) -> Vec<ConnectionId>;

    /// Policy name, for logging.
    fn name(&self) -> &'static str;
}

/// Broadcast to every registered peer except the sender.
///
/// Broker-originated messages (no sender) go to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastPolicy;

impl RoutePolicy for BroadcastPolicy {
    fn route(&self, registry: &Registry, message: &Message) -> Vec<ConnectionId> {
        match message.sender {
            Some(sender) => registry.all_except(sender),
            None => registry.ids(),
        }
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn seeded_registry(n: usize) -> (Registry, Vec<ConnectionId>) {
        let registry = Registry::new();
        let ids = (0..n)
            .map(|i| {
                let (tx, rx) = mpsc::unbounded_channel();
                // Receivers leak into the test; keeping them alive is enough here.
                std::mem::forget(rx);
                registry.add(Some(format!("peer{i}")), tx).unwrap()
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let (registry, ids) = seeded_registry(3);
        let policy = BroadcastPolicy;

        for &sender in &ids {
            let msg = Message::chat(sender, "s", Bytes::from_static(b"m"));
            let targets = policy.route(&registry, &msg);
            assert_eq!(targets.len(), 2);
            assert!(!targets.contains(&sender));
        }
    }

    #[test]
    fn test_broadcast_notice_reaches_everyone() {
        let (registry, ids) = seeded_registry(3);
        let msg = Message::notice(MessageKind::PeerLeft, "ghost");

        assert_eq!(BroadcastPolicy.route(&registry, &msg), ids);
    }

    #[test]
    fn test_route_order_is_stable() {
        let (registry, ids) = seeded_registry(4);
        let msg = Message::chat(ids[3], "s", Bytes::from_static(b"m"));

        let first = BroadcastPolicy.route(&registry, &msg);
        let second = BroadcastPolicy.route(&registry, &msg);
        assert_eq!(first, second);
        assert_eq!(first, vec![ids[0], ids[1], ids[2]]);
    }
}
