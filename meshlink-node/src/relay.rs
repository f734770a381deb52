//! Relay engine.
//!
//! Routes `@target text` commands: local mesh first, then peer stations,
//! then the persistent queue when the target is known but unreachable. Every
//! outcome is reported back to the sender over the mesh.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use localtime::LocalTime;

use crate::mesh::Outbound;
use crate::queue::{Enqueue, Enqueued, Error as QueueError, Queue};
use crate::registry::{self, Node};
use crate::{discovery, p2p, NodeId};

/// Time-to-live of store-and-forward relays.
const RELAY_TTL_SECS: u64 = 24 * 60 * 60;
/// Delivery attempts before a queued relay is abandoned.
const RELAY_MAX_ATTEMPTS: u32 = 10;

/// The relay engine. Borrows the registry and transport; owns nothing but
/// its wiring.
pub struct Engine {
    registry: registry::Shared,
    outbound: Arc<dyn Outbound>,
    queue: Queue,
    discovery: Arc<discovery::Client>,
    p2p: Arc<p2p::Manager>,
    /// Our radio's node number; zero until the device reports it.
    my_node: Arc<AtomicU32>,
}

impl Engine {
    pub fn new(
        registry: registry::Shared,
        outbound: Arc<dyn Outbound>,
        queue: Queue,
        discovery: Arc<discovery::Client>,
        p2p: Arc<p2p::Manager>,
        my_node: Arc<AtomicU32>,
    ) -> Self {
        Self {
            registry,
            outbound,
            queue,
            discovery,
            p2p,
            my_node,
        }
    }

    /// Handle a relay command heard on the mesh.
    pub fn handle_relay(&self, from: NodeId, target: &str, text: &str, now: LocalTime) {
        let me = self.my_node.load(Ordering::SeqCst);

        // Guard against echo loops: never relay our own traffic, and never
        // relay back to ourselves.
        if me != 0 && from == me {
            log::info!(target: "relay", "Ignoring relay from our own node {from}");
            return;
        }
        let Some(found) = self.registry.find_best(target, now) else {
            log::info!(target: "relay", "No match for target `{target}`");
            self.notify(from, &format!("❌ Relay failed: Target \"{target}\" not found"));
            return;
        };
        if me != 0 && found.node.num() == me {
            log::info!(target: "relay", "Ignoring relay addressed to our own node");
            return;
        }

        log::debug!(
            target: "relay",
            "Matched `{target}` to {} ({}) at {}% ({:?})",
            found.node.name(),
            found.node.num(),
            found.score,
            found.kind
        );
        match found.node {
            Node::Local(node) => {
                if found.online {
                    self.relay_local(from, &node, found.score, text);
                } else {
                    log::info!(
                        target: "relay",
                        "Local target {} ({}) is offline; queueing",
                        node.name(),
                        node.num
                    );
                    self.enqueue(from, node.num, &node.name(), None, text, now);
                }
            }
            Node::Remote(node) => self.relay_remote(from, &node, text, now),
        }
    }

    /// Deliver to a local mesh node and confirm to the sender.
    fn relay_local(&self, from: NodeId, node: &registry::LocalNode, score: u32, text: &str) {
        let sender = self
            .registry
            .node(from)
            .map(|n| n.name())
            .unwrap_or_else(|| from.to_string());
        let composed = format!("[From {from} ({sender})]: {text}");

        match self.outbound.send_text(&composed, node.num) {
            Ok(()) => {
                self.notify(
                    from,
                    &format!(
                        "✅ Message relayed to {} ({}) 🟢 [{score}% match]",
                        node.name(),
                        node.num
                    ),
                );
            }
            Err(e) => {
                log::error!(target: "relay", "Send to {} failed: {e}", node.num);
                self.notify(from, &format!("❌ Relay failed: {e}"));
            }
        }
    }

    /// Hand off to the peer station the target lives behind, or queue if the
    /// station is not reachable right now.
    fn relay_remote(&self, from: NodeId, node: &registry::RemoteNode, text: &str, now: LocalTime) {
        let Some(peer) = self.discovery.active_peer(&node.station_id) else {
            log::info!(
                target: "relay",
                "Station `{}` not in the active peer set; queueing",
                node.station_id
            );
            self.enqueue(
                from,
                node.num,
                &node.display_name,
                Some(node.station_id.clone()),
                text,
                now,
            );
            return;
        };
        match self.p2p.send_relay(&peer, from, node.num, text, now) {
            Ok(()) => {
                self.notify(
                    from,
                    &format!("✅ Message relayed to remote target \"{}\"", node.display_name),
                );
            }
            Err(e) => {
                log::warn!(
                    target: "relay",
                    "Relay to station `{}` failed: {e}; queueing",
                    node.station_id
                );
                self.enqueue(
                    from,
                    node.num,
                    &node.display_name,
                    Some(node.station_id.clone()),
                    text,
                    now,
                );
            }
        }
    }

    /// Store a message for delayed delivery and tell the sender.
    fn enqueue(
        &self,
        from: NodeId,
        to: NodeId,
        target_name: &str,
        target_station: Option<String>,
        text: &str,
        now: LocalTime,
    ) {
        let options = Enqueue {
            target_station,
            ttl: RELAY_TTL_SECS,
            max_attempts: RELAY_MAX_ATTEMPTS,
            ..Enqueue::default()
        };
        match self.queue.enqueue(from, to, text, options, now) {
            Ok(Enqueued::Queued(id)) => {
                log::info!(target: "relay", "Queued message {id} for {target_name}");
                self.notify(
                    from,
                    &format!("📥 {target_name} is unreachable right now; your message was queued"),
                );
            }
            Ok(Enqueued::Duplicate) => {
                log::debug!(target: "relay", "Duplicate message for {target_name} ignored");
                self.notify(from, &format!("📥 That message is already queued for {target_name}"));
            }
            Err(QueueError::QueueFull(n)) => {
                log::warn!(target: "relay", "Queue full at {n} messages");
                self.notify(from, "⚠️ Message queue is full, try again later");
            }
            Err(e) => {
                log::error!(target: "relay", "Enqueue failed: {e}");
                self.notify(from, "❌ Relay failed: could not queue your message");
            }
        }
    }

    /// Best-effort status report to the sender. A failed confirmation is
    /// logged, never escalated.
    fn notify(&self, to: NodeId, text: &str) {
        if let Err(e) = self.outbound.send_text(text, to) {
            log::warn!(target: "relay", "Confirmation to {to} failed: {e}");
        }
    }
}
