//! The mesh-inbound service.
//!
//! Single consumer of everything that happens to the station: decoded radio
//! output, peer set changes from discovery, and relays arriving from peer
//! stations. Dispatches text packets through the command grammar and keeps
//! the registry current. Handlers never block this loop on the network; the
//! slow legs (queueing, p2p dials) live behind their own components.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::{thread, time};

use crossbeam_channel as chan;
use localtime::LocalTime;

use crate::mesh::{self, proto, Envelope, Outbound};
use crate::parser::Command;
use crate::queue::Queue;
use crate::registry::{self, Node};
use crate::relay;
use crate::{discovery, p2p, NodeId};

/// How long to wait for the device to report its identity before starting
/// discovery anyway.
pub const BRIDGE_FALLBACK: time::Duration = time::Duration::from_secs(2);
/// Delay before logging the node inventory after device configuration.
const NODES_REPORT_DELAY: time::Duration = time::Duration::from_secs(3);

/// Why the service loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Shutdown was requested.
    Shutdown,
    /// The mesh stream closed underneath us; the runtime may reopen the
    /// port and run the service again.
    MeshClosed,
}

/// The station service.
pub struct Service {
    display_name: String,
    registry: registry::Shared,
    outbound: Arc<dyn Outbound>,
    /// Transport handle for device-level requests (reconfigure on reboot).
    /// Absent under test, where there is no device.
    transport: Option<mesh::Sender>,
    relay: relay::Engine,
    queue: Queue,
    discovery: Arc<discovery::Client>,
    p2p: Arc<p2p::Manager>,
    /// Our radio's node number; zero until the device reports it.
    my_node: Arc<AtomicU32>,
    /// Set once the bridge (discovery et al.) has been started, either by
    /// the device reporting its identity or by the fallback timer.
    bridge_initialized: AtomicBool,
    /// Signalled to release the discovery loops.
    start_discovery: Vec<chan::Sender<()>>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        display_name: String,
        registry: registry::Shared,
        outbound: Arc<dyn Outbound>,
        transport: Option<mesh::Sender>,
        relay: relay::Engine,
        queue: Queue,
        discovery: Arc<discovery::Client>,
        p2p: Arc<p2p::Manager>,
        my_node: Arc<AtomicU32>,
        start_discovery: Vec<chan::Sender<()>>,
    ) -> Self {
        Self {
            display_name,
            registry,
            outbound,
            transport,
            relay,
            queue,
            discovery,
            p2p,
            my_node,
            bridge_initialized: AtomicBool::new(false),
            start_discovery,
        }
    }

    /// Consume events until shutdown or until the mesh stream closes.
    pub fn run(
        &self,
        mesh: chan::Receiver<Envelope>,
        peers: chan::Receiver<discovery::Event>,
        remote: chan::Receiver<p2p::Inbound>,
        shutdown: chan::Receiver<()>,
    ) -> Exit {
        let fallback = chan::after(BRIDGE_FALLBACK);

        loop {
            chan::select! {
                recv(mesh) -> envelope => match envelope {
                    Ok(envelope) => {
                        if !self.handle_mesh(envelope, LocalTime::now()) {
                            return Exit::MeshClosed;
                        }
                    }
                    Err(_) => return Exit::MeshClosed,
                },
                // The peer and inbound senders live as long as the runtime;
                // either channel closing means we are shutting down.
                recv(peers) -> event => match event {
                    Ok(event) => self.handle_peer(event, LocalTime::now()),
                    Err(_) => return Exit::Shutdown,
                },
                recv(remote) -> inbound => match inbound {
                    Ok(inbound) => self.handle_remote(inbound, LocalTime::now()),
                    Err(_) => return Exit::Shutdown,
                },
                recv(fallback) -> _ => {
                    self.init_bridge("device identity still pending");
                }
                recv(shutdown) -> _ => return Exit::Shutdown,
            }
        }
    }

    /// Returns `false` when the stream is over.
    fn handle_mesh(&self, envelope: Envelope, now: LocalTime) -> bool {
        match envelope {
            Envelope::MyNodeInfo(num) => {
                match self
                    .my_node
                    .compare_exchange(0, num, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        log::info!(target: "node", "Our radio is node {num}");
                        self.init_bridge("device reported identity");
                    }
                    Err(previous) if previous != num => {
                        log::warn!(
                            target: "node",
                            "Device node number changed from {previous} to {num}; keeping {previous}"
                        );
                    }
                    Err(_) => {}
                }
            }
            Envelope::NodeInfo(info) => {
                log::debug!(
                    target: "registry",
                    "Node {} ({})",
                    info.num,
                    info.user.as_ref().map(|u| u.long_name.as_str()).unwrap_or("?")
                );
                self.registry.add_or_update_local(&info, now);
            }
            Envelope::Packet(packet) => self.handle_packet(packet, now),
            Envelope::Configured(id) => {
                log::info!(target: "node", "Device configuration complete (id {id})");
                self.schedule_nodes_report();
            }
            Envelope::Rebooted => {
                log::warn!(target: "node", "Device rebooted; requesting configuration again");
                if let Some(transport) = &self.transport {
                    if let Err(e) = transport.configure() {
                        log::error!(target: "node", "Reconfigure failed: {e}");
                    }
                }
            }
            Envelope::Disconnected(reason) => {
                log::error!(target: "node", "Mesh stream closed: {reason}");
                return false;
            }
        }
        true
    }

    fn handle_packet(&self, packet: proto::MeshPacket, now: LocalTime) {
        let me = self.my_node.load(Ordering::SeqCst);
        if me != 0 && packet.from == me {
            return;
        }
        self.registry.observe(packet.from, now);

        let Some(text) = packet.text() else {
            return;
        };
        let direct = me != 0 && packet.to == me;
        let addressed = direct || packet.to == proto::BROADCAST_ADDR;

        match Command::parse(text) {
            Command::Relay { target, text } => {
                self.relay.handle_relay(packet.from, &target, &text, now);
            }
            Command::Status if addressed => self.send_status(packet.from, now),
            Command::ListNodes if addressed => self.send_nodes(packet.from, now),
            Command::Instructions if addressed => self.send_instructions(packet.from),
            // Echo only answers traffic addressed to us; echoing channel
            // chatter would have two stations answer each other forever.
            Command::Echo if direct => {
                self.reply(packet.from, &format!("Echo: {text}"));
            }
            _ => {}
        }
    }

    fn handle_peer(&self, event: discovery::Event, now: LocalTime) {
        match event {
            discovery::Event::Discovered(peer) => {
                let short = short_name(&peer.station_id);
                let num =
                    self.registry
                        .add_remote(&peer.station_id, &peer.station_id, &short, now);
                log::info!(
                    target: "registry",
                    "Station `{}` reachable as remote node {num}",
                    peer.station_id
                );
            }
            discovery::Event::Lost(station_id) => {
                let removed = self.registry.remove_station(&station_id);
                if removed > 0 {
                    log::info!(
                        target: "registry",
                        "Station `{station_id}` lost; removed {removed} remote node(s)"
                    );
                }
            }
        }
    }

    /// A relay arriving from a peer station, already decrypted.
    fn handle_remote(&self, inbound: p2p::Inbound, now: LocalTime) {
        log::info!(
            target: "relay",
            "Relay from node {} via `{}`",
            inbound.from_node,
            inbound.station_id
        );
        let text = format!(
            "[From {}@{}]: {}",
            inbound.from_node, inbound.station_id, inbound.text
        );
        // Deliver directly when the addressed node is one of ours and
        // online; otherwise put it on the air for everyone.
        let to = match self.registry.node(inbound.target_node) {
            Some(Node::Local(node)) if self.registry.is_online(node.num, now) => node.num,
            _ => proto::BROADCAST_ADDR,
        };
        if let Err(e) = self.outbound.send_text(&text, to) {
            log::error!(target: "relay", "Failed to deliver remote relay: {e}");
        }
    }

    /// Start discovery and the rest of the bridge, exactly once.
    fn init_bridge(&self, reason: &str) {
        if self
            .bridge_initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        log::info!(target: "node", "Initializing bridge ({reason})..");
        for start in &self.start_discovery {
            start.send(()).ok();
        }
    }

    fn send_status(&self, to: NodeId, now: LocalTime) {
        let (local, remote) = self.registry.counts();
        let online = self.registry.online_nodes(now).len();
        let peers = self.discovery.peers().len();
        let stats = self.queue.stats().unwrap_or_default();
        let sessions = self.p2p.active();

        self.reply(
            to,
            &format!(
                "📊 {}: {online}/{local} mesh nodes online, {remote} remote, \
                 {peers} peer station(s), {sessions} active link(s), {} queued",
                self.display_name,
                stats.undelivered()
            ),
        );
    }

    fn send_nodes(&self, to: NodeId, now: LocalTime) {
        let nodes = self.registry.all_nodes();
        if nodes.is_empty() {
            self.reply(to, "📋 No nodes known yet");
            return;
        }
        let mut entries = Vec::with_capacity(nodes.len());
        for node in nodes {
            let marker = match &node {
                Node::Remote(_) => "🌐",
                Node::Local(n) if self.registry.is_online(n.num, now) => "🟢",
                Node::Local(_) => "🔴",
            };
            entries.push(format!("{} ({}) {marker}", node.name(), node.num()));
        }
        self.reply(to, &format!("📋 Nodes: {}", entries.join(", ")));
    }

    fn send_instructions(&self, to: NodeId) {
        self.reply(
            to,
            "📖 Commands: @<node> <text> relays a message (local or remote), \
             `nodes` lists known nodes, `status` reports station health, \
             `help` shows this text",
        );
    }

    fn reply(&self, to: NodeId, text: &str) {
        if let Err(e) = self.outbound.send_text(text, to) {
            log::warn!(target: "node", "Reply to {to} failed: {e}");
        }
    }

    /// Log the node inventory shortly after configuration, once the device
    /// has had a moment to stream stragglers.
    fn schedule_nodes_report(&self) {
        let registry = self.registry.clone();
        thread::Builder::new()
            .name(String::from("nodes-report"))
            .spawn(move || {
                thread::sleep(NODES_REPORT_DELAY);
                let now = LocalTime::now();
                let online = registry.online_nodes(now);
                let (local, remote) = registry.counts();
                log::info!(
                    target: "node",
                    "Available nodes: {} online of {local} local, {remote} remote",
                    online.len()
                );
            })
            .ok();
    }
}

fn short_name(station_id: &str) -> String {
    station_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::crypto::{seal::ContactInfo, KeyPair};
    use crate::mesh::test::MemorySink;
    use crate::queue::Status;

    struct Fixture {
        service: Service,
        sink: Arc<MemorySink>,
        registry: registry::Shared,
        queue: Queue,
        start_rx: chan::Receiver<()>,
        now: LocalTime,
    }

    fn text_packet(from: NodeId, to: NodeId, text: &str) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            to,
            channel: 0,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                want_response: false,
            })),
            id: 0,
            rx_time: 0,
            hop_limit: 3,
            want_ack: false,
        }
    }

    fn node_info(num: NodeId, long: &str, short: &str) -> proto::NodeInfo {
        proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: format!("!{num:08x}"),
                long_name: long.to_owned(),
                short_name: short.to_owned(),
            }),
            position: None,
            last_heard: 0,
        }
    }

    fn fixture() -> Fixture {
        struct NoPeers;
        impl p2p::PeerDirectory for NoPeers {
            fn peer(&self, _station_id: &str) -> Option<discovery::PeerRecord> {
                None
            }
        }

        let now = LocalTime::from_millis(1_700_000_000_000);
        let kp = KeyPair::from_seed(21);
        let registry = registry::Shared::new();
        let sink = MemorySink::new();
        let queue = Queue::memory().unwrap();
        let (events_tx, _events_rx) = chan::unbounded();
        let (inbound_tx, _inbound_rx) = chan::unbounded();
        let (start_tx, start_rx) = chan::bounded(1);

        let discovery = Arc::new(discovery::Client::new(
            "this-station".parse().unwrap(),
            ContactInfo {
                ip: "127.0.0.1".to_owned(),
                port: 8447,
                public_key: kp.public,
                last_seen: 0,
            },
            String::from("sealed"),
            kp.public,
            Box::new(discovery::SimulatedRendezvous),
            events_tx,
        ));
        let p2p = p2p::Manager::new(
            "this-station".parse().unwrap(),
            kp.secret.clone(),
            String::from("shared"),
            10,
            time::Duration::from_secs(1),
            Arc::new(NoPeers),
            inbound_tx,
        );
        let my_node = Arc::new(AtomicU32::new(0));
        let relay = relay::Engine::new(
            registry.clone(),
            sink.clone(),
            queue.clone(),
            discovery.clone(),
            p2p.clone(),
            my_node.clone(),
        );
        let service = Service::new(
            "Test Station".to_owned(),
            registry.clone(),
            sink.clone(),
            None,
            relay,
            queue.clone(),
            discovery,
            p2p,
            my_node,
            vec![start_tx],
        );

        Fixture {
            service,
            sink,
            registry,
            queue,
            start_rx,
            now,
        }
    }

    /// Feed identity and a couple of nodes, like the device does at startup.
    fn boot(f: &Fixture) {
        f.service.handle_mesh(Envelope::MyNodeInfo(100), f.now);
        f.service
            .handle_mesh(Envelope::NodeInfo(node_info(101, "Alice Base", "ALCE")), f.now);
        f.service
            .handle_mesh(Envelope::NodeInfo(node_info(102, "Bob Mobile", "BOB")), f.now);
    }

    #[test]
    fn test_my_node_info_starts_bridge_once() {
        let f = fixture();
        f.service.handle_mesh(Envelope::MyNodeInfo(100), f.now);

        assert!(f.start_rx.try_recv().is_ok());
        assert_eq!(
            f.service.my_node.load(Ordering::SeqCst),
            100
        );

        // A second report must not double-initialize.
        f.service.handle_mesh(Envelope::MyNodeInfo(100), f.now);
        assert!(f.start_rx.try_recv().is_err());
    }

    #[test]
    fn test_fallback_init_does_not_double_start() {
        let f = fixture();
        f.service.init_bridge("fallback");
        assert!(f.start_rx.try_recv().is_ok());

        // Identity arriving during the fallback window must not re-start.
        f.service.handle_mesh(Envelope::MyNodeInfo(100), f.now);
        assert!(f.start_rx.try_recv().is_err());
        assert_eq!(f.service.my_node.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_local_relay_end_to_end() {
        let f = fixture();
        boot(&f);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "@bob Hello Bob")), f.now);

        assert_eq!(f.sink.sent_to(102), vec!["[From 200 (200)]: Hello Bob"]);
        let confirmations = f.sink.sent_to(200);
        assert_eq!(confirmations.len(), 1);
        assert!(confirmations[0].starts_with("✅ Message relayed to Bob Mobile (102)"));
    }

    #[test]
    fn test_unknown_target_reports_not_found() {
        let f = fixture();
        boot(&f);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "@ghost hi")), f.now);

        assert_eq!(
            f.sink.sent_to(200),
            vec!["❌ Relay failed: Target \"ghost\" not found"]
        );
        assert_eq!(f.queue.stats().unwrap().undelivered(), 0);
    }

    #[test]
    fn test_own_packets_are_ignored() {
        let f = fixture();
        boot(&f);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(100, 102, "@bob loop")), f.now);
        assert!(f.sink.sent().is_empty());
    }

    #[test]
    fn test_packet_bumps_freshness() {
        let f = fixture();
        boot(&f);
        let later = f.now + localtime::LocalDuration::from_mins(10);

        assert!(!f.registry.is_online(200, later));
        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "anything")), later);
        assert!(f.registry.is_online(200, later));
    }

    #[test]
    fn test_status_command() {
        let f = fixture();
        boot(&f);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "status")), f.now);

        let replies = f.sink.sent_to(200);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("📊 Test Station:"));
        assert!(replies[0].contains("mesh nodes online"));
    }

    #[test]
    fn test_nodes_command_lists_markers() {
        let f = fixture();
        boot(&f);
        f.registry
            .add_remote("mountain-top", "mountain-top", "MOUN", f.now);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, proto::BROADCAST_ADDR, "nodes")), f.now);

        let replies = f.sink.sent_to(200);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("Alice Base (101) 🟢"));
        assert!(replies[0].contains("mountain-top (5000) 🌐"));
    }

    #[test]
    fn test_echo_only_answers_direct_messages() {
        let f = fixture();
        boot(&f);

        f.service.handle_mesh(
            Envelope::Packet(text_packet(200, proto::BROADCAST_ADDR, "just chatting")),
            f.now,
        );
        assert!(f.sink.sent().is_empty());

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "just chatting")), f.now);
        assert_eq!(f.sink.sent_to(200), vec!["Echo: just chatting"]);
    }

    #[test]
    fn test_help_command() {
        let f = fixture();
        boot(&f);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "help")), f.now);
        assert!(f.sink.sent_to(200)[0].starts_with("📖 Commands:"));
    }

    #[test]
    fn test_peer_events_update_registry() {
        let f = fixture();
        let peer = discovery::PeerRecord {
            station_id: "ridge-relay".to_owned(),
            public_key: KeyPair::from_seed(3).public,
            encrypted_contact_info: String::new(),
            last_seen: 0,
        };

        f.service
            .handle_peer(discovery::Event::Discovered(peer), f.now);
        assert_eq!(f.registry.counts(), (0, 1));

        f.service
            .handle_peer(discovery::Event::Lost("ridge-relay".to_owned()), f.now);
        assert_eq!(f.registry.counts(), (0, 0));
    }

    #[test]
    fn test_remote_relay_delivers_to_local_node() {
        let f = fixture();
        boot(&f);

        f.service.handle_remote(
            p2p::Inbound {
                station_id: "ridge-relay".to_owned(),
                from_node: 7,
                target_node: 102,
                text: "greetings from the ridge".to_owned(),
                timestamp: 0,
            },
            f.now,
        );

        assert_eq!(
            f.sink.sent_to(102),
            vec!["[From 7@ridge-relay]: greetings from the ridge"]
        );
    }

    #[test]
    fn test_remote_relay_broadcasts_for_unknown_target() {
        let f = fixture();
        boot(&f);

        f.service.handle_remote(
            p2p::Inbound {
                station_id: "ridge-relay".to_owned(),
                from_node: 7,
                target_node: 9999,
                text: "to whoever".to_owned(),
                timestamp: 0,
            },
            f.now,
        );

        assert_eq!(f.sink.sent_to(proto::BROADCAST_ADDR).len(), 1);
    }

    #[test]
    fn test_offline_relay_is_queued_then_deliverable() {
        let f = fixture();
        boot(&f);
        // Bob falls silent.
        let later = f.now + localtime::LocalDuration::from_mins(10);

        f.service
            .handle_mesh(Envelope::Packet(text_packet(200, 100, "@bob hello")), later);

        assert!(f.sink.sent_to(102).is_empty());
        let pending = f.queue.next_batch(10, later).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, Status::Pending);
        assert_eq!(pending[0].to_node, 102);
    }

    #[test]
    fn test_mesh_disconnect_ends_stream() {
        let f = fixture();
        assert!(!f
            .service
            .handle_mesh(Envelope::Disconnected("gone".to_owned()), f.now));
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("mountain-top"), "MOUN");
        assert_eq!(short_name("ab"), "AB");
    }

    #[test]
    fn test_losing_unknown_station_is_noop() {
        let f = fixture();
        f.service
            .handle_peer(discovery::Event::Lost("never-seen".to_owned()), f.now);
        assert_eq!(f.registry.counts(), (0, 0));
    }
}
