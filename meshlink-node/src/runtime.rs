//! Station runtime.
//!
//! Wires the subsystems together, spawns one thread per long-running loop,
//! and owns the single coalescing shutdown path. Thread inventory at steady
//! state: the mesh reader (inside the transport), the service loop, the
//! delayed-delivery sweep, the discovery heartbeat and refresh loops, the
//! p2p accept and keep-alive loops, and one reader per open p2p session.
use std::net::TcpListener;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::{io, thread, time};

use crossbeam_channel as chan;
use localtime::LocalTime;
use thiserror::Error;

use meshlink::profile::{Config, Home};
use meshlink::{env, StationId};
use meshlink_signals::Signal;

use crate::mesh::{self, Transport};
use crate::queue::Queue;
use crate::service::{Exit, Service};
use crate::{discovery, p2p, registry, relay, scheduler};

/// Ports tried after the configured one when it is taken.
const PORT_WINDOW: u16 = 10;
/// Mesh device heartbeat interval.
const MESH_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(120);
/// Serial reopen attempts before the station gives up.
const MESH_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] meshlink::profile::Error),
    #[error("mesh transport error: {0}")]
    Mesh(#[from] mesh::Error),
    #[error("message queue error: {0}")]
    Queue(#[from] crate::queue::Error),
    #[error("discovery error: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no free p2p port in {0}..{1}")]
    NoListenPort(u16, u16),
    #[error("mesh port could not be recovered after {MESH_RECOVERY_ATTEMPTS} attempts")]
    MeshRecoveryFailed,
}

/// Holds the wired station, ready to run.
pub struct Runtime {
    home: Home,
    config: Config,
    station_id: StationId,
    signals: chan::Receiver<Signal>,
    queue: Queue,
    registry: registry::Shared,
    sender: mesh::Sender,
    mesh_events: chan::Receiver<mesh::Envelope>,
    discovery: Arc<discovery::Client>,
    p2p: Arc<p2p::Manager>,
    listener: TcpListener,
    service: Service,
    peers_rx: chan::Receiver<discovery::Event>,
    inbound_rx: chan::Receiver<p2p::Inbound>,
    start_heartbeat: chan::Receiver<()>,
    start_refresh: chan::Receiver<()>,
}

impl Runtime {
    /// Initialize the runtime: load keys, claim ports, open the radio and
    /// the queue, and wire every subsystem.
    pub fn init(
        home: Home,
        mut config: Config,
        signals: chan::Receiver<Signal>,
    ) -> Result<Runtime, Error> {
        let keys = config.key_pair()?;
        let station_id = config.station_id.clone();
        let now = LocalTime::now();

        // Claim the p2p listen port, falling forward through a small window
        // if the configured one is taken, and persist the outcome.
        let (listener, port) = bind_listen_port(config.p2p.listen_port)?;
        if port != config.p2p.listen_port {
            log::warn!(
                target: "node",
                "Port {} is taken; listening on {port} instead",
                config.p2p.listen_port
            );
            config.p2p.listen_port = port;
            config.write(&home.config())?;
        }

        let transport = Arc::new(Transport::open(&config.mesh)?);
        let mesh_events = transport.events().ok_or(mesh::Error::Closed)?;
        let sender = mesh::Sender::new(transport);

        log::info!(target: "node", "Opening message queue {}..", home.queue_db().display());
        let queue = Queue::open(home.queue_db())?;

        let registry = registry::Shared::new();
        let my_node = Arc::new(AtomicU32::new(0));

        let (peers_tx, peers_rx) = chan::unbounded();
        let (inbound_tx, inbound_rx) = chan::unbounded();
        let (start_hb_tx, start_heartbeat) = chan::bounded(1);
        let (start_rf_tx, start_refresh) = chan::bounded(1);

        let shared_secret = env::discovery_secret();
        let timeout = time::Duration::from_secs(config.discovery.timeout);
        let discovery = Arc::new(discovery::Client::with_contact(
            station_id.clone(),
            keys.public,
            port,
            &shared_secret,
            discovery::transport(&config.discovery.service_url, timeout),
            peers_tx,
            now,
        )?);
        let p2p = p2p::Manager::new(
            station_id.clone(),
            keys.secret,
            shared_secret,
            config.p2p.max_connections,
            time::Duration::from_secs(config.p2p.connection_timeout),
            discovery.clone() as Arc<dyn p2p::PeerDirectory>,
            inbound_tx,
        );

        let outbound: Arc<dyn mesh::Outbound> = Arc::new(sender.clone());
        let relay = relay::Engine::new(
            registry.clone(),
            outbound.clone(),
            queue.clone(),
            discovery.clone(),
            p2p.clone(),
            my_node.clone(),
        );
        let service = Service::new(
            config.display_name.clone(),
            registry.clone(),
            outbound,
            Some(sender.clone()),
            relay,
            queue.clone(),
            discovery.clone(),
            p2p.clone(),
            my_node,
            vec![start_hb_tx, start_rf_tx],
        );

        Ok(Runtime {
            home,
            config,
            station_id,
            signals,
            queue,
            registry,
            sender,
            mesh_events,
            discovery,
            p2p,
            listener,
            service,
            peers_rx,
            inbound_rx,
            start_heartbeat,
            start_refresh,
        })
    }

    /// Run the station until a signal or a fatal error, then clean up.
    pub fn run(self) -> Result<(), Error> {
        log::info!(
            target: "node",
            "Station `{}` running from {}..",
            self.station_id,
            self.home.path().display()
        );

        // One shutdown channel per loop, stopped in a fixed order. Dropping
        // a sender wakes the loop just like sending would.
        let (stop_scheduler_tx, stop_scheduler) = chan::bounded::<()>(1);
        let (stop_disc_hb_tx, stop_disc_hb) = chan::bounded::<()>(1);
        let (stop_disc_rf_tx, stop_disc_rf) = chan::bounded::<()>(1);
        let (stop_accept_tx, stop_accept) = chan::bounded::<()>(1);
        let (stop_keepalive_tx, stop_keepalive) = chan::bounded::<()>(1);
        let (stop_mesh_hb_tx, stop_mesh_hb) = chan::bounded::<()>(1);
        let (stop_service_tx, stop_service) = chan::bounded::<()>(1);
        let (fatal_tx, fatal) = chan::bounded::<Error>(1);

        let sched = scheduler::Scheduler::new(
            self.queue.clone(),
            self.registry.clone(),
            Arc::new(self.sender.clone()),
        );
        let scheduler_thread = thread::Builder::new()
            .name(String::from("scheduler"))
            .spawn(move || scheduler::run(sched, scheduler::TICK_INTERVAL, stop_scheduler))?;

        let heartbeat_interval = time::Duration::from_secs(self.config.discovery.check_interval);
        let disc_hb_thread = thread::Builder::new().name(String::from("discovery-hb")).spawn({
            let client = self.discovery.clone();
            let start = self.start_heartbeat.clone();
            move || discovery::heartbeat_loop(client, heartbeat_interval, start, stop_disc_hb)
        })?;
        let disc_rf_thread = thread::Builder::new().name(String::from("discovery-rf")).spawn({
            let client = self.discovery.clone();
            let start = self.start_refresh.clone();
            move || {
                discovery::refresh_loop(client, discovery::REFRESH_INTERVAL, start, stop_disc_rf)
            }
        })?;

        let accept_thread = thread::Builder::new().name(String::from("p2p-accept")).spawn({
            let manager = self.p2p.clone();
            let listener = self.listener.try_clone()?;
            move || {
                if let Err(e) = p2p::accept_loop(manager, listener, stop_accept) {
                    log::error!(target: "p2p", "Accept loop failed: {e}");
                }
            }
        })?;
        let keepalive_thread = thread::Builder::new().name(String::from("p2p-keepalive")).spawn({
            let manager = self.p2p.clone();
            move || p2p::keepalive_loop(manager, stop_keepalive)
        })?;

        let mesh_hb_thread = thread::Builder::new().name(String::from("mesh-heartbeat")).spawn({
            let sender = self.sender.clone();
            move || mesh::heartbeat_loop(sender, MESH_HEARTBEAT_INTERVAL, stop_mesh_hb)
        })?;

        let service_thread = thread::Builder::new().name(String::from("service")).spawn({
            let service = self.service;
            let sender = self.sender.clone();
            let mesh_config = self.config.mesh.clone();
            let peers_rx = self.peers_rx;
            let inbound_rx = self.inbound_rx;
            let mut mesh_rx = self.mesh_events;

            move || loop {
                let exit = service.run(
                    mesh_rx.clone(),
                    peers_rx.clone(),
                    inbound_rx.clone(),
                    stop_service.clone(),
                );
                match exit {
                    Exit::Shutdown => break,
                    Exit::MeshClosed => {
                        match recover_mesh(&sender, &mesh_config, &stop_service) {
                            Some(events) => {
                                mesh_rx = events;
                            }
                            None => {
                                fatal_tx.try_send(Error::MeshRecoveryFailed).ok();
                                break;
                            }
                        }
                    }
                }
            }
        })?;

        // Wait for a signal or a fatal subsystem error. Repeated signals
        // coalesce: the first one wins, the rest land in a stopped channel.
        let result = chan::select! {
            recv(self.signals) -> signal => {
                match signal {
                    Ok(Signal::Interrupt) => log::info!(target: "node", "Interrupted, shutting down.."),
                    Ok(Signal::Terminate) => log::info!(target: "node", "Terminated, shutting down.."),
                    Err(_) => log::warn!(target: "node", "Signal channel closed, shutting down.."),
                }
                Ok(())
            }
            recv(fatal) -> error => match error {
                Ok(error) => Err(error),
                Err(_) => Ok(()),
            },
        };

        // Ordered, idempotent cleanup. Each loop observes its stop channel
        // within a tick, so joins are bounded in practice.
        log::info!(target: "node", "Stopping delayed delivery..");
        drop(stop_scheduler_tx);
        scheduler_thread.join().ok();

        log::info!(target: "node", "Stopping discovery..");
        drop(stop_disc_hb_tx);
        drop(stop_disc_rf_tx);
        disc_hb_thread.join().ok();
        disc_rf_thread.join().ok();

        log::info!(target: "node", "Draining p2p sessions..");
        self.p2p.drain();
        drop(stop_accept_tx);
        drop(stop_keepalive_tx);
        accept_thread.join().ok();
        keepalive_thread.join().ok();

        drop(stop_service_tx);
        drop(stop_mesh_hb_tx);
        service_thread.join().ok();
        mesh_hb_thread.join().ok();

        log::info!(target: "node", "Closing message queue..");
        drop(self.queue);

        log::info!(target: "node", "Closing mesh transport..");
        self.sender.transport().close();

        log::info!(target: "node", "Station `{}` shut down", self.station_id);
        result
    }
}

/// Reopen the serial port with backoff. Returns the new event stream, or
/// `None` when every attempt failed or shutdown was requested.
fn recover_mesh(
    sender: &mesh::Sender,
    config: &meshlink::profile::Mesh,
    shutdown: &chan::Receiver<()>,
) -> Option<chan::Receiver<mesh::Envelope>> {
    for attempt in 1..=MESH_RECOVERY_ATTEMPTS {
        let backoff = time::Duration::from_secs(1u64 << attempt);
        log::warn!(
            target: "node",
            "Reopening mesh port in {}s (attempt {attempt}/{MESH_RECOVERY_ATTEMPTS})..",
            backoff.as_secs()
        );
        match shutdown.recv_timeout(backoff) {
            Ok(()) | Err(chan::RecvTimeoutError::Disconnected) => return None,
            Err(chan::RecvTimeoutError::Timeout) => {}
        }
        match Transport::open(config) {
            Ok(transport) => {
                let transport = Arc::new(transport);
                let events = transport.events();
                sender.transport().close();
                sender.replace(transport);
                log::info!(target: "node", "Mesh port reopened");
                return events;
            }
            Err(e) => {
                log::error!(target: "node", "Reopen failed: {e}");
            }
        }
    }
    None
}

/// Bind the p2p listener, trying a small window of ports.
fn bind_listen_port(preferred: u16) -> Result<(TcpListener, u16), Error> {
    for port in preferred..preferred.saturating_add(PORT_WINDOW) {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::NoListenPort(
        preferred,
        preferred.saturating_add(PORT_WINDOW),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bind_listen_port_falls_forward() {
        let (first, taken) = bind_listen_port(0).unwrap();
        assert_eq!(first.local_addr().unwrap().port(), taken);

        // The ephemeral port is now busy: the next bind falls forward.
        let (_second, next) = bind_listen_port(taken).unwrap();
        assert_ne!(next, taken);
        assert!(next > taken && next < taken + PORT_WINDOW);
    }
}
