//! Rendezvous discovery client.
//!
//! Stations find each other through an external HTTP rendezvous service:
//! each station periodically posts its sealed contact information under its
//! station id, and polls the peer list to learn who else is around. Peer set
//! changes are emitted as [`Event`]s; the actual connections are the p2p
//! manager's business.
//!
//! The client is deliberately hard to kill: heartbeat and refresh failures
//! (5xx, DNS, timeouts) are logged and retried on the next tick, never
//! escalated.
use std::collections::HashMap;
use std::net;
use std::sync::Mutex;
use std::time;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::seal::{self, ContactInfo};
use crate::crypto::PublicKey;
use crate::{LocalTime, StationId};

/// How often the peer list is polled. Spaced out to respect server rate
/// limits; peers also refresh us via their own heartbeats.
pub const REFRESH_INTERVAL: time::Duration = time::Duration::from_secs(120);
/// Default heartbeat interval.
pub const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum Error {
    /// The service answered with an error status.
    #[error("discovery service returned {0}")]
    Status(u16),
    /// The service could not be reached at all.
    #[error("discovery transport error: {0}")]
    Transport(String),
    /// The response body was not what we expected.
    #[error("invalid discovery response: {0}")]
    Response(String),
    /// Contact info could not be sealed.
    #[error("contact seal error: {0}")]
    Seal(#[from] seal::Error),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(t) => Self::Transport(t.to_string()),
        }
    }
}

/// A peer as listed by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub station_id: String,
    pub public_key: PublicKey,
    pub encrypted_contact_info: String,
    /// Milliseconds since the epoch, as reported by the service.
    #[serde(default)]
    pub last_seen: u64,
}

impl PeerRecord {
    /// Open the peer's sealed contact info with the shared discovery secret.
    pub fn contact(&self, shared_secret: &str) -> Result<ContactInfo, seal::Error> {
        seal::decrypt_contact(&self.encrypted_contact_info, shared_secret)
    }
}

/// A change in the peer set.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Discovered(PeerRecord),
    Lost(String),
}

/// Client lifecycle state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    Registering,
    Active,
    Stopping,
}

/// What we announce to the service on register and heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub station_id: String,
    pub encrypted_contact_info: String,
    pub public_key: PublicKey,
}

/// The server side of discovery, as seen from the client. Injected so tests
/// and the short-circuited test mode run without sockets.
pub trait Rendezvous: Send + Sync {
    fn register(&self, registration: &Registration) -> Result<(), Error>;
    fn peers(&self) -> Result<Vec<PeerRecord>, Error>;
    fn unregister(&self, station_id: &str) -> Result<(), Error>;
    fn health(&self) -> Result<(), Error>;
}

/// HTTP rendezvous transport.
pub struct HttpRendezvous {
    url: String,
    agent: ureq::Agent,
}

impl HttpRendezvous {
    pub fn new(url: impl Into<String>, timeout: time::Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

#[derive(Deserialize)]
struct PeersResponse {
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

impl Rendezvous for HttpRendezvous {
    fn register(&self, registration: &Registration) -> Result<(), Error> {
        self.agent.post(&self.url).send_json(registration)?;
        Ok(())
    }

    fn peers(&self) -> Result<Vec<PeerRecord>, Error> {
        let response = self.agent.get(&self.url).query("peers", "true").call()?;
        let body: PeersResponse = response
            .into_json()
            .map_err(|e| Error::Response(e.to_string()))?;

        Ok(body.peers)
    }

    fn unregister(&self, station_id: &str) -> Result<(), Error> {
        self.agent
            .delete(&self.url)
            .query("station_id", station_id)
            .call()?;
        Ok(())
    }

    fn health(&self) -> Result<(), Error> {
        self.agent.get(&self.url).query("health", "true").call()?;
        Ok(())
    }
}

/// Short-circuited transport for test environments: every call succeeds and
/// the mesh is alone in the world.
pub struct SimulatedRendezvous;

impl Rendezvous for SimulatedRendezvous {
    fn register(&self, registration: &Registration) -> Result<(), Error> {
        log::debug!(target: "discovery", "Simulated register for {}", registration.station_id);
        Ok(())
    }

    fn peers(&self) -> Result<Vec<PeerRecord>, Error> {
        Ok(Vec::new())
    }

    fn unregister(&self, station_id: &str) -> Result<(), Error> {
        log::debug!(target: "discovery", "Simulated unregister for {station_id}");
        Ok(())
    }

    fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Hosts that are short-circuited when the test marker is set.
const TEST_HOSTS: [&str; 3] = ["test.example.com", "localhost", "127.0.0.1"];

/// Pick the transport for a service URL, honoring test mode.
pub fn transport(url: &str, timeout: time::Duration) -> Box<dyn Rendezvous> {
    if meshlink::env::test_mode() && TEST_HOSTS.iter().any(|h| url.contains(h)) {
        log::info!(target: "discovery", "Test environment: discovery HTTP is simulated");
        return Box::new(SimulatedRendezvous);
    }
    Box::new(HttpRendezvous::new(url, timeout))
}

struct Inner {
    state: State,
    last_known: HashMap<String, PeerRecord>,
}

/// The discovery client.
///
/// Owns the registration payload and the last known peer set; the heartbeat
/// and refresh loops drive it from their own threads.
pub struct Client {
    station_id: StationId,
    contact: ContactInfo,
    sealed_contact: String,
    public_key: PublicKey,
    transport: Box<dyn Rendezvous>,
    events: chan::Sender<Event>,
    inner: Mutex<Inner>,
}

impl Client {
    /// Construct a client from its parts.
    pub fn new(
        station_id: StationId,
        contact: ContactInfo,
        sealed_contact: String,
        public_key: PublicKey,
        transport: Box<dyn Rendezvous>,
        events: chan::Sender<Event>,
    ) -> Self {
        Self {
            station_id,
            contact,
            sealed_contact,
            public_key,
            transport,
            events,
            inner: Mutex::new(Inner {
                state: State::Idle,
                last_known: HashMap::new(),
            }),
        }
    }

    /// Build and seal our contact info, then construct the client.
    pub fn with_contact(
        station_id: StationId,
        public_key: PublicKey,
        listen_port: u16,
        shared_secret: &str,
        transport: Box<dyn Rendezvous>,
        events: chan::Sender<Event>,
        now: LocalTime,
    ) -> Result<Self, Error> {
        let contact = ContactInfo {
            ip: local_ip(),
            port: listen_port,
            public_key,
            last_seen: now.as_millis(),
        };
        let sealed_contact = seal::encrypt_contact(&contact, shared_secret)?;

        Ok(Self::new(
            station_id,
            contact,
            sealed_contact,
            public_key,
            transport,
            events,
        ))
    }

    pub fn station_id(&self) -> &StationId {
        &self.station_id
    }

    pub fn contact(&self) -> &ContactInfo {
        &self.contact
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Register with the service. Failure leaves the client registering;
    /// the next heartbeat retries.
    pub fn start(&self) -> Result<(), Error> {
        self.set_state(State::Registering);

        if let Err(e) = self.transport.health() {
            log::warn!(target: "discovery", "Service health check failed: {e}");
        }
        self.transport.register(&self.registration())?;
        self.set_state(State::Active);
        log::info!(target: "discovery", "Registered station `{}` with rendezvous service", self.station_id);

        Ok(())
    }

    /// Re-announce ourselves. Sends the same sealed blob as registration.
    pub fn heartbeat(&self) -> Result<(), Error> {
        self.transport.register(&self.registration())?;
        // A heartbeat that lands while we never managed to register also
        // completes the registration.
        if self.state() == State::Registering {
            self.set_state(State::Active);
        }
        Ok(())
    }

    /// Poll the peer list and emit the set difference as events.
    pub fn refresh(&self) -> Result<(), Error> {
        let listed = self.transport.peers()?;
        let fresh: HashMap<String, PeerRecord> = listed
            .into_iter()
            .filter(|p| p.station_id != self.station_id.as_str())
            .map(|p| (p.station_id.clone(), p))
            .collect();

        let mut inner = self.lock();
        let mut lost: Vec<String> = inner
            .last_known
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        let mut discovered: Vec<PeerRecord> = fresh
            .values()
            .filter(|p| !inner.last_known.contains_key(&p.station_id))
            .cloned()
            .collect();
        lost.sort();
        discovered.sort_by(|a, b| a.station_id.cmp(&b.station_id));

        inner.last_known = fresh;
        drop(inner);

        for id in lost {
            log::info!(target: "discovery", "Peer lost: {id}");
            self.events.send(Event::Lost(id)).ok();
        }
        for peer in discovered {
            log::info!(target: "discovery", "Peer discovered: {}", peer.station_id);
            self.events.send(Event::Discovered(peer)).ok();
        }
        Ok(())
    }

    /// The peer matching `station_id`, if the client is active and the peer
    /// is currently listed.
    pub fn active_peer(&self, station_id: &str) -> Option<PeerRecord> {
        let inner = self.lock();
        if inner.state != State::Active {
            return None;
        }
        inner.last_known.get(station_id).cloned()
    }

    /// All currently known peers.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.lock().last_known.values().cloned().collect();
        peers.sort_by(|a, b| a.station_id.cmp(&b.station_id));
        peers
    }

    /// Unregister, best effort, and go idle.
    pub fn stop(&self) {
        self.set_state(State::Stopping);
        if let Err(e) = self.transport.unregister(self.station_id.as_str()) {
            log::warn!(target: "discovery", "Unregister failed: {e}");
        }
        self.set_state(State::Idle);
    }

    fn registration(&self) -> Registration {
        Registration {
            station_id: self.station_id.to_string(),
            encrypted_contact_info: self.sealed_contact.clone(),
            public_key: self.public_key,
        }
    }

    fn set_state(&self, state: State) {
        self.lock().state = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("discovery: lock poisoned")
    }
}

/// Best-effort local address detection: the address a UDP socket would use
/// to reach the outside world. Falls back to the loopback address.
fn local_ip() -> String {
    net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("198.51.100.1:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| String::from("127.0.0.1"))
}

/// Heartbeat loop. Registers once started, then re-announces on every tick;
/// unregisters on shutdown.
pub fn heartbeat_loop(
    client: std::sync::Arc<Client>,
    interval: time::Duration,
    start: chan::Receiver<()>,
    shutdown: chan::Receiver<()>,
) {
    chan::select! {
        recv(start) -> result => {
            if result.is_err() {
                return;
            }
        }
        recv(shutdown) -> _ => return,
    }
    if let Err(e) = client.start() {
        log::error!(target: "discovery", "Registration failed: {e}");
    }
    let ticker = chan::tick(interval);
    loop {
        chan::select! {
            recv(ticker) -> _ => {
                if let Err(e) = client.heartbeat() {
                    log::warn!(target: "discovery", "Heartbeat failed: {e}");
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    client.stop();
}

/// Peer refresh loop. Polls immediately once started, then on every tick.
pub fn refresh_loop(
    client: std::sync::Arc<Client>,
    interval: time::Duration,
    start: chan::Receiver<()>,
    shutdown: chan::Receiver<()>,
) {
    chan::select! {
        recv(start) -> result => {
            if result.is_err() {
                return;
            }
        }
        recv(shutdown) -> _ => return,
    }
    if let Err(e) = client.refresh() {
        log::warn!(target: "discovery", "Peer refresh failed: {e}");
    }
    let ticker = chan::tick(interval);
    loop {
        chan::select! {
            recv(ticker) -> _ => {
                if let Err(e) = client.refresh() {
                    log::warn!(target: "discovery", "Peer refresh failed: {e}");
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::KeyPair;

    /// Transport that replays a scripted sequence of peer lists.
    struct Script {
        lists: Mutex<Vec<Vec<PeerRecord>>>,
        registered: Mutex<usize>,
    }

    impl Script {
        fn new(lists: Vec<Vec<PeerRecord>>) -> Self {
            Self {
                lists: Mutex::new(lists),
                registered: Mutex::new(0),
            }
        }
    }

    impl Rendezvous for Script {
        fn register(&self, _registration: &Registration) -> Result<(), Error> {
            *self.registered.lock().unwrap() += 1;
            Ok(())
        }

        fn peers(&self) -> Result<Vec<PeerRecord>, Error> {
            let mut lists = self.lists.lock().unwrap();
            if lists.is_empty() {
                return Err(Error::Status(503));
            }
            Ok(lists.remove(0))
        }

        fn unregister(&self, _station_id: &str) -> Result<(), Error> {
            Ok(())
        }

        fn health(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn peer(id: &str, seed: u64) -> PeerRecord {
        PeerRecord {
            station_id: id.to_owned(),
            public_key: KeyPair::from_seed(seed).public,
            encrypted_contact_info: String::from("sealed"),
            last_seen: 0,
        }
    }

    fn client(lists: Vec<Vec<PeerRecord>>) -> (Client, chan::Receiver<Event>) {
        let (tx, rx) = chan::unbounded();
        let kp = KeyPair::from_seed(99);
        let client = Client::new(
            "our-station".parse().unwrap(),
            ContactInfo {
                ip: "127.0.0.1".to_owned(),
                port: 8447,
                public_key: kp.public,
                last_seen: 0,
            },
            String::from("sealed-self"),
            kp.public,
            Box::new(Script::new(lists)),
            tx,
        );
        (client, rx)
    }

    fn drain(rx: &chan::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_diff_event_stream() {
        let a = peer("station-a", 1);
        let b = peer("station-b", 2);
        let c = peer("station-c", 3);
        let (client, rx) = client(vec![
            vec![],
            vec![a.clone(), b.clone()],
            vec![b.clone(), c.clone()],
        ]);

        client.refresh().unwrap();
        assert_eq!(drain(&rx), vec![]);

        client.refresh().unwrap();
        assert_eq!(
            drain(&rx),
            vec![Event::Discovered(a), Event::Discovered(b)]
        );

        client.refresh().unwrap();
        assert_eq!(
            drain(&rx),
            vec![
                Event::Lost(String::from("station-a")),
                Event::Discovered(c)
            ]
        );
    }

    #[test]
    fn test_diff_excludes_self() {
        let (client, rx) = client(vec![vec![peer("our-station", 1), peer("station-b", 2)]]);
        client.refresh().unwrap();

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Discovered(p) if p.station_id == "station-b"));
    }

    #[test]
    fn test_refresh_failure_keeps_peer_set() {
        let b = peer("station-b", 2);
        let (client, rx) = client(vec![vec![b.clone()]]);

        client.refresh().unwrap();
        drain(&rx);

        // The scripted transport is exhausted: refresh fails, but the known
        // peer set is untouched and no spurious loss is emitted.
        assert!(client.refresh().is_err());
        assert_eq!(drain(&rx), vec![]);
        assert_eq!(client.peers(), vec![b]);
    }

    #[test]
    fn test_active_peer_requires_active_state() {
        let b = peer("station-b", 2);
        let (client, _rx) = client(vec![vec![b.clone()]]);
        client.refresh().unwrap();

        // Not registered yet: peers are known but not served.
        assert_eq!(client.active_peer("station-b"), None);

        client.start().unwrap();
        assert_eq!(client.active_peer("station-b"), Some(b));
        assert_eq!(client.active_peer("station-zz"), None);

        client.stop();
        assert_eq!(client.active_peer("station-b"), None);
    }

    #[test]
    fn test_state_machine() {
        let (client, _rx) = client(vec![]);
        assert_eq!(client.state(), State::Idle);

        client.start().unwrap();
        assert_eq!(client.state(), State::Active);

        client.stop();
        assert_eq!(client.state(), State::Idle);
    }

    #[test]
    fn test_heartbeat_reuses_registration_payload() {
        let (client, _rx) = client(vec![]);
        client.start().unwrap();
        client.heartbeat().unwrap();

        let registration = client.registration();
        assert_eq!(registration.station_id, "our-station");
        assert_eq!(registration.encrypted_contact_info, "sealed-self");
    }

    #[test]
    fn test_peer_record_json_shape() {
        let json = serde_json::json!({
            "stationId": "ridge-relay",
            "publicKey": KeyPair::from_seed(5).public.to_string(),
            "encryptedContactInfo": "blob",
            "lastSeen": 123,
        });
        let record: PeerRecord = serde_json::from_value(json).unwrap();

        assert_eq!(record.station_id, "ridge-relay");
        assert_eq!(record.last_seen, 123);
    }
}
