//! Station-to-station connections.
//!
//! Peers exchange newline-delimited JSON frames over plain TCP. The
//! transport framing is public; confidentiality lives one layer up, where
//! relay payloads are sealed to the recipient station's key.
//!
//! A session must authenticate before it carries relay traffic. The
//! handshake is symmetric: each side sends a `hello` with its station id and
//! a fresh nonce, and answers the peer's `hello` with an `auth` whose proof
//! is a tag over the peer's nonce, keyed by the static x25519 agreement
//! between its own secret key and the peer's public key ([`seal::prove`]).
//! The verifier recomputes the tag from its own secret key and the public
//! key the discovery service lists for the *claimed* station id, so a proof
//! only checks out if the prover holds that station's secret. A verified
//! proof is acknowledged with `authOk`; senders hold relay traffic until the
//! peer's acknowledgment arrives, which (with TCP ordering) guarantees the
//! peer had verified us before it sees our first relay.
//!
//! ```text
//! Connecting ──tcp──▶ Connected ──auth──▶ Authenticated ──▶ Closed
//!                         │                                  ▲
//!                         └───bad proof / unknown peer───▶ Error
//! ```
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::{io, net, thread, time};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use crossbeam_channel as chan;
use localtime::LocalTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{seal, PublicKey, SecretKey};
use crate::discovery::PeerRecord;
use crate::{NodeId, StationId};

/// Keep-alive tick interval.
pub const KEEPALIVE_INTERVAL: time::Duration = time::Duration::from_secs(30);
/// Missed keep-alive ticks before a session is closed.
pub const KEEPALIVE_MISSES: u32 = 3;
/// Read timeout on session sockets, so reader threads observe shutdown.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(1);
/// Handshake nonce size in bytes.
const NONCE_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
    #[error("peer station `{0}` has no usable contact info")]
    BadContact(String),
    #[error("session authentication failed: {0}")]
    Auth(&'static str),
    #[error("no authenticated session to `{0}`")]
    NotConnected(String),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("seal error: {0}")]
    Seal(#[from] seal::Error),
}

/// A peer-to-peer wire frame. One JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Handshake opener; carries a fresh nonce to be proven by the peer.
    #[serde(rename_all = "camelCase")]
    Hello { station_id: String, nonce: String },
    /// Handshake proof: a possession tag over the peer's nonce, keyed by
    /// the static agreement between our secret key and the peer's key.
    Auth { proof: String },
    /// Acknowledges a verified proof; the peer may now send relays.
    AuthOk,
    /// An application relay. `message` is the sealed payload, base64.
    #[serde(rename_all = "camelCase")]
    Relay {
        from_node_id: u32,
        target_node_id: u32,
        message: String,
        timestamp: u64,
    },
    /// Keep-alive.
    Ping,
    Pong,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Authenticated,
    Closed,
    Error,
}

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

/// A decrypted relay received from a peer station.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub station_id: String,
    pub from_node: NodeId,
    pub target_node: NodeId,
    pub text: String,
    pub timestamp: u64,
}

/// Transfer and error counters, for the status report.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_activity: Option<LocalTime>,
}

/// Resolves a station id to a currently-known peer. The discovery client is
/// the production implementation; tests inject a map.
pub trait PeerDirectory: Send + Sync {
    fn peer(&self, station_id: &str) -> Option<PeerRecord>;
}

impl PeerDirectory for crate::discovery::Client {
    fn peer(&self, station_id: &str) -> Option<PeerRecord> {
        self.active_peer(station_id)
    }
}

struct Session {
    station_id: Option<String>,
    link: Link,
    state: SessionState,
    last_activity: LocalTime,
    /// Our handshake nonce; the peer must return a possession proof over it.
    nonce: [u8; NONCE_SIZE],
    /// Public key of the station the peer claims to be, as listed by
    /// discovery. Set when the peer's `hello` arrives; proofs are verified
    /// against it.
    peer_key: Option<PublicKey>,
    /// Whether the peer has acknowledged our proof with `authOk`.
    confirmed: bool,
    /// Last time an undecryptable relay was logged for this peer.
    last_decrypt_warn: Option<LocalTime>,
    writer: Arc<Mutex<TcpStream>>,
    /// Raw handle for shutting the socket down without taking the writer.
    stream: TcpStream,
    /// Signalled once the session is ready to carry relays; used by
    /// dialling callers.
    on_auth: Option<chan::Sender<()>>,
}

impl Session {
    fn close(&mut self, state: SessionState, reason: &str) {
        if matches!(self.state, SessionState::Closed | SessionState::Error) {
            return;
        }
        log::debug!(
            target: "p2p",
            "Closing session with {}: {reason}",
            self.station_id.as_deref().unwrap_or("<unknown>")
        );
        self.state = state;
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// The station-to-station connection manager.
pub struct Manager {
    station_id: StationId,
    secret: SecretKey,
    shared_secret: String,
    max_connections: usize,
    dial_timeout: time::Duration,
    directory: Arc<dyn PeerDirectory>,
    inbound: chan::Sender<Inbound>,
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
    stats: Mutex<Stats>,
    /// Self-handle for the session threads this manager spawns.
    me: Weak<Manager>,
}

impl Manager {
    pub fn new(
        station_id: StationId,
        secret: SecretKey,
        shared_secret: String,
        max_connections: usize,
        dial_timeout: time::Duration,
        directory: Arc<dyn PeerDirectory>,
        inbound: chan::Sender<Inbound>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            station_id,
            secret,
            shared_secret,
            max_connections,
            dial_timeout,
            directory,
            inbound,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(Stats::default()),
            me: me.clone(),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.me.upgrade().expect("p2p: manager is alive while sessions run")
    }

    /// Number of live sessions.
    pub fn active(&self) -> usize {
        self.sessions
            .lock()
            .expect("p2p: lock poisoned")
            .values()
            .filter(|s| !matches!(s.state, SessionState::Closed | SessionState::Error))
            .count()
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock().expect("p2p: lock poisoned")
    }

    /// Seal and send a relay to a peer station, dialling if necessary.
    pub fn send_relay(
        &self,
        peer: &PeerRecord,
        from_node: NodeId,
        target_node: NodeId,
        text: &str,
        now: LocalTime,
    ) -> Result<(), Error> {
        let sealed = seal::encrypt(text.as_bytes(), &peer.public_key)?;
        let frame = Frame::Relay {
            from_node_id: from_node,
            target_node_id: target_node,
            message: BASE64_STANDARD.encode(sealed),
            timestamp: now.as_millis(),
        };
        let session = match self.authenticated_session(&peer.station_id) {
            Some(id) => id,
            None => self.dial(peer)?,
        };
        self.write_frame(session, &frame)?;
        self.with_stats(|s| s.messages_sent += 1);

        Ok(())
    }

    /// Close every session. Used at shutdown.
    pub fn drain(&self) {
        let mut sessions = self.sessions.lock().expect("p2p: lock poisoned");
        for session in sessions.values_mut() {
            session.close(SessionState::Closed, "station shutting down");
        }
    }

    /// Dial a peer and wait for mutual authentication.
    fn dial(&self, peer: &PeerRecord) -> Result<u64, Error> {
        let contact = peer
            .contact(&self.shared_secret)
            .map_err(|_| Error::BadContact(peer.station_id.clone()))?;
        let addr: SocketAddr = format!("{}:{}", contact.ip, contact.port)
            .parse::<SocketAddr>()
            .map_err(|_| Error::BadContact(peer.station_id.clone()))?;

        log::info!(target: "p2p", "Dialling {} at {addr}..", peer.station_id);
        let stream = TcpStream::connect_timeout(&addr, self.dial_timeout)?;
        let (id, on_auth) = self.register(stream, Link::Outbound, Some(peer.station_id.clone()))?;

        match on_auth.recv_timeout(self.dial_timeout) {
            Ok(()) => Ok(id),
            Err(_) => {
                self.close(id, SessionState::Error, "authentication timed out");
                Err(Error::Auth("timed out"))
            }
        }
    }

    /// Take ownership of a socket: allocate a session, send our `hello`, and
    /// spawn the reader thread.
    fn register(
        &self,
        stream: TcpStream,
        link: Link,
        station_id: Option<String>,
    ) -> Result<(u64, chan::Receiver<()>), Error> {
        if self.active() >= self.max_connections {
            stream.shutdown(Shutdown::Both).ok();
            return Err(Error::AtCapacity(self.max_connections));
        }
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true).ok();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut nonce = [0u8; NONCE_SIZE];
        let mut rng = fastrand::Rng::new();
        for b in nonce.iter_mut() {
            *b = rng.u8(..);
        }
        let (auth_tx, auth_rx) = chan::bounded(1);
        let reader = stream.try_clone()?;
        let session = Session {
            station_id,
            link,
            state: SessionState::Connected,
            last_activity: LocalTime::now(),
            nonce,
            peer_key: None,
            confirmed: false,
            last_decrypt_warn: None,
            writer: Arc::new(Mutex::new(stream.try_clone()?)),
            stream,
            on_auth: Some(auth_tx),
        };
        self.sessions
            .lock()
            .expect("p2p: lock poisoned")
            .insert(id, session);
        self.with_stats(|s| s.total_connections += 1);

        let hello = Frame::Hello {
            station_id: self.station_id.to_string(),
            nonce: BASE64_STANDARD.encode(nonce),
        };
        let spawned = self.write_frame(id, &hello).and_then(|()| {
            let manager = self.me();
            thread::Builder::new()
                .name(format!("p2p-session-{id}"))
                .spawn(move || manager.session_loop(id, reader))
                .map_err(Error::from)
        });
        if let Err(e) = spawned {
            self.sessions.lock().expect("p2p: lock poisoned").remove(&id);
            return Err(e);
        }
        Ok((id, auth_rx))
    }

    /// Per-session reader: one JSON frame per line until the socket closes.
    fn session_loop(self: Arc<Self>, id: u64, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            // Nb. on a read timeout, bytes read so far stay in `line`, so a
            // frame split across reads survives the timeout.
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.close(id, SessionState::Closed, "peer hung up");
                    break;
                }
                Ok(n) => {
                    self.with_stats(|s| {
                        s.bytes_received += n as u64;
                        s.last_activity = Some(LocalTime::now());
                    });
                    self.touch(id);

                    let result = serde_json::from_str::<Frame>(line.trim_end());
                    line.clear();

                    match result {
                        Ok(frame) => {
                            if !self.handle_frame(id, frame) {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!(target: "p2p", "Dropping malformed frame: {e}");
                            self.with_stats(|s| s.errors += 1);
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.is_closed(id) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close(id, SessionState::Error, &e.to_string());
                    self.with_stats(|s| s.errors += 1);
                    break;
                }
            }
        }
        self.sessions.lock().expect("p2p: lock poisoned").remove(&id);
        log::debug!(target: "p2p", "Session {id} finished");
    }

    /// Returns `false` when the session should end.
    fn handle_frame(&self, id: u64, frame: Frame) -> bool {
        match frame {
            Frame::Hello { station_id, nonce } => {
                let Some(peer) = self.directory.peer(&station_id) else {
                    log::warn!(target: "p2p", "Refusing session with unknown station `{station_id}`");
                    self.close(id, SessionState::Error, "unknown station");
                    return false;
                };
                let Ok(nonce) = BASE64_STANDARD.decode(&nonce) else {
                    self.close(id, SessionState::Error, "malformed nonce");
                    return false;
                };
                // The claim is only trusted once the peer proves possession
                // of this key; until then the session stays unauthenticated.
                if let Some(session) = self.sessions.lock().expect("p2p: lock poisoned").get_mut(&id)
                {
                    session.station_id = Some(station_id);
                    session.peer_key = Some(peer.public_key);
                }
                let proof = BASE64_STANDARD.encode(seal::prove(&self.secret, &peer.public_key, &nonce));
                if self.write_frame(id, &Frame::Auth { proof }).is_err() {
                    return false;
                }
                true
            }
            Frame::Auth { proof } => {
                let (expected, peer_key) =
                    match self.sessions.lock().expect("p2p: lock poisoned").get(&id) {
                        Some(session) => (session.nonce, session.peer_key),
                        None => return false,
                    };
                // A proof can only be checked against a claimed identity.
                let Some(peer_key) = peer_key else {
                    self.close(id, SessionState::Error, "auth before hello");
                    return false;
                };
                let verified = BASE64_STANDARD
                    .decode(&proof)
                    .map(|proof| seal::verify(&self.secret, &peer_key, &expected, &proof))
                    .unwrap_or(false);

                if !verified {
                    log::warn!(target: "p2p", "Session {id} failed authentication");
                    self.with_stats(|s| s.errors += 1);
                    self.close(id, SessionState::Error, "bad auth proof");
                    return false;
                }
                {
                    let mut sessions = self.sessions.lock().expect("p2p: lock poisoned");
                    if let Some(session) = sessions.get_mut(&id) {
                        session.state = SessionState::Authenticated;
                        log::info!(
                            target: "p2p",
                            "Session with {} authenticated ({:?})",
                            session.station_id.as_deref().unwrap_or("<unknown>"),
                            session.link
                        );
                    }
                }
                if self.write_frame(id, &Frame::AuthOk).is_err() {
                    return false;
                }
                self.maybe_ready(id);
                true
            }
            Frame::AuthOk => {
                if let Some(session) = self.sessions.lock().expect("p2p: lock poisoned").get_mut(&id)
                {
                    session.confirmed = true;
                }
                self.maybe_ready(id);
                true
            }
            Frame::Relay {
                from_node_id,
                target_node_id,
                message,
                timestamp,
            } => {
                let (authenticated, station_id) = {
                    let sessions = self.sessions.lock().expect("p2p: lock poisoned");
                    match sessions.get(&id) {
                        Some(s) => (
                            s.state == SessionState::Authenticated,
                            s.station_id.clone().unwrap_or_default(),
                        ),
                        None => return false,
                    }
                };
                if !authenticated {
                    log::warn!(target: "p2p", "Dropping relay on unauthenticated session {id}");
                    self.with_stats(|s| s.errors += 1);
                    return true;
                }
                let text = BASE64_STANDARD
                    .decode(&message)
                    .ok()
                    .and_then(|sealed| seal::decrypt(&sealed, &self.secret).ok())
                    .and_then(|plain| String::from_utf8(plain).ok());

                match text {
                    Some(text) => {
                        self.with_stats(|s| s.messages_received += 1);
                        self.inbound
                            .send(Inbound {
                                station_id,
                                from_node: from_node_id,
                                target_node: target_node_id,
                                text,
                                timestamp,
                            })
                            .ok();
                    }
                    None => {
                        // Forged or corrupted payload; drop it, keep the
                        // session. Logged at most once a minute per peer.
                        self.with_stats(|s| s.errors += 1);
                        let now = LocalTime::now();
                        let mut sessions = self.sessions.lock().expect("p2p: lock poisoned");
                        if let Some(session) = sessions.get_mut(&id) {
                            let recently = session.last_decrypt_warn.is_some_and(|at| {
                                at + localtime::LocalDuration::from_mins(1) > now
                            });
                            if !recently {
                                session.last_decrypt_warn = Some(now);
                                log::warn!(
                                    target: "p2p",
                                    "Dropping undecryptable relay from {station_id}"
                                );
                            }
                        }
                    }
                }
                true
            }
            Frame::Ping => self.write_frame(id, &Frame::Pong).is_ok(),
            Frame::Pong => true,
        }
    }

    /// Accept an inbound connection, refusing past the session cap.
    fn accept(&self, stream: TcpStream, addr: net::SocketAddr) {
        match self.register(stream, Link::Inbound, None) {
            Ok(_) => {
                log::info!(target: "p2p", "Accepted connection from {addr}");
            }
            Err(Error::AtCapacity(max)) => {
                log::warn!(target: "p2p", "Refusing connection from {addr}: at capacity ({max})");
            }
            Err(e) => {
                log::error!(target: "p2p", "Failed to accept connection from {addr}: {e}");
                self.with_stats(|s| s.errors += 1);
            }
        }
    }

    /// Keep-alive sweep: ping everything, close the silent.
    fn keepalive(&self, now: LocalTime) {
        let idle_limit =
            localtime::LocalDuration::from_secs(KEEPALIVE_INTERVAL.as_secs() * u64::from(KEEPALIVE_MISSES));
        let mut stale = Vec::new();
        let mut live = Vec::new();
        {
            let mut sessions = self.sessions.lock().expect("p2p: lock poisoned");
            for (id, session) in sessions.iter_mut() {
                if session.last_activity + idle_limit < now {
                    session.close(SessionState::Closed, "timeout");
                    stale.push(*id);
                } else {
                    live.push(*id);
                }
            }
        }
        for id in live {
            self.write_frame(id, &Frame::Ping).ok();
        }
        if !stale.is_empty() {
            log::debug!(target: "p2p", "Closed {} idle session(s)", stale.len());
        }
    }

    /// Fire the dialler's ready signal once both sides have verified.
    fn maybe_ready(&self, id: u64) {
        if let Some(session) = self.sessions.lock().expect("p2p: lock poisoned").get_mut(&id) {
            if session.state == SessionState::Authenticated && session.confirmed {
                if let Some(on_auth) = session.on_auth.take() {
                    on_auth.send(()).ok();
                }
            }
        }
    }

    fn authenticated_session(&self, station_id: &str) -> Option<u64> {
        self.sessions
            .lock()
            .expect("p2p: lock poisoned")
            .iter()
            .find(|(_, s)| {
                s.state == SessionState::Authenticated
                    && s.confirmed
                    && s.station_id.as_deref() == Some(station_id)
            })
            .map(|(id, _)| *id)
    }

    fn write_frame(&self, id: u64, frame: &Frame) -> Result<(), Error> {
        let writer = {
            let sessions = self.sessions.lock().expect("p2p: lock poisoned");
            let session = sessions
                .get(&id)
                .ok_or_else(|| Error::NotConnected(id.to_string()))?;
            session.writer.clone()
        };
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut writer = writer.lock().expect("p2p: lock poisoned");
        writer.write_all(line.as_bytes())?;
        writer.flush()?;

        self.with_stats(|s| {
            s.bytes_sent += line.len() as u64;
            s.last_activity = Some(LocalTime::now());
        });
        Ok(())
    }

    fn close(&self, id: u64, state: SessionState, reason: &str) {
        if let Some(session) = self.sessions.lock().expect("p2p: lock poisoned").get_mut(&id) {
            session.close(state, reason);
        }
    }

    fn is_closed(&self, id: u64) -> bool {
        self.sessions
            .lock()
            .expect("p2p: lock poisoned")
            .get(&id)
            .map(|s| matches!(s.state, SessionState::Closed | SessionState::Error))
            .unwrap_or(true)
    }

    fn touch(&self, id: u64) {
        if let Some(session) = self.sessions.lock().expect("p2p: lock poisoned").get_mut(&id) {
            session.last_activity = LocalTime::now();
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut Stats)) {
        f(&mut self.stats.lock().expect("p2p: lock poisoned"));
    }
}

/// Accept loop. Non-blocking accept so shutdown is observed promptly.
pub fn accept_loop(
    manager: Arc<Manager>,
    listener: TcpListener,
    shutdown: chan::Receiver<()>,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    log::info!(
        target: "p2p",
        "Listening for stations on {}..",
        listener.local_addr()?
    );

    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false).ok();
                manager.accept(stream, addr);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match shutdown.recv_timeout(time::Duration::from_millis(200)) {
                    Ok(()) | Err(chan::RecvTimeoutError::Disconnected) => break,
                    Err(chan::RecvTimeoutError::Timeout) => {}
                }
            }
            Err(e) => {
                log::error!(target: "p2p", "Accept failed: {e}");
                thread::sleep(time::Duration::from_millis(200));
            }
        }
    }
    log::debug!(target: "p2p", "Accept loop exiting..");

    Ok(())
}

/// Keep-alive loop.
pub fn keepalive_loop(manager: Arc<Manager>, shutdown: chan::Receiver<()>) {
    let ticker = chan::tick(KEEPALIVE_INTERVAL);
    loop {
        chan::select! {
            recv(ticker) -> _ => manager.keepalive(LocalTime::now()),
            recv(shutdown) -> _ => break,
        }
    }
}
