//! Mesh transport.
//!
//! Owns the serial link to the attached radio. Inbound bytes are reassembled
//! into frames, decoded into [`proto::FromRadio`] records and surfaced as a
//! single stream of [`Envelope`] values on a bounded channel; outbound text
//! goes through [`Transport::send_text`], which chunks, frames and writes.
//!
//! Failure semantics: a corrupt frame or undecodable payload is dropped and
//! the stream continues; a hard port error is surfaced once as
//! [`Envelope::Disconnected`], after which the stream closes.
pub mod frame;
pub mod proto;
pub mod splitter;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, thread, time};

use crossbeam_channel as chan;
use prost::Message as _;
use thiserror::Error;

use crate::NodeId;
use frame::FrameReader;
use meshlink::profile;

/// Capacity of the inbound envelope channel.
const INBOUND_CHANNEL_SIZE: usize = 64;
/// Serial read timeout. Short, so the reader thread notices shutdown.
const READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum Error {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] frame::Error),
    #[error("no radio found; set `mesh.devicePath` or enable `mesh.autoDetect`")]
    NoDevice,
    #[error("transport is closed")]
    Closed,
}

/// A decoded device output.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// The attached radio's own node number.
    MyNodeInfo(NodeId),
    /// A node-database entry, streamed at configure time or gossiped later.
    NodeInfo(proto::NodeInfo),
    /// A mesh packet. Only text packets are interpreted downstream.
    Packet(proto::MeshPacket),
    /// The device finished streaming its configuration.
    Configured(u32),
    /// The device rebooted underneath us.
    Rebooted,
    /// The port failed; the stream closes after this.
    Disconnected(String),
}

/// Outbound text interface, in front of the transport for the benefit of
/// handlers and tests.
pub trait Outbound: Send + Sync {
    /// Send `text` to mesh node `to`, chunking as needed.
    fn send_text(&self, text: &str, to: NodeId) -> Result<(), Error>;
}

/// The serial mesh transport.
pub struct Transport {
    writer: Mutex<Box<dyn serialport::SerialPort>>,
    events: Mutex<Option<chan::Receiver<Envelope>>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    rng: Mutex<fastrand::Rng>,
    path: String,
}

impl Transport {
    /// Open the radio and start the reader thread.
    ///
    /// Sends a configuration request so the device streams its node database
    /// followed by [`Envelope::Configured`].
    pub fn open(config: &profile::Mesh) -> Result<Self, Error> {
        let path = resolve_port(config)?;
        log::info!(target: "mesh", "Opening radio on {path} at {} baud..", config.baud_rate);

        let port = serialport::new(path.as_str(), config.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let writer = port.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = chan::bounded(INBOUND_CHANNEL_SIZE);

        let reader = thread::Builder::new()
            .name(String::from("mesh-reader"))
            .spawn({
                let closed = closed.clone();
                move || read_loop(port, tx, closed)
            })?;

        let transport = Self {
            writer: Mutex::new(writer),
            events: Mutex::new(Some(rx)),
            reader: Mutex::new(Some(reader)),
            closed,
            rng: Mutex::new(fastrand::Rng::new()),
            path,
        };
        transport.configure()?;

        Ok(transport)
    }

    /// Path of the open port.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Take the inbound stream. Single consumer; the stream ends when the
    /// port closes.
    pub fn events(&self) -> Option<chan::Receiver<Envelope>> {
        self.events.lock().expect("mesh: lock poisoned").take()
    }

    /// Ask the device to stream configuration and its node database.
    pub fn configure(&self) -> Result<(), Error> {
        let id = self.rng.lock().expect("mesh: lock poisoned").u32(1..);
        self.write(&proto::ToRadio::want_config(id))
    }

    /// Protocol-level keep-alive.
    pub fn heartbeat(&self) -> Result<(), Error> {
        self.write(&proto::ToRadio::heartbeat())
    }

    /// Close the port. Idempotent; the inbound stream drains and ends.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(target: "mesh", "Closing radio on {}..", self.path);
        if let Some(handle) = self.reader.lock().expect("mesh: lock poisoned").take() {
            handle.join().ok();
        }
    }

    fn write(&self, msg: &proto::ToRadio) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let framed = frame::frame(&msg.encode_to_vec())?;
        let mut writer = self.writer.lock().expect("mesh: lock poisoned");
        writer.write_all(&framed)?;
        writer.flush()?;

        Ok(())
    }
}

impl Outbound for Transport {
    fn send_text(&self, text: &str, to: NodeId) -> Result<(), Error> {
        let chunks = splitter::split(text);
        let total = chunks.len();

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                thread::sleep(splitter::CHUNK_SPACING);
            }
            let id = self.rng.lock().expect("mesh: lock poisoned").u32(1..);
            self.write(&proto::ToRadio::text(chunk, to, id))?;

            if total > 1 {
                log::debug!(target: "mesh", "Sent chunk {}/{total} to {to}", i + 1);
            }
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A cloneable handle on the current transport.
///
/// The indirection exists for port recovery: when the serial stream dies,
/// the runtime opens a fresh [`Transport`] and swaps it in here, and every
/// subsystem holding a handle keeps working without rewiring.
#[derive(Clone)]
pub struct Sender(Arc<std::sync::RwLock<Arc<Transport>>>);

impl Sender {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self(Arc::new(std::sync::RwLock::new(transport)))
    }

    /// The currently open transport.
    pub fn transport(&self) -> Arc<Transport> {
        self.0.read().expect("mesh: lock poisoned").clone()
    }

    /// Swap in a reopened transport.
    pub fn replace(&self, transport: Arc<Transport>) {
        *self.0.write().expect("mesh: lock poisoned") = transport;
    }

    pub fn heartbeat(&self) -> Result<(), Error> {
        self.transport().heartbeat()
    }

    pub fn configure(&self) -> Result<(), Error> {
        self.transport().configure()
    }
}

impl Outbound for Sender {
    fn send_text(&self, text: &str, to: NodeId) -> Result<(), Error> {
        self.transport().send_text(text, to)
    }
}

/// Mesh protocol heartbeat loop. Transient failures are logged, not fatal.
pub fn heartbeat_loop(sender: Sender, interval: time::Duration, shutdown: chan::Receiver<()>) {
    let ticker = chan::tick(interval);
    loop {
        chan::select! {
            recv(ticker) -> _ => {
                if let Err(e) = sender.heartbeat() {
                    log::warn!(target: "mesh", "Device heartbeat failed: {e}");
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
}

/// Pick the serial port to open.
fn resolve_port(config: &profile::Mesh) -> Result<String, Error> {
    if let Some(path) = &config.device_path {
        return Ok(path.clone());
    }
    if !config.auto_detect {
        return Err(Error::NoDevice);
    }
    let ports = serialport::available_ports()?;
    ports
        .iter()
        .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
        .or_else(|| ports.first())
        .map(|p| p.port_name.clone())
        .ok_or(Error::NoDevice)
}

/// Reader thread: bytes → frames → protobuf → envelopes.
fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    tx: chan::Sender<Envelope>,
    closed: Arc<AtomicBool>,
) {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; 256];

    loop {
        if closed.load(Ordering::SeqCst) {
            log::debug!(target: "mesh", "Reader thread exiting: transport closed");
            break;
        }
        let n = match port.read(&mut buf) {
            Ok(0) => {
                tx.send(Envelope::Disconnected(String::from("port closed"))).ok();
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!(target: "mesh", "Port error: {e}");
                tx.send(Envelope::Disconnected(e.to_string())).ok();
                break;
            }
        };
        reader.input(&buf[..n]);

        while let Some(payload) = reader.decode_next() {
            match proto::FromRadio::decode(payload.as_slice()) {
                Ok(msg) => {
                    if let Some(envelope) = envelope(msg) {
                        // Applying backpressure here would stall the serial
                        // reader, so a full channel drops the oldest work on
                        // the consumer's side instead: block briefly, then
                        // drop the envelope.
                        if tx
                            .send_timeout(envelope, time::Duration::from_secs(1))
                            .is_err()
                        {
                            log::warn!(target: "mesh", "Inbound channel full; dropping packet");
                        }
                    }
                }
                Err(e) => {
                    // Corrupt payload inside a valid frame; skip it.
                    log::warn!(target: "mesh", "Dropping undecodable frame: {e}");
                }
            }
        }
        let skipped = reader.take_skipped();
        if skipped > 0 {
            log::debug!(target: "mesh", "Skipped {skipped} non-frame bytes");
        }
    }
}

/// Map a decoded device record onto the envelope stream.
fn envelope(msg: proto::FromRadio) -> Option<Envelope> {
    use proto::from_radio::PayloadVariant;

    match msg.payload_variant? {
        PayloadVariant::Packet(packet) => Some(Envelope::Packet(packet)),
        PayloadVariant::MyInfo(info) => Some(Envelope::MyNodeInfo(info.my_node_num)),
        PayloadVariant::NodeInfo(info) => Some(Envelope::NodeInfo(info)),
        PayloadVariant::ConfigCompleteId(id) => Some(Envelope::Configured(id)),
        PayloadVariant::Rebooted(true) => Some(Envelope::Rebooted),
        PayloadVariant::Rebooted(false) => None,
    }
}
