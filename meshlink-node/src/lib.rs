//! The Meshlink bridging station daemon.
//!
//! Links a locally attached LoRa radio (spoken to over a serial link) with
//! remote peer stations reachable over the Internet. Users on the local mesh
//! address remote identities with `@target text`; the station delivers
//! locally, forwards to the right peer station, or queues the message for
//! later delivery.
pub mod discovery;
pub mod mesh;
pub mod parser;
pub mod p2p;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod scheduler;
pub mod service;

pub use meshlink::node::{NodeId, StationId, REMOTE_NODE_BASE};
pub use meshlink_crypto as crypto;
pub use runtime::Runtime;

pub use localtime::{LocalDuration, LocalTime};

/// A node is considered online if it was heard within this window.
pub const ONLINE_WINDOW: LocalDuration = LocalDuration::from_mins(5);
