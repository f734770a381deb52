//! Meshlink station library.
//!
//! Shared building blocks for the station daemon: the on-disk profile
//! (configuration and key material), logging, and the identity types used
//! across the mesh and the station-to-station network.
pub mod logger;
pub mod node;
pub mod profile;

pub use meshlink_crypto as crypto;
pub use node::{NodeId, StationId};
pub use profile::{Config, Home};

/// Environment variables used by meshlink.
pub mod env {
    pub use std::env::*;

    /// Path to the meshlink home folder.
    pub const MESHLINK_HOME: &str = "MESHLINK_HOME";
    /// Pre-shared secret protecting contact info on the discovery service.
    pub const MESHLINK_DISCOVERY_SECRET: &str = "MESHLINK_DISCOVERY_SECRET";
    /// When set, discovery short-circuits HTTP against local test hosts.
    pub const MESHLINK_TEST: &str = "MESHLINK_TEST";

    /// Shared discovery secret, or the compiled-in default.
    pub fn discovery_secret() -> String {
        var(MESHLINK_DISCOVERY_SECRET).unwrap_or_else(|_| "meshlink-discovery".to_owned())
    }

    /// Whether the test environment marker is set.
    pub fn test_mode() -> bool {
        var(MESHLINK_TEST).is_ok()
    }
}
