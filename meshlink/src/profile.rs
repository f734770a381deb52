//! Station profile.
//!
//!   $MESHLINK_HOME/                       # Meshlink home (default ~/.meshlink)
//!     encryptedmeshlink-config.json       # Station configuration and keys
//!     node/
//!       messages.db                       # Persistent message queue
//!
//! The configuration file is an external contract: field names are camelCase
//! and keys are stored PEM-armored, so it stays interchangeable with other
//! implementations of the station.
use std::path::{Path, PathBuf};
use std::{fs, io};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json as json;
use thiserror::Error;

use crate::crypto::{KeyError, KeyPair, PublicKey, SecretKey};
use crate::env;
use crate::node::StationId;

/// Name of the configuration file under the meshlink home.
pub const CONFIG_FILE: &str = "encryptedmeshlink-config.json";
/// Filename of the message queue database under the `node` directory.
pub const QUEUE_DB_FILE: &str = "messages.db";

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration JSON error: {0}")]
    Json(#[from] json::Error),
    #[error("configuration key error: {0}")]
    Key(#[from] KeyError),
    #[error("configured keys are not a matching pair")]
    KeyMismatch,
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// PEM-armored station key pair, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keys {
    pub public_key: String,
    pub private_key: String,
}

impl Keys {
    /// Parse the armored keys and check that they form a pair.
    pub fn pair(&self) -> Result<KeyPair, Error> {
        let public = PublicKey::from_pem(&self.public_key)?;
        let secret = SecretKey::from_pem(&self.private_key)?;

        if secret.public_key() != public {
            return Err(Error::KeyMismatch);
        }
        Ok(KeyPair { public, secret })
    }
}

impl From<&KeyPair> for Keys {
    fn from(kp: &KeyPair) -> Self {
        Self {
            public_key: kp.public.to_pem(),
            private_key: kp.secret.to_pem(),
        }
    }
}

/// Rendezvous service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub service_url: String,
    /// Heartbeat interval in seconds.
    #[serde(default = "defaults::check_interval")]
    pub check_interval: u64,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "defaults::timeout")]
    pub timeout: u64,
}

/// Station-to-station network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2p {
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// Dial timeout in seconds.
    #[serde(default = "defaults::connection_timeout")]
    pub connection_timeout: u64,
}

impl Default for P2p {
    fn default() -> Self {
        Self {
            listen_port: defaults::listen_port(),
            max_connections: defaults::max_connections(),
            connection_timeout: defaults::connection_timeout(),
        }
    }
}

/// Attached radio settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mesh {
    #[serde(default = "defaults::auto_detect")]
    pub auto_detect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
}

impl Default for Mesh {
    fn default() -> Self {
        Self {
            auto_detect: defaults::auto_detect(),
            device_path: None,
            baud_rate: defaults::baud_rate(),
        }
    }
}

/// Bookkeeping written by whoever created or last touched the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
}

impl Metadata {
    fn now() -> Self {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Self {
            created_at: now.clone(),
            updated_at: now,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Station configuration. Immutable after load, except for the listen port
/// fallback which is persisted through [`Config::write`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub station_id: StationId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub keys: Keys,
    pub discovery: Discovery,
    #[serde(default)]
    pub p2p: P2p,
    #[serde(default)]
    pub mesh: Mesh,
    pub metadata: Metadata,
}

impl Config {
    /// Create a configuration with fresh keys and default settings.
    pub fn new(station_id: StationId, display_name: impl Into<String>, service_url: impl Into<String>) -> Self {
        let keys = KeyPair::generate();

        Self {
            station_id,
            display_name: display_name.into(),
            location: None,
            operator: None,
            keys: Keys::from(&keys),
            discovery: Discovery {
                service_url: service_url.into(),
                check_interval: defaults::check_interval(),
                timeout: defaults::timeout(),
            },
            p2p: P2p::default(),
            mesh: Mesh::default(),
            metadata: Metadata::now(),
        }
    }

    /// Load and validate a configuration from the given path.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let cfg: Self = json::from_reader(fs::File::open(path)?)?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Check invariants that `serde` cannot express.
    ///
    /// The station id pattern is enforced by [`StationId`] at parse time.
    pub fn validate(&self) -> Result<(), Error> {
        self.keys.pair()?;

        if self.display_name.trim().is_empty() {
            return Err(Error::Invalid("displayName must not be empty"));
        }
        if self.discovery.service_url.is_empty() {
            return Err(Error::Invalid("discovery.serviceUrl must not be empty"));
        }
        if self.discovery.check_interval == 0 {
            return Err(Error::Invalid("discovery.checkInterval must be non-zero"));
        }
        if self.discovery.timeout == 0 {
            return Err(Error::Invalid("discovery.timeout must be non-zero"));
        }
        if self.p2p.listen_port == 0 {
            return Err(Error::Invalid("p2p.listenPort must be non-zero"));
        }
        if self.p2p.max_connections == 0 {
            return Err(Error::Invalid("p2p.maxConnections must be non-zero"));
        }
        if self.p2p.connection_timeout == 0 {
            return Err(Error::Invalid("p2p.connectionTimeout must be non-zero"));
        }
        if self.mesh.baud_rate == 0 {
            return Err(Error::Invalid("mesh.baudRate must be non-zero"));
        }
        Ok(())
    }

    /// Write the configuration to disk atomically, bumping `updatedAt`.
    pub fn write(&mut self, path: &Path) -> Result<(), Error> {
        self.metadata.updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        json::to_writer_pretty(&mut tmp, self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// The parsed station key pair.
    ///
    /// Only valid after [`Config::validate`]; loading validates.
    pub fn key_pair(&self) -> Result<KeyPair, Error> {
        self.keys.pair()
    }
}

/// Get the path to the meshlink home folder.
pub fn home() -> Result<Home, io::Error> {
    if let Some(home) = env::var_os(env::MESHLINK_HOME) {
        Home::new(PathBuf::from(home))
    } else if let Some(home) = env::var_os("HOME") {
        Home::new(PathBuf::from(home).join(".meshlink"))
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Neither `MESHLINK_HOME` nor `HOME` are set",
        ))
    }
}

/// Meshlink home.
#[derive(Debug, Clone)]
pub struct Home {
    path: PathBuf,
}

impl Home {
    /// Create the home directory and its subdirectories if missing.
    pub fn new(home: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let path = home.into();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        let home = Self {
            path: path.canonicalize()?,
        };
        let node = home.node();
        if !node.exists() {
            fs::create_dir_all(&node)?;
        }
        Ok(home)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn config(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn node(&self) -> PathBuf {
        self.path.join("node")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.node().join(QUEUE_DB_FILE)
    }
}

mod defaults {
    pub(super) fn check_interval() -> u64 {
        30
    }
    pub(super) fn timeout() -> u64 {
        10
    }
    pub(super) fn listen_port() -> u16 {
        8447
    }
    pub(super) fn max_connections() -> usize {
        10
    }
    pub(super) fn connection_timeout() -> u64 {
        10
    }
    pub(super) fn auto_detect() -> bool {
        true
    }
    pub(super) fn baud_rate() -> u32 {
        115_200
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> Config {
        Config::new(
            "test-station".parse().unwrap(),
            "Test Station",
            "https://discovery.example.com",
        )
    }

    #[test]
    fn test_config_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        let mut cfg = config();
        cfg.write(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.station_id, cfg.station_id);
        assert_eq!(loaded.display_name, cfg.display_name);
        assert_eq!(
            loaded.key_pair().unwrap().public,
            cfg.key_pair().unwrap().public
        );
    }

    #[test]
    fn test_config_defaults() {
        let cfg = config();
        assert_eq!(cfg.discovery.check_interval, 30);
        assert_eq!(cfg.p2p.listen_port, 8447);
        assert_eq!(cfg.p2p.max_connections, 10);
        assert_eq!(cfg.mesh.baud_rate, 115_200);
        assert!(cfg.mesh.auto_detect);
    }

    #[test]
    fn test_config_camel_case() {
        let cfg = config();
        let value = json::to_value(&cfg).unwrap();

        assert!(value.get("stationId").is_some());
        assert!(value.get("displayName").is_some());
        assert!(value["keys"].get("publicKey").is_some());
        assert!(value["discovery"].get("serviceUrl").is_some());
        assert!(value["p2p"].get("listenPort").is_some());
        assert!(value["mesh"].get("autoDetect").is_some());
        assert!(value["metadata"].get("createdAt").is_some());
    }

    #[test]
    fn test_config_key_mismatch() {
        let mut cfg = config();
        let other = crate::crypto::KeyPair::generate();
        cfg.keys.public_key = other.public.to_pem();

        assert!(matches!(cfg.validate(), Err(Error::KeyMismatch)));
    }

    #[test]
    fn test_config_invalid_fields() {
        let mut cfg = config();
        cfg.discovery.check_interval = 0;
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));

        let mut cfg = config();
        cfg.display_name = "  ".to_owned();
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));

        let mut cfg = config();
        cfg.p2p.listen_port = 0;
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_config_rejects_bad_station_id() {
        let json = json::json!({
            "stationId": "Bad_Id",
            "displayName": "x",
            "keys": { "publicKey": "", "privateKey": "" },
            "discovery": { "serviceUrl": "https://x" },
            "metadata": { "createdAt": "", "updatedAt": "", "version": "" },
        });
        assert!(json::from_value::<Config>(json).is_err());
    }

    #[test]
    fn test_home_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::new(tmp.path().join("meshlink")).unwrap();

        assert!(home.node().exists());
        assert!(home.config().ends_with(CONFIG_FILE));
        assert!(home.queue_db().ends_with("node/messages.db"));
    }
}
