//! Identity types shared between the mesh and the station network.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A mesh node number, as assigned by the radio firmware.
///
/// Numbers below [`REMOTE_NODE_BASE`] belong to radios heard directly on the
/// local mesh; numbers at or above it are synthetic, minted by the registry
/// for nodes that live behind a remote station.
pub type NodeId = u32;

/// First synthetic node id handed out for remote nodes.
pub const REMOTE_NODE_BASE: NodeId = 5000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StationIdError {
    #[error("station id must be between 3 and 20 characters, got {0}")]
    Length(usize),
    #[error("station id contains invalid character `{0}`")]
    InvalidCharacter(char),
    #[error("station id must not start or end with a dash")]
    Dash,
}

/// A station identifier, unique per rendezvous service.
///
/// Lowercase alphanumerics and inner dashes only: `^[a-z0-9][a-z0-9-]{1,18}[a-z0-9]$`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StationId(String);

impl StationId {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for StationId {
    type Err = StationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 3 || s.len() > 20 {
            return Err(StationIdError::Length(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(StationIdError::InvalidCharacter(c));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(StationIdError::Dash);
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for StationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_station_id_valid() {
        for id in ["abc", "base-station-1", "x9z", "a-b-c", "12345678901234567890"] {
            assert!(id.parse::<StationId>().is_ok(), "{id} should parse");
        }
    }

    #[test]
    fn test_station_id_invalid() {
        assert_eq!(
            "ab".parse::<StationId>(),
            Err(StationIdError::Length(2)),
        );
        assert_eq!(
            "123456789012345678901".parse::<StationId>(),
            Err(StationIdError::Length(21)),
        );
        assert_eq!(
            "Uppercase".parse::<StationId>(),
            Err(StationIdError::InvalidCharacter('U')),
        );
        assert_eq!(
            "under_score".parse::<StationId>(),
            Err(StationIdError::InvalidCharacter('_')),
        );
        assert_eq!("-abc".parse::<StationId>(), Err(StationIdError::Dash));
        assert_eq!("abc-".parse::<StationId>(), Err(StationIdError::Dash));
    }

    #[test]
    fn test_station_id_serde() {
        let id: StationId = serde_json::from_str("\"relay-west\"").unwrap();
        assert_eq!(id.as_str(), "relay-west");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"relay-west\"");

        assert!(serde_json::from_str::<StationId>("\"-bad-\"").is_err());
    }
}
