//! Radio protobuf surface.
//!
//! Hand-maintained `prost` types for the subset of the device protocol the
//! station consumes. The wire format is fixed by the radio firmware; only
//! text-message payloads are interpreted, everything else passes through or
//! is ignored.

/// Broadcast destination address.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Application port of a decoded payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    TelemetryApp = 67,
}

/// A single application payload carried by a mesh packet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
}

/// A packet heard on, or destined for, the mesh.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(uint32, tag = "1")]
    pub from: u32,
    #[prost(uint32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: ::core::option::Option<mesh_packet::PayloadVariant>,
    #[prost(uint32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        /// Plaintext payload, decoded by the radio.
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        /// Payload the radio could not decrypt; opaque to the station.
        #[prost(bytes, tag = "5")]
        Encrypted(::prost::alloc::vec::Vec<u8>),
    }
}

/// Identity broadcast by a node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub long_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub short_name: ::prost::alloc::string::String,
}

/// Geographic fix of a node. Opaque to the station; stored as-is.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

/// The radio's node-database entry for a mesh neighbour.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: ::core::option::Option<Position>,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
}

/// The attached radio's own identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

/// Device-to-host message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 7, 8")]
    pub payload_variant: ::core::option::Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        /// Echoes the id passed with the configuration request once the full
        /// node database has been streamed.
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
    }
}

/// Host-to-device message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: ::core::option::Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        /// Ask the device to stream its configuration and node database.
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

/// Protocol-level keep-alive; keeps the serial session open on the device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {}

impl ToRadio {
    /// A text message addressed to `to`.
    pub fn text(text: &str, to: u32, id: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Packet(MeshPacket {
                from: 0,
                to,
                channel: 0,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                    portnum: PortNum::TextMessageApp as i32,
                    payload: text.as_bytes().to_vec(),
                    want_response: false,
                })),
                id,
                rx_time: 0,
                hop_limit: 3,
                want_ack: to != BROADCAST_ADDR,
            })),
        }
    }

    pub fn want_config(id: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(id)),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat {})),
        }
    }
}

impl MeshPacket {
    /// The decoded text payload, if this is a text-message packet.
    pub fn text(&self) -> Option<&str> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data))
                if data.portnum == PortNum::TextMessageApp as i32 =>
            {
                std::str::from_utf8(&data.payload).ok()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_text_roundtrip() {
        let out = ToRadio::text("hello mesh", 101, 7);
        let bytes = out.encode_to_vec();
        let back = ToRadio::decode(bytes.as_slice()).unwrap();

        assert_eq!(back, out);
        match back.payload_variant {
            Some(to_radio::PayloadVariant::Packet(p)) => {
                assert_eq!(p.to, 101);
                assert_eq!(p.text(), Some("hello mesh"));
                assert!(p.want_ack);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_wants_no_ack() {
        let out = ToRadio::text("fanout", BROADCAST_ADDR, 1);
        match out.payload_variant {
            Some(to_radio::PayloadVariant::Packet(p)) => assert!(!p.want_ack),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_from_radio_roundtrip() {
        let info = FromRadio {
            id: 3,
            payload_variant: Some(from_radio::PayloadVariant::NodeInfo(NodeInfo {
                num: 101,
                user: Some(User {
                    id: "!0065".to_owned(),
                    long_name: "Alice Base".to_owned(),
                    short_name: "ALCE".to_owned(),
                }),
                position: None,
                last_heard: 1_700_000_000,
            })),
        };
        let bytes = info.encode_to_vec();

        assert_eq!(FromRadio::decode(bytes.as_slice()).unwrap(), info);
    }

    #[test]
    fn test_non_text_packet_has_no_text() {
        let p = MeshPacket {
            from: 1,
            to: 2,
            channel: 0,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::PositionApp as i32,
                payload: vec![1, 2, 3],
                want_response: false,
            })),
            id: 0,
            rx_time: 0,
            hop_limit: 0,
            want_ack: false,
        };
        assert_eq!(p.text(), None);
    }
}
