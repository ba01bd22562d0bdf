//! Mesh protocol client core for a chat bridge.
//!
//! Speaks the Meshtastic wire protocol over MQTT and UDP multicast:
//! channel and direct-message encryption, duplicate suppression, packet
//! classification, traceroute bookkeeping and throttled auto-responses.

pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod events;
pub mod meshid;
pub mod network;
pub mod packet_id;
pub mod protobufs;
pub mod shutdown;

pub use client::{
    EncryptionType, MeshClient, MeshClientConfig, PacketInfo, TracerouteOutcome,
};
pub use error::{AppError, CryptoError, IdError, MeshError, MeshResult, TransportError};
pub use events::{ConnectionState, EventHandler, MeshEnvelope, MeshEvent};
pub use meshid::{parse_node_id, ChannelDef, GeoUri, NodeId};
