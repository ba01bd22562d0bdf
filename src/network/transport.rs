//! Transport abstraction shared by the broker and multicast connectors.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;
use crate::meshid::NodeId;
use crate::protobufs::MeshPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketSource {
    /// Received from an MQTT broker
    Mqtt,
    /// Received from the local UDP multicast group (firmware 2.6+)
    Udp,
    /// Injected by an in-process transport
    Local,
}

impl fmt::Display for PacketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketSource::Mqtt => write!(f, "mqtt"),
            PacketSource::Udp => write!(f, "udp"),
            PacketSource::Local => write!(f, "local"),
        }
    }
}

/// A packet as handed over by a transport
#[derive(Debug, Clone)]
pub struct NetworkMeshPacket {
    pub packet: MeshPacket,
    /// Channel name, when the transport knows it (the broker does, multicast does not)
    pub channel_name: Option<String>,
    /// Node that uplinked the packet, when the transport reports one
    pub gateway: Option<NodeId>,
    pub source: PacketSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Started,
    Restarted,
    ConnectionLost,
}

pub type PacketHandler = Arc<dyn Fn(NetworkMeshPacket) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ListenerEvent) + Send + Sync>;

/// A live link to the mesh.
///
/// Implementations own their read/reconnect loop; the client only starts,
/// stops and sends, and learns about inbound traffic and link state through
/// the registered handlers.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<(), TransportError>;

    /// Stop the read loop and release the socket. Safe to call more than once.
    async fn stop(&self);

    fn is_connected(&self) -> bool;

    /// Begin listening on a channel. Idempotent; remembered across reconnects.
    async fn add_channel(&self, channel: &str);

    async fn send_packet(&self, channel: &str, packet: &MeshPacket) -> Result<(), TransportError>;

    fn set_packet_handler(&self, handler: PacketHandler);

    fn set_state_handler(&self, handler: StateHandler);
}
