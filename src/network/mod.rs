pub mod dedup_filter;
pub mod mqtt;
pub mod multicast;
pub mod rate_limiter;
pub mod transport;

pub use mqtt::{MqttTransport, MqttTransportConfig};
pub use multicast::MulticastTransport;
pub use transport::{
    ListenerEvent, MeshTransport, NetworkMeshPacket, PacketHandler, PacketSource, StateHandler,
};
