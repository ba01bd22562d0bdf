//! Node addressing, channel key material and locations.

pub mod channel_def;
pub mod geo;
pub mod node_id;

pub use channel_def::ChannelDef;
pub use geo::{precision_bits, precision_in_meters, GeoUri};
pub use node_id::{parse_node_id, NodeId};
