//! Events dispatched by the mesh client.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::meshid::NodeId;

/// Common metadata attached to every inbound packet event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshEnvelope {
    pub channel: String,
    pub channel_key: Option<String>,
    pub from: NodeId,
    pub to: NodeId,
    /// Node the packet was last observed through (`NodeId::UNKNOWN` if not known)
    pub via: NodeId,
    pub timestamp: u32,
    pub packet_id: u32,
    pub want_ack: bool,
    pub want_response: bool,
    /// Packet reached us without consuming a hop
    pub is_neighbor: bool,
    pub via_mqtt: bool,
}

impl MeshEnvelope {
    pub fn is_direct_message(&self) -> bool {
        !self.to.is_broadcast()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEvent {
    pub envelope: MeshEnvelope,
    pub text: String,
    pub reply_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactionEvent {
    pub envelope: MeshEnvelope,
    pub emoji: String,
    pub reply_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationEvent {
    pub envelope: MeshEnvelope,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub ground_speed: Option<u32>,
    pub ground_track: Option<u32>,
    pub precision_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaypointEvent {
    pub envelope: MeshEnvelope,
    pub id: u32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub name: String,
    pub description: String,
    pub icon: Option<char>,
    pub locked_to: NodeId,
    pub expire: u32,
    /// The sender deleted this waypoint by expiring it
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfoEvent {
    pub envelope: MeshEnvelope,
    pub long_name: String,
    pub short_name: String,
    /// Base64 X25519 public key, if the node advertises one
    pub public_key: Option<String>,
    pub hw_model: i32,
    pub role: i32,
    pub is_unmessagable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapReportEvent {
    pub envelope: MeshEnvelope,
    pub long_name: String,
    pub short_name: String,
    pub role: i32,
    pub hw_model: i32,
    pub firmware_version: String,
    pub region: i32,
    pub modem_preset: i32,
    pub has_default_channel: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    pub position_precision: u32,
    pub num_online_local_nodes: u32,
}

/// An outbound traceroute still waiting for its response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTraceroute {
    pub from: NodeId,
    pub target: NodeId,
    pub channel: String,
    /// Caller-supplied tag used to route the answer back (e.g. a room ID)
    pub context: String,
    #[serde(skip)]
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerouteEvent {
    pub envelope: MeshEnvelope,
    pub request_id: u32,
    pub route: Vec<NodeId>,
    /// SNR × 4 per hop; -128 means unknown
    pub snr_towards: Vec<i32>,
    pub route_back: Vec<NodeId>,
    pub snr_back: Vec<i32>,
    pub pending: Option<PendingTraceroute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckEvent {
    pub envelope: MeshEnvelope,
    pub request_id: u32,
    pub error_reason: i32,
}

impl AckEvent {
    pub fn is_success(&self) -> bool {
        self.error_reason == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelJoinedEvent {
    pub channel: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected { restarted: bool },
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
    Location(LocationEvent),
    Waypoint(WaypointEvent),
    NodeInfo(NodeInfoEvent),
    MapReport(MapReportEvent),
    Traceroute(TracerouteEvent),
    Ack(AckEvent),
    ChannelJoined(ChannelJoinedEvent),
    ConnectionState(ConnectionState),
}

impl MeshEvent {
    pub fn envelope(&self) -> Option<&MeshEnvelope> {
        match self {
            MeshEvent::Message(e) => Some(&e.envelope),
            MeshEvent::Reaction(e) => Some(&e.envelope),
            MeshEvent::Location(e) => Some(&e.envelope),
            MeshEvent::Waypoint(e) => Some(&e.envelope),
            MeshEvent::NodeInfo(e) => Some(&e.envelope),
            MeshEvent::MapReport(e) => Some(&e.envelope),
            MeshEvent::Traceroute(e) => Some(&e.envelope),
            MeshEvent::Ack(e) => Some(&e.envelope),
            MeshEvent::ChannelJoined(_) | MeshEvent::ConnectionState(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::Message(_) => "message",
            MeshEvent::Reaction(_) => "reaction",
            MeshEvent::Location(_) => "location",
            MeshEvent::Waypoint(_) => "waypoint",
            MeshEvent::NodeInfo(_) => "node_info",
            MeshEvent::MapReport(_) => "map_report",
            MeshEvent::Traceroute(_) => "traceroute",
            MeshEvent::Ack(_) => "ack",
            MeshEvent::ChannelJoined(_) => "channel_joined",
            MeshEvent::ConnectionState(_) => "connection_state",
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(to: NodeId) -> MeshEnvelope {
        MeshEnvelope {
            channel: "LongFast".into(),
            channel_key: Some("AQ==".into()),
            from: NodeId(0x10),
            to,
            via: NodeId::UNKNOWN,
            timestamp: 0,
            packet_id: 5,
            want_ack: false,
            want_response: false,
            is_neighbor: true,
            via_mqtt: false,
        }
    }

    #[test]
    fn test_direct_message_detection() {
        assert!(!envelope(NodeId::BROADCAST).is_direct_message());
        assert!(envelope(NodeId(0x20)).is_direct_message());
    }

    #[test]
    fn test_json_tagging() {
        let evt = MeshEvent::Message(MessageEvent {
            envelope: envelope(NodeId::BROADCAST),
            text: "hi".into(),
            reply_id: 0,
        });
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["envelope"]["from"], 16);

        let state = MeshEvent::ConnectionState(ConnectionState::Connected { restarted: true });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], "connection_state");
        assert_eq!(json["state"], "connected");
        assert_eq!(json["restarted"], true);
    }

    #[test]
    fn test_envelope_accessor() {
        let evt = MeshEvent::ChannelJoined(ChannelJoinedEvent {
            channel: "x".into(),
            key: None,
        });
        assert!(evt.envelope().is_none());
        assert_eq!(evt.kind(), "channel_joined");
    }
}
