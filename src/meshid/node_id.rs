use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IdError;

/// 32-bit address of a mesh participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Broadcast to every node
    pub const BROADCAST: NodeId = NodeId(0xFFFF_FFFF);

    /// Broadcast over MQTT / BLE only, never over LoRa
    pub const BROADCAST_NO_LORA: NodeId = NodeId(1);

    /// Placeholder for "no node"
    pub const UNKNOWN: NodeId = NodeId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST || self == Self::BROADCAST_NO_LORA
    }

    /// Low byte, used by the firmware to identify relays (`relay_node`)
    pub fn low_byte(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Synthetic EUI-48 address for this node.
    ///
    /// Only meant for synthetic (non-radio) identities: the first byte marks
    /// the address as locally administered.
    pub fn to_mac_address(self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [0x0A, 0x00, b[0], b[1], b[2], b[3]]
    }

    /// RGB color used by the mesh apps to render this node
    pub fn color(self) -> (u8, u8, u8) {
        (
            ((self.0 & 0xFF_0000) >> 16) as u8,
            ((self.0 & 0x00_FF00) >> 8) as u8,
            (self.0 & 0x00_00FF) as u8,
        )
    }

    /// Default (long, short) names for a node that never announced itself
    pub fn default_names(self) -> (String, String) {
        let name = self.to_string();
        let short = name[name.len() - 4..].to_string();
        (format!("Meshtastic {}", short), short)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u32 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_node_id(s)
    }
}

/// Parse a node ID in `!abcd1234` or `abcd1234` form
pub fn parse_node_id(input: &str) -> Result<NodeId, IdError> {
    let hex_part = input.strip_prefix('!').unwrap_or(input);
    if hex_part.is_empty() || hex_part.len() > 8 || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(IdError::InvalidNodeId(input.to_string()));
    }
    u32::from_str_radix(hex_part, 16)
        .map(NodeId)
        .map_err(|_| IdError::InvalidNodeId(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fixed_width() {
        assert_eq!(NodeId(0x1a2b).to_string(), "!00001a2b");
        assert_eq!(NodeId::BROADCAST.to_string(), "!ffffffff");
        assert_eq!(NodeId::BROADCAST_NO_LORA.to_string(), "!00000001");
    }

    #[test]
    fn test_parse_roundtrip_sentinels_and_samples() {
        for n in [0u32, 1, 0xFF, 0x1234_5678, 0xDEAD_BEEF, u32::MAX] {
            let id = NodeId(n);
            assert_eq!(parse_node_id(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn test_parse_without_prefix() {
        assert_eq!(parse_node_id("deadbeef").unwrap(), NodeId(0xDEAD_BEEF));
        assert_eq!("!DEADBEEF".parse::<NodeId>().unwrap(), NodeId(0xDEAD_BEEF));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_node_id("").is_err());
        assert!(parse_node_id("!").is_err());
        assert!(parse_node_id("!123456789").is_err());
        assert!(parse_node_id("!zzzz").is_err());
        assert!(parse_node_id("!+1234").is_err());
    }

    #[test]
    fn test_mac_address_is_locally_administered() {
        let mac = NodeId(0x1122_3344).to_mac_address();
        assert_eq!(mac, [0x0A, 0x00, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(mac[0] & 0x02, 0x02);
    }

    #[test]
    fn test_default_names_use_low_hex_digits() {
        let (long, short) = NodeId(0x1234_abcd).default_names();
        assert_eq!(short, "abcd");
        assert_eq!(long, "Meshtastic abcd");
    }

    #[test]
    fn test_color() {
        assert_eq!(NodeId(0xFF12_3456).color(), (0x12, 0x34, 0x56));
    }
}
