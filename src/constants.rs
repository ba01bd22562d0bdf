//! Protocol constants shared by the codec, transports and client.
//!
//! Values marked "firmware" must match the deployed mesh firmware exactly;
//! changing them breaks interoperability with real radios.

use std::time::Duration;

/// Protocol-level constants
pub mod protocol {
    /// Max encoded `Data` length accepted by the firmware (firmware: `DATA_PAYLOAD_LEN`)
    pub const DATA_PAYLOAD_LEN: usize = 233;

    /// Largest application payload we will put inside a `Data` record.
    /// One byte of headroom below the firmware limit.
    pub const MAX_APP_PAYLOAD_LEN: usize = DATA_PAYLOAD_LEN - 1;

    /// Maximum hop count the firmware will honor
    pub const MAX_HOPS: u32 = 7;

    /// Default hop limit for new packets (firmware default)
    pub const DEFAULT_HOP_LIMIT: u32 = 3;

    /// Name of the default public channel
    pub const DEFAULT_CHANNEL_NAME: &str = "LongFast";

    /// Channel name used for node-addressed (PKI) traffic
    pub const PKI_CHANNEL_NAME: &str = "PKI";

    /// Well-known default channel key (firmware: `defaultpsk`)
    pub const DEFAULT_KEY: [u8; 16] = [
        0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
        0x01,
    ];

    /// `Data.bitfield` flag: sender is OK with the packet being relayed over MQTT
    pub const BITFIELD_OK_TO_MQTT: u32 = 1;

    /// `Data.bitfield` flag: sender wants a response
    pub const BITFIELD_WANT_RESPONSE: u32 = 1 << 1;

    /// SNR value meaning "unknown" in traceroute SNR lists (firmware: `INT8_MIN`)
    pub const SNR_UNKNOWN: i32 = i8::MIN as i32;

    /// Max neighbors carried in a NeighborInfo packet (mesh.options)
    pub const MAX_NEIGHBORS: usize = 10;

    /// Max bytes in a long name
    pub const MAX_LONG_NAME_LEN: usize = 39;

    /// Max bytes in a short name
    pub const MAX_SHORT_NAME_LEN: usize = 4;
}

/// Packet-ID allocation (firmware `generatePacketId`)
pub mod packet_id {
    /// Bits of the rolling counter kept in each ID
    pub const COUNTER_BITS: u32 = 10;

    /// Mask selecting the counter bits
    pub const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;
}

/// Transport constants
pub mod transport {
    use super::Duration;

    /// Local multicast group used by firmware 2.6+ for UDP mesh traffic
    pub const MULTICAST_GROUP: &str = "224.0.0.69";

    /// Multicast port
    pub const MULTICAST_PORT: u16 = 4403;

    /// Receive buffer size for multicast datagrams
    pub const MULTICAST_READ_BUFFER: usize = 2048;

    /// First reconnect delay for the multicast listener
    pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

    /// Upper bound on the reconnect delay
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

    /// Delay before publishing to the broker so other transports win the race
    pub const MQTT_PUBLISH_DELAY: Duration = Duration::from_millis(200);

    /// Delay before processing packets that arrived via the broker
    pub const MQTT_RECEIVE_DELAY: Duration = Duration::from_millis(500);

    /// Capacity of the MQTT client request channel
    pub const MQTT_CHANNEL_CAPACITY: usize = 64;

    /// Default MQTT broker port
    pub const MQTT_DEFAULT_PORT: u16 = 1883;

    /// Default MQTT keep-alive
    pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
}

/// Timing policy for caches, throttles and traceroutes
pub mod timing {
    use super::Duration;

    /// How long a (from, packet_id) pair is remembered for duplicate suppression
    pub const DEDUP_TTL: Duration = Duration::from_secs(2 * 60 * 60);

    /// Cooldown between automatic telemetry / neighbor-info responses per node (firmware: 3 min)
    pub const REQUEST_THROTTLE: Duration = Duration::from_secs(3 * 60);

    /// Firmware-enforced minimum time between traceroutes for a (from, to) pair
    pub const TRACEROUTE_COOLDOWN: Duration = Duration::from_secs(30);

    /// How long to wait for a traceroute response before forgetting the request
    pub const TRACEROUTE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Minimum interval between NodeInfo broadcasts from the same node
    pub const NODE_INFO_RESEND_GUARD: Duration = Duration::from_secs(5 * 60);

    /// Interval of the background maintenance sweep
    pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

    /// Default NeighborInfo broadcast interval advertised to the mesh
    pub const NEIGHBOR_BROADCAST_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60 + 31);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_headroom() {
        assert_eq!(protocol::MAX_APP_PAYLOAD_LEN, 232);
    }

    #[test]
    fn test_counter_mask_width() {
        assert_eq!(packet_id::COUNTER_MASK, 0x3FF);
        assert_eq!(packet_id::COUNTER_MASK.count_ones(), 10);
    }

    #[test]
    fn test_snr_unknown_sentinel() {
        assert_eq!(protocol::SNR_UNKNOWN, -128);
    }
}
