//! Outbound pipeline: build, guard, encrypt and fan out a packet.

use futures_util::future::join_all;
use prost::Message;

use super::MeshClient;
use crate::constants::protocol::{
    BITFIELD_OK_TO_MQTT, BITFIELD_WANT_RESPONSE, MAX_APP_PAYLOAD_LEN, PKI_CHANNEL_NAME,
};
use crate::crypto::{channel_hash, parse_key, pki_encrypt, psk_xor, public_key_from_private};
use crate::error::{MeshError, MeshResult};
use crate::meshid::{ChannelDef, NodeId};
use crate::protobufs::{mesh_packet::PayloadVariant, Data, MeshPacket, PortNum, Priority};

/// How a packet's payload is protected on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Sent decoded, in the clear
    None,
    /// Channel pre-shared key
    Psk,
    /// Node-to-node public key encryption
    Pki,
}

/// Outbound packet descriptor
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub port: PortNum,
    pub encryption: EncryptionType,
    pub from: NodeId,
    pub to: NodeId,
    pub request_id: u32,
    pub reply_id: u32,
    pub want_ack: bool,
    pub want_response: bool,
    pub emoji: bool,
}

impl PacketInfo {
    pub fn new(port: PortNum, encryption: EncryptionType, from: NodeId, to: NodeId) -> Self {
        Self {
            port,
            encryption,
            from,
            to,
            request_id: 0,
            reply_id: 0,
            want_ack: false,
            want_response: false,
            emoji: false,
        }
    }
}

/// Firmware priority tier for an outbound packet
pub fn packet_priority(info: &PacketInfo) -> Priority {
    match info.port {
        PortNum::RoutingApp => Priority::Ack,
        PortNum::TextMessageApp | PortNum::AdminApp => Priority::High,
        _ if info.request_id != 0 => Priority::Response,
        _ if info.want_ack => Priority::Reliable,
        _ => Priority::Default,
    }
}

impl MeshClient {
    pub(crate) async fn send_proto<M: Message>(
        &self,
        channel: &ChannelDef,
        message: &M,
        info: PacketInfo,
    ) -> MeshResult<u32> {
        let mut payload = Vec::with_capacity(message.encoded_len());
        message.encode(&mut payload)?;
        self.send_bytes(channel, payload, info).await
    }

    /// Send a raw application payload. Returns the allocated packet ID.
    pub async fn send_bytes(
        &self,
        channel: &ChannelDef,
        payload: Vec<u8>,
        info: PacketInfo,
    ) -> MeshResult<u32> {
        if !self.is_managed(info.from) {
            return Err(MeshError::UnmanagedNode(info.from));
        }

        // Oversized payloads have corrupted the node database of receiving
        // devices on older firmware; never put them on the air
        if payload.len() > MAX_APP_PAYLOAD_LEN {
            return Err(MeshError::PayloadTooLarge {
                max: MAX_APP_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        let mut bitfield = BITFIELD_OK_TO_MQTT;
        if info.want_response {
            bitfield |= BITFIELD_WANT_RESPONSE;
        }
        let data = Data {
            portnum: info.port as i32,
            payload,
            want_response: info.want_response,
            request_id: info.request_id,
            reply_id: info.reply_id,
            emoji: u32::from(info.emoji),
            bitfield: Some(bitfield),
            ..Default::default()
        };

        let packet_id = self.inner.packet_ids.next_id();
        let hop_limit = self.hop_limit();
        // Relaying for another managed node costs the bridge one hop
        let hop_start = if info.from != self.node_id() {
            hop_limit + 1
        } else {
            hop_limit
        };

        let mut packet = MeshPacket {
            id: packet_id,
            from: info.from.as_u32(),
            to: info.to.as_u32(),
            hop_limit,
            hop_start,
            want_ack: info.want_ack,
            rx_time: chrono::Utc::now().timestamp() as u32,
            priority: packet_priority(&info) as i32,
            ..Default::default()
        };

        let channel_name = match info.encryption {
            EncryptionType::None => {
                packet.channel = 0;
                packet.payload_variant = Some(PayloadVariant::Decoded(data));
                channel.name().to_string()
            }
            EncryptionType::Psk => {
                let raw = data.encode_to_vec();
                packet.channel = channel_hash(channel.name(), channel.key_bytes()) as u32;
                packet.payload_variant = Some(PayloadVariant::Encrypted(psk_xor(
                    &raw,
                    channel.key_bytes(),
                    packet_id,
                    info.from.as_u32(),
                )?));
                channel.name().to_string()
            }
            EncryptionType::Pki => {
                if info.to.is_broadcast() {
                    return Err(MeshError::UnsupportedEncryption);
                }
                let private_key = self.private_key(info.from)?;
                let public_key = self.public_key(info.to)?;
                let raw = data.encode_to_vec();
                packet.channel = 0;
                packet.pki_encrypted = true;
                packet.public_key = public_key_from_private(&private_key)?.to_vec();
                packet.payload_variant = Some(PayloadVariant::Encrypted(pki_encrypt(
                    &raw,
                    &private_key,
                    &public_key,
                    packet_id,
                    info.from.as_u32(),
                )?));
                PKI_CHANNEL_NAME.to_string()
            }
        };

        tracing::debug!(
            "📤 Sending {:?} packet {} {} -> {} on {} ({:?})",
            info.port,
            packet_id,
            info.from,
            info.to,
            channel_name,
            info.encryption
        );

        self.fan_out(&channel_name, &packet).await?;
        Ok(packet_id)
    }

    /// Hand a finished packet to every transport concurrently. Succeeds if
    /// any transport accepted it.
    async fn fan_out(&self, channel: &str, packet: &MeshPacket) -> MeshResult<()> {
        let transports = self.transports();
        if transports.is_empty() {
            return Err(MeshError::NoTransports);
        }

        let results = join_all(transports.iter().map(|t| t.send_packet(channel, packet))).await;

        let mut errors = Vec::new();
        for (transport, result) in transports.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    "⚠️  {} transport failed to send packet {}: {}",
                    transport.name(),
                    packet.id,
                    e
                );
                errors.push(e);
            }
        }

        if errors.len() == transports.len() {
            return Err(MeshError::AllTransportsFailed(errors));
        }
        Ok(())
    }

    pub(crate) fn private_key(&self, node: NodeId) -> MeshResult<Vec<u8>> {
        let handler = self.inner.private_key_handler.read().clone();
        request_key(node, handler.as_deref())
    }

    pub(crate) fn public_key(&self, node: NodeId) -> MeshResult<Vec<u8>> {
        let handler = self.inner.public_key_handler.read().clone();
        request_key(node, handler.as_deref())
    }
}

fn request_key(
    node: NodeId,
    handler: Option<&(dyn Fn(NodeId) -> Option<String> + Send + Sync)>,
) -> MeshResult<Vec<u8>> {
    let key = handler
        .and_then(|h| h(node))
        .filter(|k| !k.is_empty())
        .ok_or(MeshError::KeyUnavailable(node))?;
    Ok(parse_key(&key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: PortNum) -> PacketInfo {
        PacketInfo::new(port, EncryptionType::Psk, NodeId(1), NodeId(2))
    }

    #[test]
    fn test_priority_tiers() {
        assert_eq!(packet_priority(&info(PortNum::RoutingApp)), Priority::Ack);
        assert_eq!(packet_priority(&info(PortNum::TextMessageApp)), Priority::High);
        assert_eq!(packet_priority(&info(PortNum::AdminApp)), Priority::High);

        let mut reply = info(PortNum::TelemetryApp);
        reply.request_id = 77;
        reply.want_ack = true;
        assert_eq!(packet_priority(&reply), Priority::Response);

        let mut reliable = info(PortNum::PositionApp);
        reliable.want_ack = true;
        assert_eq!(packet_priority(&reliable), Priority::Reliable);

        assert_eq!(packet_priority(&info(PortNum::NodeinfoApp)), Priority::Default);
    }

    #[test]
    fn test_text_outranks_request_id() {
        let mut text = info(PortNum::TextMessageApp);
        text.request_id = 5;
        assert_eq!(packet_priority(&text), Priority::High);
    }

    #[test]
    fn test_request_key_requires_non_empty_key() {
        let empty = |_: NodeId| Some(String::new());
        assert!(matches!(
            request_key(NodeId(3), Some(&empty)),
            Err(MeshError::KeyUnavailable(NodeId(3)))
        ));
        assert!(matches!(
            request_key(NodeId(3), None),
            Err(MeshError::KeyUnavailable(NodeId(3)))
        ));
        let valid = |_: NodeId| Some("AQ==".to_string());
        assert_eq!(request_key(NodeId(3), Some(&valid)).unwrap(), vec![1]);
    }
}
