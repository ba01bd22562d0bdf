//! Inbound pipeline: dedup, loop prevention, decryption and classification.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use prost::Message;

use super::send::EncryptionType;
use super::MeshClient;
use crate::constants::protocol::PKI_CHANNEL_NAME;
use crate::crypto::{channel_hash, decode_data, pki_decrypt, psk_xor};
use crate::error::MeshResult;
use crate::events::{
    AckEvent, LocationEvent, MapReportEvent, MeshEnvelope, MeshEvent, MessageEvent,
    NodeInfoEvent, ReactionEvent, WaypointEvent,
};
use crate::meshid::{ChannelDef, NodeId};
use crate::network::transport::{NetworkMeshPacket, PacketSource};
use crate::protobufs::{
    routing, Data, MapReport, MeshPacket, NeighborInfo, PortNum, Position, RouteDiscovery,
    Routing, StoreAndForward, Telemetry, User, Waypoint,
};

/// A packet that survived dedup, loop prevention and decryption
#[derive(Debug, Clone)]
pub(crate) struct ReceivedPacket {
    pub packet: MeshPacket,
    pub data: Data,
    /// Channel the packet was decoded with
    pub channel: ChannelDef,
    pub encryption: EncryptionType,
    pub gateway: NodeId,
    pub source: PacketSource,
}

impl ReceivedPacket {
    pub fn from(&self) -> NodeId {
        NodeId(self.packet.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId(self.packet.to)
    }

    /// Encryption to answer with: replies go back the way the request came
    pub fn reply_encryption(&self) -> EncryptionType {
        if self.encryption == EncryptionType::Pki || self.channel.name() == PKI_CHANNEL_NAME {
            EncryptionType::Pki
        } else {
            EncryptionType::Psk
        }
    }
}

/// What a decoded payload turned out to be
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InboundPayload {
    /// Delivered to event handlers as-is
    Event(MeshEvent),
    TracerouteRequest(RouteDiscovery),
    TracerouteResponse(RouteDiscovery),
    /// Answered internally, never delivered to handlers
    TelemetryRequest(Telemetry),
    NeighborInfoRequest(NeighborInfo),
    /// Decoded but nothing to do beyond logging
    Ignored,
}

/// Node the packet was last heard through.
///
/// An explicit gateway from the transport wins. A packet that consumed no
/// hops and whose relay byte matches the sender came straight from the
/// sender; otherwise only the relay's low byte is known.
pub(crate) fn resolve_gateway(packet: &MeshPacket, explicit: Option<NodeId>) -> NodeId {
    if let Some(gateway) = explicit {
        return gateway;
    }
    if packet.hop_start == packet.hop_limit && (packet.relay_node & 0xFF) == (packet.from & 0xFF) {
        return NodeId(packet.from);
    }
    NodeId(packet.relay_node)
}

fn decode_payload<M: Message + Default>(data: &Data) -> Option<M> {
    match M::decode(data.payload.as_slice()) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!("⚠️  Failed to decode {:?} payload: {}", data.port(), e);
            tracing::trace!("Payload bytes: {}", hex::encode(&data.payload));
            None
        }
    }
}

fn fixed_to_degrees(value: i32) -> f64 {
    value as f64 * 1e-7
}

/// Turn a decoded payload into an event or an internal request
pub(crate) fn classify(envelope: MeshEnvelope, data: &Data, now: u32) -> InboundPayload {
    use InboundPayload::*;

    let wants_answer = data.want_response && !envelope.to.is_broadcast();
    match data.port() {
        PortNum::TextMessageApp => {
            let text = String::from_utf8_lossy(&data.payload).into_owned();
            if data.emoji != 0 {
                Event(MeshEvent::Reaction(ReactionEvent {
                    envelope,
                    emoji: text,
                    reply_id: data.reply_id,
                }))
            } else {
                Event(MeshEvent::Message(MessageEvent {
                    envelope,
                    text,
                    reply_id: data.reply_id,
                }))
            }
        }
        PortNum::PositionApp => {
            let Some(pos) = decode_payload::<Position>(data) else {
                return Ignored;
            };
            match (pos.latitude_i, pos.longitude_i) {
                (Some(lat), Some(lon)) => Event(MeshEvent::Location(LocationEvent {
                    envelope,
                    latitude: fixed_to_degrees(lat),
                    longitude: fixed_to_degrees(lon),
                    altitude: pos.altitude,
                    ground_speed: pos.ground_speed,
                    ground_track: pos.ground_track,
                    precision_bits: pos.precision_bits,
                })),
                _ => Ignored,
            }
        }
        PortNum::NodeinfoApp => {
            let Some(user) = decode_payload::<User>(data) else {
                return Ignored;
            };
            Event(MeshEvent::NodeInfo(NodeInfoEvent {
                envelope,
                long_name: user.long_name,
                short_name: user.short_name,
                public_key: (!user.public_key.is_empty()).then(|| STANDARD.encode(&user.public_key)),
                hw_model: user.hw_model,
                role: user.role,
                is_unmessagable: user.is_unmessagable.unwrap_or(false),
            }))
        }
        PortNum::MapReportApp => {
            let Some(report) = decode_payload::<MapReport>(data) else {
                return Ignored;
            };
            Event(MeshEvent::MapReport(MapReportEvent {
                envelope,
                long_name: report.long_name,
                short_name: report.short_name,
                role: report.role,
                hw_model: report.hw_model,
                firmware_version: report.firmware_version,
                region: report.region,
                modem_preset: report.modem_preset,
                has_default_channel: report.has_default_channel,
                latitude: fixed_to_degrees(report.latitude_i),
                longitude: fixed_to_degrees(report.longitude_i),
                altitude: report.altitude,
                position_precision: report.position_precision,
                num_online_local_nodes: report.num_online_local_nodes,
            }))
        }
        PortNum::WaypointApp => {
            let Some(wp) = decode_payload::<Waypoint>(data) else {
                return Ignored;
            };
            Event(MeshEvent::Waypoint(WaypointEvent {
                envelope,
                id: wp.id,
                latitude: wp.latitude_i.map(fixed_to_degrees),
                longitude: wp.longitude_i.map(fixed_to_degrees),
                name: wp.name,
                description: wp.description,
                icon: char::from_u32(wp.icon).filter(|_| wp.icon != 0),
                locked_to: NodeId(wp.locked_to),
                expire: wp.expire,
                expired: wp.expire != 0 && wp.expire <= now,
            }))
        }
        PortNum::TracerouteApp => {
            let Some(disco) = decode_payload::<RouteDiscovery>(data) else {
                return Ignored;
            };
            if data.request_id == 0 {
                TracerouteRequest(disco)
            } else {
                TracerouteResponse(disco)
            }
        }
        PortNum::TelemetryApp => {
            let Some(telemetry) = decode_payload::<Telemetry>(data) else {
                return Ignored;
            };
            if wants_answer {
                TelemetryRequest(telemetry)
            } else {
                tracing::debug!("📊 Telemetry from {}: {:?}", envelope.from, telemetry.variant);
                Ignored
            }
        }
        PortNum::NeighborinfoApp => {
            let Some(info) = decode_payload::<NeighborInfo>(data) else {
                return Ignored;
            };
            if wants_answer {
                NeighborInfoRequest(info)
            } else {
                tracing::debug!(
                    "Neighbor info from {}: {} neighbors",
                    envelope.from,
                    info.neighbors.len()
                );
                Ignored
            }
        }
        PortNum::RoutingApp => {
            let Some(routing) = decode_payload::<Routing>(data) else {
                return Ignored;
            };
            match routing.variant {
                Some(routing::Variant::ErrorReason(reason)) if data.request_id != 0 => {
                    Event(MeshEvent::Ack(AckEvent {
                        envelope,
                        request_id: data.request_id,
                        error_reason: reason,
                    }))
                }
                _ => Ignored,
            }
        }
        PortNum::StoreForwardApp => {
            if let Some(sf) = decode_payload::<StoreAndForward>(data) {
                tracing::debug!("Store-and-forward message from {} (rr {})", envelope.from, sf.rr);
            }
            Ignored
        }
        other => {
            tracing::debug!("Ignoring {:?} packet from {}", other, envelope.from);
            Ignored
        }
    }
}

impl MeshClient {
    /// Entry point for every packet a transport delivers
    pub(crate) async fn handle_packet(&self, incoming: NetworkMeshPacket) {
        let NetworkMeshPacket {
            packet,
            channel_name,
            gateway,
            source,
        } = incoming;
        let from = NodeId(packet.from);
        let gateway = resolve_gateway(&packet, gateway);

        if self.inner.dedup.check_and_insert(from, packet.id) {
            tracing::trace!("Dropping duplicate packet {} from {} via {}", packet.id, from, source);
            return;
        }

        // A managed identity is never a remote peer
        if self.is_managed(from) {
            return;
        }

        let Some(received) = self.decode_packet(packet, channel_name.as_deref(), gateway, source)
        else {
            return;
        };
        self.process_packet(received).await;
    }

    fn decode_packet(
        &self,
        packet: MeshPacket,
        channel_name: Option<&str>,
        gateway: NodeId,
        source: PacketSource,
    ) -> Option<ReceivedPacket> {
        let to = NodeId(packet.to);

        if let Some(data) = packet.decoded().cloned() {
            let channel = match channel_name {
                Some(name) => self
                    .channel(name)
                    .unwrap_or_else(|| ChannelDef::unencrypted(name)),
                None => self.primary_channel(),
            };
            return Some(ReceivedPacket {
                packet,
                data,
                channel,
                encryption: EncryptionType::None,
                gateway,
                source,
            });
        }

        let Some(encrypted) = packet.encrypted().map(<[u8]>::to_vec) else {
            tracing::debug!("Packet {} from {} has no payload", packet.id, NodeId(packet.from));
            return None;
        };

        let pki_slot =
            packet.pki_encrypted || channel_name == Some(PKI_CHANNEL_NAME) || packet.channel == 0;
        if pki_slot && !to.is_broadcast() && self.is_managed(to) {
            match self.pki_decode(&packet, &encrypted) {
                Ok(data) => {
                    return Some(ReceivedPacket {
                        packet,
                        data,
                        channel: ChannelDef::unencrypted(PKI_CHANNEL_NAME),
                        encryption: EncryptionType::Pki,
                        gateway,
                        source,
                    });
                }
                Err(e) => tracing::debug!(
                    "PKI decryption of packet {} from {} failed ({}), trying channel keys",
                    packet.id,
                    NodeId(packet.from),
                    e
                ),
            }
        }

        match self.psk_decode(&packet, &encrypted, channel_name) {
            Some((data, channel)) => Some(ReceivedPacket {
                packet,
                data,
                channel,
                encryption: EncryptionType::Psk,
                gateway,
                source,
            }),
            None => {
                tracing::debug!(
                    "Could not decrypt packet {} from {} (channel slot {}) with any known key",
                    packet.id,
                    NodeId(packet.from),
                    packet.channel
                );
                None
            }
        }
    }

    fn pki_decode(&self, packet: &MeshPacket, encrypted: &[u8]) -> MeshResult<Data> {
        let from = NodeId(packet.from);
        let public_key = if packet.public_key.len() == 32 {
            packet.public_key.clone()
        } else {
            self.public_key(from)?
        };
        let private_key = self.private_key(NodeId(packet.to))?;
        let plaintext = pki_decrypt(encrypted, &private_key, &public_key, packet.id, packet.from)?;
        Ok(decode_data(&plaintext)?)
    }

    /// Try every joined channel, the named one first, then those whose hash
    /// matches the packet's slot
    fn psk_decode(
        &self,
        packet: &MeshPacket,
        encrypted: &[u8],
        channel_name: Option<&str>,
    ) -> Option<(Data, ChannelDef)> {
        let mut candidates = self.channels();
        let primary = self.primary_channel();
        if !candidates.contains(&primary) {
            candidates.push(primary);
        }
        candidates.sort_by_key(|c| {
            (
                Some(c.name()) != channel_name,
                channel_hash(c.name(), c.key_bytes()) as u32 != packet.channel,
            )
        });

        candidates.into_iter().find_map(|channel| {
            let plaintext = psk_xor(encrypted, channel.key_bytes(), packet.id, packet.from).ok()?;
            let data = decode_data(&plaintext).ok()?;
            Some((data, channel))
        })
    }

    pub(crate) fn envelope(&self, received: &ReceivedPacket) -> MeshEnvelope {
        let packet = &received.packet;
        let timestamp = if packet.rx_time != 0 {
            packet.rx_time
        } else {
            chrono::Utc::now().timestamp() as u32
        };
        MeshEnvelope {
            channel: received.channel.name().to_string(),
            channel_key: received
                .channel
                .is_encrypted()
                .then(|| received.channel.key_string().to_string()),
            from: received.from(),
            to: received.to(),
            via: received.gateway,
            timestamp,
            packet_id: packet.id,
            want_ack: packet.want_ack,
            want_response: received.data.want_response,
            is_neighbor: packet.hop_start != 0 && packet.hop_start == packet.hop_limit,
            via_mqtt: packet.via_mqtt || received.source == PacketSource::Mqtt,
        }
    }

    async fn process_packet(&self, received: ReceivedPacket) {
        let envelope = self.envelope(&received);
        tracing::debug!(
            "📥 {:?} packet {} {} -> {} on {} via {} (gateway {})",
            received.data.port(),
            received.packet.id,
            envelope.from,
            envelope.to,
            envelope.channel,
            received.source,
            received.gateway
        );

        let now = chrono::Utc::now().timestamp() as u32;
        let event = match classify(envelope.clone(), &received.data, now) {
            InboundPayload::Event(event) => Some(event),
            InboundPayload::TracerouteRequest(disco) => {
                self.answer_traceroute(&received, disco).await;
                None
            }
            InboundPayload::TracerouteResponse(disco) => {
                Some(self.complete_traceroute(&received, disco, envelope))
            }
            InboundPayload::TelemetryRequest(telemetry) => {
                self.answer_telemetry_request(&received, telemetry).await;
                None
            }
            InboundPayload::NeighborInfoRequest(info) => {
                self.answer_neighbor_info_request(&received, info).await;
                None
            }
            InboundPayload::Ignored => None,
        };

        if let Some(event) = event {
            self.dispatch(&event);
        }
    }
}
