//! Public send operations.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};

use super::send::{EncryptionType, PacketInfo};
use super::MeshClient;
use crate::constants::protocol::{MAX_LONG_NAME_LEN, MAX_NEIGHBORS, MAX_SHORT_NAME_LEN};
use crate::error::{MeshError, MeshResult};
use crate::events::PendingTraceroute;
use crate::meshid::{ChannelDef, GeoUri, NodeId};
use crate::protobufs::{
    telemetry, DeviceMetrics, HardwareModel, HostMetrics, MapReport, ModemPreset, Neighbor,
    NeighborInfo, PortNum, Position, RegionCode, Role, RouteDiscovery, Routing, RoutingError,
    Telemetry, User, Waypoint,
};

/// Result of asking for a traceroute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerouteOutcome {
    Sent { packet_id: u32 },
    /// The firmware cooldown for this (from, to) pair has not elapsed yet
    RateLimited { retry_in: Duration },
}

fn psk_or_pki(use_pki: bool) -> EncryptionType {
    if use_pki {
        EncryptionType::Pki
    } else {
        EncryptionType::Psk
    }
}

fn now_secs() -> u32 {
    Utc::now().timestamp() as u32
}

/// Neighbor list as advertised on the mesh: without the sender itself or
/// the reserved IDs, and capped at the firmware maximum
pub(crate) fn build_neighbor_info(
    from: NodeId,
    neighbor_ids: &[NodeId],
    broadcast_interval_secs: u32,
) -> NeighborInfo {
    let neighbors = neighbor_ids
        .iter()
        .filter(|id| **id != from && id.as_u32() > 1)
        .take(MAX_NEIGHBORS)
        .map(|id| Neighbor {
            node_id: id.as_u32(),
            snr: 0.0,
            ..Default::default()
        })
        .collect();

    NeighborInfo {
        node_id: from.as_u32(),
        last_sent_by_id: from.as_u32(),
        node_broadcast_interval_secs: broadcast_interval_secs,
        neighbors,
    }
}

impl MeshClient {
    // ----- chat -----

    pub async fn send_message(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        text: &str,
        reply_id: u32,
        use_pki: bool,
    ) -> MeshResult<u32> {
        let mut info = PacketInfo::new(PortNum::TextMessageApp, psk_or_pki(use_pki), from, to);
        info.reply_id = reply_id;
        self.send_bytes(channel, text.as_bytes().to_vec(), info).await
    }

    pub async fn send_reaction(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        target_packet_id: u32,
        emoji: &str,
        use_pki: bool,
    ) -> MeshResult<u32> {
        let mut info = PacketInfo::new(PortNum::TextMessageApp, psk_or_pki(use_pki), from, to);
        info.emoji = true;
        info.reply_id = target_packet_id;
        self.send_bytes(channel, emoji.as_bytes().to_vec(), info).await
    }

    // ----- identity and location -----

    /// Announce a managed node's identity on the primary channel.
    ///
    /// The bridge's own identity advertises `CLIENT_BASE` and is marked
    /// unmessagable; every other managed node is a `CLIENT_MUTE`.
    pub async fn send_node_info(
        &self,
        from: NodeId,
        to: NodeId,
        long_name: &str,
        short_name: &str,
        want_response: bool,
        public_key: Option<&[u8]>,
    ) -> MeshResult<u32> {
        if long_name.len() > MAX_LONG_NAME_LEN {
            return Err(MeshError::InvalidArgument(format!(
                "long name must be at most {} bytes",
                MAX_LONG_NAME_LEN
            )));
        }
        if short_name.len() > MAX_SHORT_NAME_LEN {
            return Err(MeshError::InvalidArgument(format!(
                "short name must be at most {} bytes",
                MAX_SHORT_NAME_LEN
            )));
        }

        let guard = self.inner.node_info_resend_guard;
        if let Some(sent) = self.inner.node_info_sent.lock().get(&from) {
            if sent.elapsed() < guard {
                return Err(MeshError::SentTooRecently(from));
            }
        }

        let is_base = from == self.node_id();
        let role = if is_base {
            Role::ClientBase
        } else {
            Role::ClientMute
        };
        let user = User {
            id: from.to_string(),
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
            macaddr: from.to_mac_address().to_vec(),
            hw_model: HardwareModel::PrivateHw as i32,
            is_licensed: false,
            role: role as i32,
            public_key: public_key.map(<[u8]>::to_vec).unwrap_or_default(),
            is_unmessagable: is_base.then_some(true),
        };

        let mut info = PacketInfo::new(PortNum::NodeinfoApp, EncryptionType::Psk, from, to);
        info.want_response = want_response && !to.is_broadcast();
        let packet_id = self.send_proto(&self.primary_channel(), &user, info).await?;

        self.inner.node_info_sent.lock().insert(from, Instant::now());
        Ok(packet_id)
    }

    /// Share a managed node's location. `want_response` asks a directly
    /// addressed node for its own position and is ignored for broadcasts.
    pub async fn send_position(
        &self,
        from: NodeId,
        to: NodeId,
        location: &GeoUri,
        timestamp: DateTime<Utc>,
        want_response: bool,
    ) -> MeshResult<u32> {
        let position = Position {
            latitude_i: Some(location.latitude_i()),
            longitude_i: Some(location.longitude_i()),
            altitude: location.altitude.map(|a| a.round() as i32),
            time: now_secs(),
            timestamp: timestamp.timestamp() as u32,
            precision_bits: location.precision_bits(),
            ..Default::default()
        };
        let mut info = PacketInfo::new(PortNum::PositionApp, EncryptionType::Psk, from, to);
        info.want_response = want_response && !to.is_broadcast();
        self.send_proto(&self.primary_channel(), &position, info).await
    }

    /// Share a map marker on a channel. A waypoint whose expiry has passed
    /// deletes the marker on receiving devices.
    pub async fn send_waypoint(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        waypoint: Waypoint,
    ) -> MeshResult<u32> {
        let info = PacketInfo::new(PortNum::WaypointApp, EncryptionType::Psk, from, to);
        self.send_proto(channel, &waypoint, info).await
    }

    /// Remove a waypoint from receiving devices by re-sending it already expired
    pub async fn delete_waypoint(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        waypoint_id: u32,
    ) -> MeshResult<u32> {
        let waypoint = Waypoint {
            id: waypoint_id,
            expire: 1,
            ..Default::default()
        };
        self.send_waypoint(from, to, channel, waypoint).await
    }

    pub async fn send_map_report(
        &self,
        from: NodeId,
        long_name: &str,
        short_name: &str,
        location: &GeoUri,
        num_online_nodes: u32,
    ) -> MeshResult<u32> {
        if location.latitude == 0.0 || location.longitude == 0.0 {
            return Err(MeshError::InvalidArgument(
                "a valid location is required".to_string(),
            ));
        }

        let role = if from == self.node_id() {
            Role::ClientBase
        } else {
            Role::ClientMute
        };
        let primary = self.primary_channel();
        let preset = ModemPreset::from_channel_name(primary.name());

        let report = MapReport {
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
            role: role as i32,
            hw_model: HardwareModel::PrivateHw as i32,
            region: RegionCode::Us as i32,
            modem_preset: preset.map(|p| p as i32).unwrap_or_default(),
            has_default_channel: preset.is_some(),
            latitude_i: location.latitude_i(),
            longitude_i: location.longitude_i(),
            altitude: location.altitude.map(|a| a as i32).unwrap_or_default(),
            position_precision: location.precision_bits(),
            num_online_local_nodes: num_online_nodes,
            ..Default::default()
        };

        let info = PacketInfo::new(PortNum::MapReportApp, EncryptionType::None, from, NodeId::BROADCAST);
        self.send_proto(&primary, &report, info).await
    }

    // ----- telemetry -----

    pub(crate) fn build_device_metrics(&self) -> Telemetry {
        Telemetry {
            time: now_secs(),
            variant: Some(telemetry::Variant::DeviceMetrics(DeviceMetrics {
                // Over 100 means mains powered
                battery_level: Some(101),
                voltage: Some(5.0),
                uptime_seconds: Some(self.uptime().as_secs() as u32),
                ..Default::default()
            })),
        }
    }

    pub(crate) fn build_host_metrics(&self) -> MeshResult<Telemetry> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        let load = System::load_average();

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .ok_or_else(|| MeshError::HostMetrics("no disk mounted at /".to_string()))?;

        Ok(Telemetry {
            time: now_secs(),
            variant: Some(telemetry::Variant::HostMetrics(HostMetrics {
                uptime_seconds: System::uptime() as u32,
                freemem_bytes: sys.available_memory(),
                diskfree1_bytes: root.available_space(),
                load1: (load.one * 100.0) as u32,
                load5: (load.five * 100.0) as u32,
                load15: (load.fifteen * 100.0) as u32,
                ..Default::default()
            })),
        })
    }

    /// Broadcast device metrics on the primary channel
    pub async fn send_telemetry(&self, from: NodeId, to: NodeId) -> MeshResult<u32> {
        let telemetry = self.build_device_metrics();
        let info = PacketInfo::new(PortNum::TelemetryApp, EncryptionType::Psk, from, to);
        self.send_proto(&self.primary_channel(), &telemetry, info).await
    }

    pub async fn send_telemetry_response(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        encryption: EncryptionType,
        request_id: u32,
    ) -> MeshResult<u32> {
        let telemetry = self.build_device_metrics();
        let mut info = PacketInfo::new(PortNum::TelemetryApp, encryption, from, to);
        info.request_id = request_id;
        self.send_proto(channel, &telemetry, info).await
    }

    pub async fn send_host_metrics(&self, from: NodeId, to: NodeId) -> MeshResult<u32> {
        let telemetry = self.build_host_metrics()?;
        let info = PacketInfo::new(PortNum::TelemetryApp, EncryptionType::Psk, from, to);
        self.send_proto(&self.primary_channel(), &telemetry, info).await
    }

    pub async fn send_host_metrics_response(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        encryption: EncryptionType,
        request_id: u32,
    ) -> MeshResult<u32> {
        let telemetry = self.build_host_metrics()?;
        let mut info = PacketInfo::new(PortNum::TelemetryApp, encryption, from, to);
        info.request_id = request_id;
        self.send_proto(channel, &telemetry, info).await
    }

    // ----- neighbors -----

    /// Broadcast a node's neighbor list. Goes to the no-LoRa broadcast
    /// address so it stays off the radio.
    pub async fn send_neighbor_info(
        &self,
        from: NodeId,
        neighbor_ids: &[NodeId],
        broadcast_interval_secs: u32,
    ) -> MeshResult<u32> {
        let neighbors = build_neighbor_info(from, neighbor_ids, broadcast_interval_secs);
        let info = PacketInfo::new(
            PortNum::NeighborinfoApp,
            EncryptionType::Psk,
            from,
            NodeId::BROADCAST_NO_LORA,
        );
        self.send_proto(&self.primary_channel(), &neighbors, info).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_neighbor_info_response(
        &self,
        from: NodeId,
        to: NodeId,
        neighbor_ids: &[NodeId],
        broadcast_interval_secs: u32,
        channel: &ChannelDef,
        encryption: EncryptionType,
        request_id: u32,
    ) -> MeshResult<u32> {
        let neighbors = build_neighbor_info(from, neighbor_ids, broadcast_interval_secs);
        let mut info = PacketInfo::new(PortNum::NeighborinfoApp, encryption, from, to);
        info.request_id = request_id;
        self.send_proto(channel, &neighbors, info).await
    }

    // ----- routing -----

    pub async fn send_ack(&self, from: NodeId, to: NodeId, packet_id: u32) -> MeshResult<u32> {
        tracing::debug!("Sending ACK {} -> {} for packet {}", from, to, packet_id);
        let mut info = PacketInfo::new(PortNum::RoutingApp, EncryptionType::Psk, from, to);
        info.request_id = packet_id;
        self.send_proto(&self.primary_channel(), &Routing::error(RoutingError::None), info)
            .await
    }

    /// Reject a packet. Always sent from the bridge's own identity.
    pub async fn send_nack(&self, to: NodeId, packet_id: u32) -> MeshResult<u32> {
        tracing::debug!("Sending NAK -> {} for packet {}", to, packet_id);
        let mut info = PacketInfo::new(PortNum::RoutingApp, EncryptionType::Psk, self.node_id(), to);
        info.request_id = packet_id;
        self.send_proto(&self.primary_channel(), &Routing::error(RoutingError::GotNak), info)
            .await
    }

    /// Send a traceroute request, bypassing the cooldown
    pub async fn send_traceroute(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
    ) -> MeshResult<u32> {
        tracing::debug!("🛰️  Sending traceroute {} -> {}", from, to);

        // Relays only append themselves when forwarding, so when the bridge
        // originates for another node it has to list itself as the first hop
        let mut disco = RouteDiscovery::default();
        if from != self.node_id() {
            disco.route.push(self.node_id().as_u32());
            disco.snr_towards.push(0);
        }

        let mut info = PacketInfo::new(PortNum::TracerouteApp, EncryptionType::Psk, from, to);
        info.want_response = true;
        self.send_proto(channel, &disco, info).await
    }

    /// Send a traceroute subject to the per-pair cooldown, remembering the
    /// request so the response can be matched to `context`
    pub async fn request_traceroute(
        &self,
        from: NodeId,
        to: NodeId,
        channel: &ChannelDef,
        context: &str,
    ) -> MeshResult<TracerouteOutcome> {
        if let Err(retry_in) = self.inner.traceroutes.try_acquire(from, to) {
            tracing::debug!("Traceroute {} -> {} rate limited for {:?}", from, to, retry_in);
            return Ok(TracerouteOutcome::RateLimited { retry_in });
        }

        match self.send_traceroute(from, to, channel).await {
            Ok(packet_id) => {
                self.inner.traceroutes.add_request(
                    packet_id,
                    PendingTraceroute {
                        from,
                        target: to,
                        channel: channel.name().to_string(),
                        context: context.to_string(),
                        sent_at: Instant::now(),
                    },
                );
                Ok(TracerouteOutcome::Sent { packet_id })
            }
            Err(e) => {
                self.inner.traceroutes.release(from, to);
                Err(e)
            }
        }
    }
}
