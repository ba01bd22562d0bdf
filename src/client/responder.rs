//! Automatic answers to traceroute, telemetry and neighbor-info requests
//! addressed to managed nodes.

use super::receive::ReceivedPacket;
use super::route::{add_gateway, add_node_if_missing, format_route, insert_unknown_hops, Direction};
use super::send::PacketInfo;
use super::MeshClient;
use crate::events::{MeshEnvelope, MeshEvent, TracerouteEvent};
use crate::meshid::NodeId;
use crate::protobufs::{telemetry, NeighborInfo, PortNum, RouteDiscovery, Telemetry};

/// The firmware polls for neighbor info with a single all-zero neighbor
pub(crate) fn is_dummy_neighbor_request(info: &NeighborInfo) -> bool {
    matches!(info.neighbors.as_slice(), [n] if n.node_id == 0 && n.snr == 0.0)
}

/// Bookkeeping a node applies to a traceroute it terminates: fill gaps left
/// by silent relays, add the hop we heard it through, add the bridge itself
/// when answering for another node, then the SNR of the final hop.
pub(crate) fn complete_route(
    disco: &mut RouteDiscovery,
    packet: &ReceivedPacket,
    own_id: NodeId,
    dir: Direction,
) {
    let from = packet.from();
    insert_unknown_hops(disco, packet.packet.hop_start, packet.packet.hop_limit, dir);
    add_gateway(disco, packet.gateway, from, packet.packet.rx_snr, dir);

    if packet.to() != own_id {
        match dir {
            Direction::Towards => {
                add_node_if_missing(disco, own_id, 0, Direction::Towards);
                add_node_if_missing(disco, own_id, 0, Direction::Back);
            }
            Direction::Back => add_node_if_missing(disco, own_id, 0, Direction::Back),
        }
    }

    match dir {
        Direction::Towards => disco.snr_towards.push(0),
        Direction::Back => disco.snr_back.push(0),
    }
}

impl MeshClient {
    pub(crate) async fn answer_traceroute(&self, received: &ReceivedPacket, mut disco: RouteDiscovery) {
        let (from, to) = (received.from(), received.to());
        if to.is_broadcast() || !self.is_managed(to) {
            tracing::debug!("Ignoring traceroute {} -> {} not addressed to us", from, to);
            return;
        }

        if received.packet.want_ack {
            if let Err(e) = self.send_ack(to, from, received.packet.id).await {
                tracing::warn!("⚠️  Failed to ack traceroute from {}: {}", from, e);
            }
        }

        complete_route(&mut disco, received, self.node_id(), Direction::Towards);
        tracing::info!(
            "🛰️  Answering traceroute: {}",
            format_route(&disco, from, to, Direction::Towards)
        );

        let mut info = PacketInfo::new(PortNum::TracerouteApp, received.reply_encryption(), to, from);
        info.request_id = received.packet.id;
        if let Err(e) = self.send_proto(&received.channel, &disco, info).await {
            tracing::warn!("⚠️  Failed to answer traceroute from {}: {}", from, e);
        }
    }

    /// Finish the return route of a traceroute response and match it to
    /// the request we sent, if we still remember it
    pub(crate) fn complete_traceroute(
        &self,
        received: &ReceivedPacket,
        mut disco: RouteDiscovery,
        envelope: MeshEnvelope,
    ) -> MeshEvent {
        let request_id = received.data.request_id;
        if self.is_managed(received.to()) {
            complete_route(&mut disco, received, self.node_id(), Direction::Back);
        }
        tracing::info!(
            "🛰️  Traceroute {} completed: {} | back: {}",
            request_id,
            format_route(&disco, received.to(), received.from(), Direction::Towards),
            format_route(&disco, received.from(), received.to(), Direction::Back)
        );
        let pending = self.inner.traceroutes.take_request(request_id);
        if pending.is_none() {
            tracing::debug!("Traceroute response {} has no pending request", request_id);
        }

        let to_ids = |v: Vec<u32>| -> Vec<NodeId> { v.into_iter().map(NodeId).collect() };
        MeshEvent::Traceroute(TracerouteEvent {
            envelope,
            request_id,
            route: to_ids(disco.route),
            snr_towards: disco.snr_towards,
            route_back: to_ids(disco.route_back),
            snr_back: disco.snr_back,
            pending,
        })
    }

    pub(crate) async fn answer_telemetry_request(&self, received: &ReceivedPacket, request: Telemetry) {
        let (from, to) = (received.from(), received.to());
        if !self.is_managed(to) {
            return;
        }
        if !self.inner.throttle.can_respond_telemetry(to) {
            tracing::debug!("Telemetry request from {} to {} throttled", from, to);
            return;
        }

        let encryption = received.reply_encryption();
        let channel = &received.channel;
        let id = received.packet.id;
        let result = match request.variant {
            None | Some(telemetry::Variant::DeviceMetrics(_)) => {
                self.send_telemetry_response(to, from, channel, encryption, id).await
            }
            Some(telemetry::Variant::HostMetrics(_)) => {
                self.send_host_metrics_response(to, from, channel, encryption, id).await
            }
            Some(_) => {
                tracing::debug!("Unsupported telemetry request from {}", from);
                return;
            }
        };

        match result {
            Ok(_) => tracing::info!("📊 Answered telemetry request from {} to {}", from, to),
            Err(e) => tracing::warn!("⚠️  Failed to answer telemetry request from {}: {}", from, e),
        }
    }

    pub(crate) async fn answer_neighbor_info_request(&self, received: &ReceivedPacket, request: NeighborInfo) {
        let (from, to) = (received.from(), received.to());
        if !self.is_managed(to) || is_dummy_neighbor_request(&request) {
            return;
        }
        if !self.inner.throttle.can_respond_neighbor(to) {
            tracing::debug!("Neighbor info request from {} to {} throttled", from, to);
            return;
        }

        let provider = self.inner.neighbor_provider.read().clone();
        let neighbors = provider.map(|p| p(to)).unwrap_or_default();
        let interval = self.neighbor_broadcast_interval().as_secs() as u32;

        let result = self
            .send_neighbor_info_response(
                to,
                from,
                &neighbors,
                interval,
                &received.channel,
                received.reply_encryption(),
                received.packet.id,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("⚠️  Failed to answer neighbor info request from {}: {}", from, e);
        }
    }
}
