//! Route discovery through the client: answering requests, originating on
//! behalf of other nodes, cooldowns and response matching.

mod common;

use prost::Message;
use std::sync::Arc;
use std::time::Duration;

use common::{collect_events, data, open_psk, psk_packet, MockTransport};
use meshbridge::protobufs::{MeshPacket, PortNum, RouteDiscovery, Routing};
use meshbridge::{ChannelDef, MeshClient, MeshEvent, NodeId, TracerouteOutcome};

const BRIDGE: NodeId = NodeId(0x100);
const REMOTE: u32 = 0x10;
const UNKNOWN_HOP: u32 = 0xFFFF_FFFF;

fn setup() -> (MeshClient, Arc<MockTransport>) {
    let udp = MockTransport::new("udp");
    let client = MeshClient::new(BRIDGE);
    client.add_transport(udp.clone());
    (client, udp)
}

fn traceroute_packet(id: u32, from: u32, to: u32, disco: &RouteDiscovery, request_id: u32) -> MeshPacket {
    let mut d = data(PortNum::TracerouteApp, disco.encode_to_vec());
    d.request_id = request_id;
    d.want_response = request_id == 0;
    psk_packet(id, from, to, &d)
}

#[tokio::test]
async fn test_request_with_silent_relays_is_backfilled() {
    let (_client, udp) = setup();

    let mut packet = traceroute_packet(50, REMOTE, BRIDGE.as_u32(), &RouteDiscovery::default(), 0);
    packet.hop_start = 3;
    packet.hop_limit = 1;
    packet.relay_node = 0x55;
    packet.rx_snr = 2.5;
    udp.inject(packet, None).await;

    let sent = udp.sent();
    assert_eq!(sent.len(), 1);
    let (channel, reply) = &sent[0];
    assert_eq!(channel, "LongFast");
    assert_eq!(reply.from, BRIDGE.as_u32());
    assert_eq!(reply.to, REMOTE);

    let data = open_psk(reply);
    assert_eq!(data.port(), PortNum::TracerouteApp);
    assert_eq!(data.request_id, 50);

    let disco = RouteDiscovery::decode(data.payload.as_slice()).unwrap();
    assert_eq!(disco.route, vec![UNKNOWN_HOP, UNKNOWN_HOP, 0x55]);
    assert_eq!(disco.snr_towards, vec![-128, -128, 10, 0]);
    assert!(disco.route_back.is_empty());
}

#[tokio::test]
async fn test_request_with_want_ack_is_acknowledged_first() {
    let (_client, udp) = setup();

    let mut packet = traceroute_packet(51, REMOTE, BRIDGE.as_u32(), &RouteDiscovery::default(), 0);
    packet.want_ack = true;
    udp.inject(packet, None).await;

    let sent = udp.sent();
    assert_eq!(sent.len(), 2);

    let ack = open_psk(&sent[0].1);
    assert_eq!(ack.port(), PortNum::RoutingApp);
    assert_eq!(ack.request_id, 51);
    let routing = Routing::decode(ack.payload.as_slice()).unwrap();
    assert_eq!(routing.error_reason(), Some(meshbridge::protobufs::RoutingError::None));

    let reply = open_psk(&sent[1].1);
    assert_eq!(reply.port(), PortNum::TracerouteApp);
}

#[tokio::test]
async fn test_request_for_other_managed_node_lists_bridge() {
    let (client, udp) = setup();
    client.set_managed_node_handler(Arc::new(|id: NodeId| id == BRIDGE || id == NodeId(0x200)));

    let packet = traceroute_packet(52, REMOTE, 0x200, &RouteDiscovery::default(), 0);
    udp.inject(packet, None).await;

    let reply = &udp.sent()[0].1;
    assert_eq!(reply.from, 0x200);
    // the bridge spends a hop answering for another node
    assert_eq!(reply.hop_start, reply.hop_limit + 1);

    let disco = RouteDiscovery::decode(open_psk(reply).payload.as_slice()).unwrap();
    assert_eq!(disco.route, vec![BRIDGE.as_u32()]);
    assert_eq!(disco.snr_towards, vec![0, 0]);
    assert_eq!(disco.route_back, vec![BRIDGE.as_u32()]);
    assert_eq!(disco.snr_back, vec![0]);
}

#[tokio::test]
async fn test_request_for_unmanaged_node_is_ignored() {
    let (_client, udp) = setup();
    let packet = traceroute_packet(53, REMOTE, 0x999, &RouteDiscovery::default(), 0);
    udp.inject(packet, None).await;
    assert!(udp.sent().is_empty());
}

#[tokio::test]
async fn test_relayed_origin_is_seeded_with_bridge() {
    let (client, udp) = setup();
    client.set_managed_node_handler(Arc::new(|id: NodeId| id == BRIDGE || id == NodeId(0x200)));

    client
        .send_traceroute(NodeId(0x200), NodeId(0x300), &ChannelDef::default_channel())
        .await
        .unwrap();

    let packet = &udp.sent()[0].1;
    let data = open_psk(packet);
    assert!(data.want_response);
    let disco = RouteDiscovery::decode(data.payload.as_slice()).unwrap();
    assert_eq!(disco.route, vec![BRIDGE.as_u32()]);
    assert_eq!(disco.snr_towards, vec![0]);

    // originating as ourselves needs no seed
    client
        .send_traceroute(BRIDGE, NodeId(0x300), &ChannelDef::default_channel())
        .await
        .unwrap();
    let disco = RouteDiscovery::decode(open_psk(&udp.sent()[1].1).payload.as_slice()).unwrap();
    assert!(disco.route.is_empty());
}

#[tokio::test]
async fn test_cooldown_and_response_matching() {
    let (client, udp) = setup();
    let events = collect_events(&client);
    let channel = ChannelDef::default_channel();

    let first = client
        .request_traceroute(BRIDGE, NodeId(0x300), &channel, "room-1")
        .await
        .unwrap();
    let TracerouteOutcome::Sent { packet_id } = first else {
        panic!("expected a sent traceroute, got {:?}", first);
    };
    assert_eq!(client.pending_traceroutes(), 1);

    match client
        .request_traceroute(BRIDGE, NodeId(0x300), &channel, "room-1")
        .await
        .unwrap()
    {
        TracerouteOutcome::RateLimited { retry_in } => {
            assert!(retry_in <= Duration::from_secs(30));
            assert!(retry_in > Duration::from_secs(25));
        }
        other => panic!("expected rate limiting, got {:?}", other),
    }
    assert_eq!(udp.sent().len(), 1);

    // a different destination is not limited
    assert!(matches!(
        client
            .request_traceroute(BRIDGE, NodeId(0x301), &channel, "room-2")
            .await
            .unwrap(),
        TracerouteOutcome::Sent { .. }
    ));

    let answered = RouteDiscovery {
        route: vec![0x77],
        snr_towards: vec![8, 12],
        ..Default::default()
    };
    udp.inject(traceroute_packet(900, 0x300, BRIDGE.as_u32(), &answered, packet_id), None)
        .await;

    let events = events.lock();
    match events.as_slice() {
        [MeshEvent::Traceroute(t)] => {
            assert_eq!(t.request_id, packet_id);
            assert_eq!(t.route, vec![NodeId(0x77)]);
            assert_eq!(t.snr_towards, vec![8, 12]);
            assert!(t.route_back.is_empty());
            assert_eq!(t.snr_back, vec![0]);
            let pending = t.pending.as_ref().expect("request is remembered");
            assert_eq!(pending.context, "room-1");
            assert_eq!(pending.target, NodeId(0x300));
            assert_eq!(pending.channel, "LongFast");
        }
        other => panic!("unexpected events {:?}", other),
    }
    assert_eq!(client.pending_traceroutes(), 1);
}

#[tokio::test]
async fn test_unmatched_response_is_still_reported() {
    let (client, udp) = setup();
    let events = collect_events(&client);

    let mut packet = traceroute_packet(901, 0x300, BRIDGE.as_u32(), &RouteDiscovery::default(), 4242);
    packet.hop_start = 3;
    packet.hop_limit = 2;
    packet.relay_node = 0x66;
    packet.rx_snr = -1.0;
    udp.inject(packet, None).await;

    let events = events.lock();
    match events.as_slice() {
        [MeshEvent::Traceroute(t)] => {
            assert!(t.pending.is_none());
            assert_eq!(t.route_back, vec![NodeId(UNKNOWN_HOP), NodeId(0x66)]);
            assert_eq!(t.snr_back, vec![-128, -4, 0]);
        }
        other => panic!("unexpected events {:?}", other),
    }
}
