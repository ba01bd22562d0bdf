//! Route-discovery bookkeeping applied to traceroute packets as they pass
//! through the bridge.

use std::fmt::Write as _;

use crate::constants::protocol::SNR_UNKNOWN;
use crate::meshid::NodeId;
use crate::protobufs::RouteDiscovery;

/// Which half of a traceroute is being edited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `route` / `snr_towards`
    Towards,
    /// `route_back` / `snr_back`
    Back,
}

fn lists(disco: &mut RouteDiscovery, dir: Direction) -> (&mut Vec<u32>, &mut Vec<i32>) {
    match dir {
        Direction::Towards => (&mut disco.route, &mut disco.snr_towards),
        Direction::Back => (&mut disco.route_back, &mut disco.snr_back),
    }
}

/// Pad the route with placeholder hops for relays that did not append
/// themselves (old firmware, or nodes without the channel key), and pad the
/// SNR list to match with the "unknown" sentinel.
pub fn insert_unknown_hops(disco: &mut RouteDiscovery, hop_start: u32, hop_limit: u32, dir: Direction) {
    if hop_start == 0 || hop_limit > hop_start {
        return;
    }
    let hops_taken = (hop_start - hop_limit) as usize;
    let (route, snr) = lists(disco, dir);
    while route.len() < hops_taken {
        route.push(NodeId::BROADCAST.as_u32());
    }
    while snr.len() < route.len() {
        snr.push(SNR_UNKNOWN);
    }
}

/// Append `node` with its SNR unless it is already on the route
pub fn add_node_if_missing(disco: &mut RouteDiscovery, node: NodeId, snr: i32, dir: Direction) {
    let (route, snrs) = lists(disco, dir);
    if !route.contains(&node.as_u32()) {
        route.push(node.as_u32());
        snrs.push(snr);
    }
}

/// Record the node we heard the packet through. Skipped when there is no
/// gateway or the sender uplinked it itself.
pub fn add_gateway(
    disco: &mut RouteDiscovery,
    gateway: NodeId,
    from: NodeId,
    rx_snr: f32,
    dir: Direction,
) {
    if gateway == NodeId::UNKNOWN || gateway == from {
        return;
    }
    add_node_if_missing(disco, gateway, (rx_snr * 4.0) as i32, dir);
}

/// Human-readable path for one half of a traceroute, e.g.
/// `!00000001 --> !00000002 (6.25dB) --> !00000003 (?dB)`
pub fn format_route(disco: &RouteDiscovery, origin: NodeId, dest: NodeId, dir: Direction) -> String {
    let (route, snrs) = match dir {
        Direction::Towards => (&disco.route, &disco.snr_towards),
        Direction::Back => (&disco.route_back, &disco.snr_back),
    };
    let db = |snr: Option<&i32>| match snr {
        Some(&s) if s != SNR_UNKNOWN => format!("{:.2}dB", s as f32 / 4.0),
        _ => "?dB".to_string(),
    };

    let mut out = format!("{} --> ", origin);
    for (i, hop) in route.iter().enumerate() {
        let _ = write!(out, "{} ({}) --> ", NodeId(*hop), db(snrs.get(i)));
    }
    let _ = write!(out, "{} ({})", dest, db(snrs.last()));
    out
}
