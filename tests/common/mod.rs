//! In-memory transport and packet builders shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meshbridge::constants::protocol::DEFAULT_KEY;
use meshbridge::crypto::{channel_hash, psk_xor};
use meshbridge::network::transport::{
    ListenerEvent, MeshTransport, NetworkMeshPacket, PacketHandler, PacketSource, StateHandler,
};
use meshbridge::protobufs::{mesh_packet::PayloadVariant, Data, MeshPacket, PortNum};
use meshbridge::{MeshClient, MeshEvent, TransportError};

/// Records outbound packets and lets tests feed inbound ones
pub struct MockTransport {
    name: &'static str,
    failing: AtomicBool,
    connected: AtomicBool,
    sent: Mutex<Vec<(String, MeshPacket)>>,
    channels: Mutex<Vec<String>>,
    packet_handler: RwLock<Option<PacketHandler>>,
    state_handler: RwLock<Option<StateHandler>>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            failing: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            packet_handler: RwLock::new(None),
            state_handler: RwLock::new(None),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, MeshPacket)> {
        self.sent.lock().clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    /// Deliver a packet as if it arrived from the mesh and wait until the
    /// client has fully handled it
    pub async fn inject(&self, packet: MeshPacket, channel: Option<&str>) {
        let handler = self.packet_handler.read().clone();
        if let Some(handler) = handler {
            handler(NetworkMeshPacket {
                packet,
                channel_name: channel.map(str::to_string),
                gateway: None,
                source: PacketSource::Local,
            })
            .await;
        }
    }

    pub fn emit(&self, event: ListenerEvent) {
        let handler = self.state_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[async_trait]
impl MeshTransport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(self.name));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ListenerEvent::Started);
        Ok(())
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add_channel(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if !channels.iter().any(|c| c == channel) {
            channels.push(channel.to_string());
        }
    }

    async fn send_packet(&self, channel: &str, packet: &MeshPacket) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(self.name));
        }
        self.sent.lock().push((channel.to_string(), packet.clone()));
        Ok(())
    }

    fn set_packet_handler(&self, handler: PacketHandler) {
        *self.packet_handler.write() = Some(handler);
    }

    fn set_state_handler(&self, handler: StateHandler) {
        *self.state_handler.write() = Some(handler);
    }
}

pub fn collect_events(client: &MeshClient) -> Arc<Mutex<Vec<MeshEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.add_event_handler(Arc::new(move |e: &MeshEvent| sink.lock().push(e.clone())));
    events
}

/// A packet on the default channel, encrypted with the default key
pub fn psk_packet(id: u32, from: u32, to: u32, data: &Data) -> MeshPacket {
    let encrypted = psk_xor(&data.encode_to_vec(), &DEFAULT_KEY, id, from).unwrap();
    MeshPacket {
        id,
        from,
        to,
        channel: channel_hash("LongFast", &DEFAULT_KEY) as u32,
        hop_start: 3,
        hop_limit: 3,
        relay_node: from & 0xFF,
        payload_variant: Some(PayloadVariant::Encrypted(encrypted)),
        ..Default::default()
    }
}

pub fn data(port: PortNum, payload: Vec<u8>) -> Data {
    Data {
        portnum: port as i32,
        payload,
        ..Default::default()
    }
}

/// Decrypt a packet the client sent on the default channel
pub fn open_psk(packet: &MeshPacket) -> Data {
    let encrypted = packet.encrypted().expect("packet is encrypted");
    let plain = psk_xor(encrypted, &DEFAULT_KEY, packet.id, packet.from).unwrap();
    Data::decode(plain.as_slice()).unwrap()
}
