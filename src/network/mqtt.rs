//! MQTT broker transport.
//!
//! Packets are wrapped in a `ServiceEnvelope` and published under
//! `<root>/<channel>/<!nodeid>`. Broker traffic is treated as lower priority
//! than the radio-side transports, so both directions are artificially delayed.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::protocol::PKI_CHANNEL_NAME;
use crate::constants::transport::{
    INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY, MQTT_CHANNEL_CAPACITY, MQTT_KEEP_ALIVE,
    MQTT_PUBLISH_DELAY, MQTT_RECEIVE_DELAY,
};
use crate::error::TransportError;
use crate::meshid::{parse_node_id, NodeId};
use crate::network::transport::{
    ListenerEvent, MeshTransport, NetworkMeshPacket, PacketHandler, PacketSource, StateHandler,
};
use crate::protobufs::{MeshPacket, ServiceEnvelope};

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic prefix, e.g. `msh/US/2/e`
    pub root_topic: String,
    pub client_id: String,
    pub tls: bool,
    /// Our node ID, used as the envelope gateway and publish-topic suffix
    pub node_id: NodeId,
}

struct Shared {
    config: MqttTransportConfig,
    connected: AtomicBool,
    previously_connected: AtomicBool,
    /// Every channel ever joined; re-subscribed on each (re)connect
    channels: Mutex<BTreeSet<String>>,
    client: RwLock<Option<AsyncClient>>,
    packet_handler: RwLock<Option<PacketHandler>>,
    state_handler: RwLock<Option<StateHandler>>,
    receive_delay: Duration,
}

impl Shared {
    fn subscribe_topic(&self, channel: &str) -> String {
        format!("{}/{}/+", self.config.root_topic, channel)
    }

    fn publish_topic(&self, channel: &str) -> String {
        format!("{}/{}/{}", self.config.root_topic, channel, self.config.node_id)
    }

    fn emit(&self, event: ListenerEvent) {
        let handler = self.state_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn mark_up(&self) {
        if self.previously_connected.swap(true, Ordering::SeqCst) {
            self.emit(ListenerEvent::Restarted);
        } else {
            self.emit(ListenerEvent::Started);
        }
    }

    fn mark_down(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(ListenerEvent::ConnectionLost);
        }
    }

    /// Flag the connection up and snapshot the topics to subscribe. Shares
    /// the channel lock with `track_channel`, so a channel added concurrently
    /// lands either in this snapshot or in a direct subscribe.
    fn connect_topics(&self) -> Vec<String> {
        let channels = self.channels.lock();
        self.connected.store(true, Ordering::SeqCst);
        channels.iter().map(|c| self.subscribe_topic(c)).collect()
    }

    /// Remember a channel, returning its topic when it must be subscribed now
    fn track_channel(&self, channel: &str) -> Option<String> {
        let mut channels = self.channels.lock();
        let newly_added = channels.insert(channel.to_string());
        (newly_added && self.connected.load(Ordering::SeqCst)).then(|| self.subscribe_topic(channel))
    }

    fn subscribe_all(&self, client: &AsyncClient) {
        for topic in self.connect_topics() {
            // try_subscribe: the event loop is not being polled while we are here
            match client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                Ok(()) => tracing::debug!("📥 Subscribed to {}", topic),
                Err(e) => tracing::warn!("❌ Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    fn handle_publish(&self, publish: Publish) {
        let env = match ServiceEnvelope::decode(publish.payload.as_ref()) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("⚠️  Failed to decode service envelope on {}: {}", publish.topic, e);
                return;
            }
        };
        let Some(packet) = env.packet else {
            tracing::debug!("Envelope on {} carried no packet", publish.topic);
            return;
        };
        let gateway = parse_node_id(&env.gateway_id).ok();
        let Some(handler) = self.packet_handler.read().clone() else {
            return;
        };
        let delay = self.receive_delay;
        let network_packet = NetworkMeshPacket {
            packet,
            channel_name: Some(env.channel_id),
            gateway,
            source: PacketSource::Mqtt,
        };
        tokio::spawn(async move {
            // Give the other transports a head start on the same packet
            tokio::time::sleep(delay).await;
            handler(network_packet).await;
        });
    }

    async fn run_event_loop(
        self: Arc<Self>,
        client: AsyncClient,
        mut eventloop: EventLoop,
        token: CancellationToken,
    ) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(
                            "✅ Connected to MQTT broker {}:{} (root {})",
                            self.config.host,
                            self.config.port,
                            self.config.root_topic
                        );
                        delay = INITIAL_RECONNECT_DELAY;
                        self.subscribe_all(&client);
                        self.mark_up();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => self.handle_publish(publish),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("❌ MQTT connection error: {} (reconnecting in {:?})", e, delay);
                        self.mark_down();
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("MQTT event loop stopped");
    }
}

pub struct MqttTransport {
    shared: Arc<Shared>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    publish_delay: Duration,
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> Self {
        let mut channels = BTreeSet::new();
        channels.insert(PKI_CHANNEL_NAME.to_string());
        Self {
            shared: Arc::new(Shared {
                config,
                connected: AtomicBool::new(false),
                previously_connected: AtomicBool::new(false),
                channels: Mutex::new(channels),
                client: RwLock::new(None),
                packet_handler: RwLock::new(None),
                state_handler: RwLock::new(None),
                receive_delay: MQTT_RECEIVE_DELAY,
            }),
            running: Mutex::new(None),
            publish_delay: MQTT_PUBLISH_DELAY,
        }
    }

    fn options(&self) -> MqttOptions {
        let cfg = &self.shared.config;
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(username) = &cfg.username {
            options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
        }
        if cfg.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    /// Wrap a packet the way broker uplinks do
    pub fn build_envelope(&self, channel: &str, packet: &MeshPacket) -> ServiceEnvelope {
        ServiceEnvelope {
            packet: Some(packet.clone()),
            channel_id: channel.to_string(),
            gateway_id: self.shared.config.node_id.to_string(),
        }
    }

    pub fn joined_channels(&self) -> Vec<String> {
        self.shared.channels.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl MeshTransport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let (client, eventloop) = AsyncClient::new(self.options(), MQTT_CHANNEL_CAPACITY);
        *self.shared.client.write() = Some(client.clone());

        tracing::info!(
            "🔌 Connecting to MQTT broker {}:{}",
            self.shared.config.host,
            self.shared.config.port
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            self.shared
                .clone()
                .run_event_loop(client, eventloop, token.clone()),
        );
        *running = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        let client = self.shared.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                tracing::debug!("MQTT disconnect request not delivered: {}", e);
            }
        }
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("MQTT event loop ended abnormally: {}", e);
            }
            tracing::info!("🔌 MQTT transport stopped");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn add_channel(&self, channel: &str) {
        // Otherwise subscribed on the next ConnAck
        let Some(topic) = self.shared.track_channel(channel) else {
            return;
        };
        let client = self.shared.client.read().clone();
        if let Some(client) = client {
            match client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                Ok(()) => tracing::info!("📥 Subscribed to {}", topic),
                Err(e) => tracing::warn!("❌ Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    async fn send_packet(&self, channel: &str, packet: &MeshPacket) -> Result<(), TransportError> {
        let client = self
            .shared
            .client
            .read()
            .clone()
            .filter(|_| self.is_connected())
            .ok_or(TransportError::NotConnected("mqtt"))?;

        let payload = self.build_envelope(channel, packet).encode_to_vec();
        let topic_channel = if packet.pki_encrypted {
            PKI_CHANNEL_NAME
        } else {
            channel
        };
        let topic = self.shared.publish_topic(topic_channel);

        // Let the radio-side transports go first
        tokio::time::sleep(self.publish_delay).await;
        client
            .publish(topic.clone(), QoS::AtMostOnce, false, payload)
            .await?;
        tracing::debug!("📤 Published packet {} to {}", packet.id, topic);
        Ok(())
    }

    fn set_packet_handler(&self, handler: PacketHandler) {
        *self.shared.packet_handler.write() = Some(handler);
    }

    fn set_state_handler(&self, handler: StateHandler) {
        *self.shared.state_handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobufs::{mesh_packet::PayloadVariant, Data, PortNum};
    use bytes::Bytes;
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    fn transport() -> MqttTransport {
        MqttTransport::new(MqttTransportConfig {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            root_topic: "msh/US/2/e".into(),
            client_id: "meshbridge-test".into(),
            tls: false,
            node_id: NodeId(0xAABB_CCDD),
        })
    }

    fn text_packet() -> MeshPacket {
        MeshPacket {
            from: 0x1234,
            to: 0xFFFF_FFFF,
            id: 55,
            payload_variant: Some(PayloadVariant::Decoded(Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: b"hey".to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[test]
    fn test_topics() {
        let t = transport();
        assert_eq!(t.shared.subscribe_topic("LongFast"), "msh/US/2/e/LongFast/+");
        assert_eq!(t.shared.publish_topic("PKI"), "msh/US/2/e/PKI/!aabbccdd");
    }

    #[test]
    fn test_pki_channel_is_joined_up_front() {
        assert_eq!(transport().joined_channels(), vec!["PKI".to_string()]);
    }

    #[test]
    fn test_envelope_names_us_as_gateway() {
        let env = transport().build_envelope("LongFast", &text_packet());
        assert_eq!(env.gateway_id, "!aabbccdd");
        assert_eq!(env.channel_id, "LongFast");
        assert_eq!(env.packet.unwrap().id, 55);
    }

    #[tokio::test]
    async fn test_add_channel_before_connect_is_queued() {
        let t = transport();
        t.add_channel("LongFast").await;
        t.add_channel("LongFast").await;
        assert_eq!(
            t.joined_channels(),
            vec!["LongFast".to_string(), "PKI".to_string()]
        );
    }

    #[test]
    fn test_channel_added_around_connack_is_subscribed_once() {
        let t = transport();
        assert_eq!(t.shared.track_channel("LongFast"), None);

        let topics = t.shared.connect_topics();
        assert!(t.is_connected());
        assert_eq!(
            topics,
            vec!["msh/US/2/e/LongFast/+".to_string(), "msh/US/2/e/PKI/+".to_string()]
        );

        // joined after the snapshot: subscribed directly
        assert_eq!(
            t.shared.track_channel("Secondary").as_deref(),
            Some("msh/US/2/e/Secondary/+")
        );
        assert_eq!(t.shared.track_channel("Secondary"), None);
        assert_eq!(t.shared.track_channel("LongFast"), None);
    }

    #[test]
    fn test_reconnect_reports_restart() {
        let t = transport();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        t.set_state_handler(Arc::new(move |e: ListenerEvent| sink.lock().push(e)));

        t.shared.connect_topics();
        t.shared.mark_up();
        t.shared.mark_down();
        t.shared.mark_down();
        t.shared.connect_topics();
        t.shared.mark_up();

        assert_eq!(
            *events.lock(),
            vec![
                ListenerEvent::Started,
                ListenerEvent::ConnectionLost,
                ListenerEvent::Restarted
            ]
        );
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let t = transport();
        let err = t.send_packet("LongFast", &text_packet()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected("mqtt")));
    }

    #[tokio::test]
    async fn test_inbound_publish_is_delayed_and_forwarded() {
        let t = transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        t.set_packet_handler(Arc::new(move |pkt: NetworkMeshPacket| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(pkt);
            }
            .boxed()
        }));

        let env = ServiceEnvelope {
            packet: Some(text_packet()),
            channel_id: "LongFast".into(),
            gateway_id: "!00000abc".into(),
        };
        let publish = Publish::new(
            "msh/US/2/e/LongFast/!00000abc",
            QoS::AtMostOnce,
            Bytes::from(env.encode_to_vec()),
        );
        let started = tokio::time::Instant::now();
        t.shared.handle_publish(publish);

        let pkt = rx.recv().await.unwrap();
        assert!(started.elapsed() >= MQTT_RECEIVE_DELAY);
        assert_eq!(pkt.channel_name.as_deref(), Some("LongFast"));
        assert_eq!(pkt.gateway, Some(NodeId(0xABC)));
        assert_eq!(pkt.source, PacketSource::Mqtt);
        assert_eq!(pkt.packet.id, 55);
    }
}
