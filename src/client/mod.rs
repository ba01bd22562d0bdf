//! Mesh client: owns channels, transports and caches, and drives the send
//! and receive pipelines.
//!
//! A `MeshClient` is a cheap handle (`Arc` inside) that can be cloned into
//! tasks. Transports hold only a weak reference back to it, so dropping the
//! last handle tears everything down.

mod api;
mod receive;
mod responder;
pub mod route;
mod send;

pub use api::TracerouteOutcome;
pub use send::{packet_priority, EncryptionType, PacketInfo};

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use futures_util::FutureExt;

use crate::constants::protocol::{DEFAULT_HOP_LIMIT, MAX_HOPS};
use crate::constants::timing::{
    DEDUP_TTL, MAINTENANCE_INTERVAL, NEIGHBOR_BROADCAST_INTERVAL, NODE_INFO_RESEND_GUARD,
    REQUEST_THROTTLE, TRACEROUTE_COOLDOWN, TRACEROUTE_RESPONSE_TIMEOUT,
};
use crate::error::{MeshError, MeshResult};
use crate::events::{ChannelJoinedEvent, ConnectionState, EventHandler, MeshEvent};
use crate::meshid::{ChannelDef, NodeId};
use crate::network::dedup_filter::DeduplicationFilter;
use crate::network::rate_limiter::{RequestThrottle, TracerouteTracker};
use crate::network::transport::{ListenerEvent, MeshTransport, NetworkMeshPacket};
use crate::packet_id::PacketIdGenerator;

/// Decides whether a node ID belongs to this bridge
pub type ManagedNodeFn = Arc<dyn Fn(NodeId) -> bool + Send + Sync>;

/// Returns the base64 key for a node, if known
pub type KeyRequestFn = Arc<dyn Fn(NodeId) -> Option<String> + Send + Sync>;

/// Returns the neighbors to advertise for a managed node
pub type NeighborProviderFn = Arc<dyn Fn(NodeId) -> Vec<NodeId> + Send + Sync>;

/// Tunables for a `MeshClient`. `new` fills in the firmware-compatible defaults.
#[derive(Debug, Clone)]
pub struct MeshClientConfig {
    /// The bridge's own mesh identity
    pub node_id: NodeId,
    pub hop_limit: u32,
    pub neighbor_broadcast_interval: Duration,
    pub dedup_ttl: Duration,
    pub request_throttle: Duration,
    pub traceroute_cooldown: Duration,
    pub traceroute_timeout: Duration,
    pub node_info_resend_guard: Duration,
    pub maintenance_interval: Duration,
}

impl MeshClientConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            neighbor_broadcast_interval: NEIGHBOR_BROADCAST_INTERVAL,
            dedup_ttl: DEDUP_TTL,
            request_throttle: REQUEST_THROTTLE,
            traceroute_cooldown: TRACEROUTE_COOLDOWN,
            traceroute_timeout: TRACEROUTE_RESPONSE_TIMEOUT,
            node_info_resend_guard: NODE_INFO_RESEND_GUARD,
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}

#[derive(Default)]
struct LinkState {
    up: HashSet<&'static str>,
    ever_connected: bool,
}

struct ClientInner {
    node_id: NodeId,
    start_time: Instant,
    hop_limit: AtomicU32,
    neighbor_broadcast_secs: AtomicU32,
    node_info_resend_guard: Duration,
    maintenance_interval: Duration,

    packet_ids: PacketIdGenerator,
    dedup: DeduplicationFilter,
    throttle: RequestThrottle,
    traceroutes: TracerouteTracker,
    node_info_sent: Mutex<HashMap<NodeId, Instant>>,

    channels: RwLock<HashMap<String, ChannelDef>>,
    primary_channel: RwLock<ChannelDef>,
    transports: RwLock<Vec<Arc<dyn MeshTransport>>>,

    event_handlers: RwLock<Vec<EventHandler>>,
    managed_node: RwLock<ManagedNodeFn>,
    public_key_handler: RwLock<Option<KeyRequestFn>>,
    private_key_handler: RwLock<Option<KeyRequestFn>>,
    neighbor_provider: RwLock<Option<NeighborProviderFn>>,

    link_state: Mutex<LinkState>,
    maintenance: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<ClientInner>,
}

impl MeshClient {
    pub fn new(node_id: NodeId) -> Self {
        Self::with_config(MeshClientConfig::new(node_id))
    }

    pub fn with_config(config: MeshClientConfig) -> Self {
        let own_id = config.node_id;
        let client = Self {
            inner: Arc::new(ClientInner {
                node_id: own_id,
                start_time: Instant::now(),
                hop_limit: AtomicU32::new(clamp_hop_limit(config.hop_limit)),
                neighbor_broadcast_secs: AtomicU32::new(
                    config.neighbor_broadcast_interval.as_secs() as u32,
                ),
                node_info_resend_guard: config.node_info_resend_guard,
                maintenance_interval: config.maintenance_interval,
                packet_ids: PacketIdGenerator::new(),
                dedup: DeduplicationFilter::new(config.dedup_ttl),
                throttle: RequestThrottle::new(config.request_throttle),
                traceroutes: TracerouteTracker::new(
                    config.traceroute_cooldown,
                    config.traceroute_timeout,
                ),
                node_info_sent: Mutex::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                primary_channel: RwLock::new(ChannelDef::default_channel()),
                transports: RwLock::new(Vec::new()),
                event_handlers: RwLock::new(Vec::new()),
                managed_node: RwLock::new(Arc::new(move |id: NodeId| id == own_id)),
                public_key_handler: RwLock::new(None),
                private_key_handler: RwLock::new(None),
                neighbor_provider: RwLock::new(None),
                link_state: Mutex::new(LinkState::default()),
                maintenance: Mutex::new(None),
            }),
        };
        tracing::debug!("Mesh client created for {}", own_id);
        client
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn uptime(&self) -> Duration {
        self.inner.start_time.elapsed()
    }

    // ----- collaborators -----

    pub fn add_event_handler(&self, handler: EventHandler) {
        self.inner.event_handlers.write().push(handler);
    }

    pub fn set_managed_node_handler(&self, handler: ManagedNodeFn) {
        *self.inner.managed_node.write() = handler;
    }

    pub fn set_public_key_handler(&self, handler: KeyRequestFn) {
        *self.inner.public_key_handler.write() = Some(handler);
    }

    pub fn set_private_key_handler(&self, handler: KeyRequestFn) {
        *self.inner.private_key_handler.write() = Some(handler);
    }

    pub fn set_neighbor_provider(&self, provider: NeighborProviderFn) {
        *self.inner.neighbor_provider.write() = Some(provider);
    }

    pub fn is_managed(&self, node: NodeId) -> bool {
        let check = self.inner.managed_node.read().clone();
        check(node)
    }

    // ----- configuration -----

    /// Set the hop limit for new packets, clamped to what the firmware honors
    /// after the bridge's own hop
    pub fn set_hop_limit(&self, hop_limit: u32) {
        let clamped = clamp_hop_limit(hop_limit);
        if clamped != hop_limit {
            tracing::warn!("⚠️  Hop limit {} out of range, using {}", hop_limit, clamped);
        }
        self.inner.hop_limit.store(clamped, Ordering::Relaxed);
    }

    pub fn hop_limit(&self) -> u32 {
        self.inner.hop_limit.load(Ordering::Relaxed)
    }

    pub fn set_neighbor_broadcast_interval(&self, interval: Duration) {
        self.inner
            .neighbor_broadcast_secs
            .store(interval.as_secs() as u32, Ordering::Relaxed);
    }

    pub fn neighbor_broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.inner.neighbor_broadcast_secs.load(Ordering::Relaxed) as u64)
    }

    // ----- channels -----

    pub async fn add_channel(&self, name: &str, key: Option<&str>) -> MeshResult<()> {
        let def = ChannelDef::new(name, key)?;
        self.add_channel_def(def).await
    }

    /// Join a channel. Re-adding an identical definition is a no-op; a new or
    /// changed one is announced and subscribed on every transport before it
    /// is recorded.
    pub async fn add_channel_def(&self, def: ChannelDef) -> MeshResult<()> {
        if self.inner.channels.read().get(def.name()) == Some(&def) {
            return Ok(());
        }

        self.dispatch(&MeshEvent::ChannelJoined(ChannelJoinedEvent {
            channel: def.name().to_string(),
            key: def.is_encrypted().then(|| def.key_string().to_string()),
        }));

        for transport in self.transports() {
            transport.add_channel(def.name()).await;
        }

        tracing::info!("📻 Joined channel {} (encrypted: {})", def.name(), def.is_encrypted());
        self.inner
            .channels
            .write()
            .insert(def.name().to_string(), def);
        Ok(())
    }

    /// Join a channel and make it the one used for announcements
    pub async fn set_primary_channel(&self, def: ChannelDef) -> MeshResult<()> {
        self.add_channel_def(def.clone()).await?;
        *self.inner.primary_channel.write() = def;
        Ok(())
    }

    pub fn primary_channel(&self) -> ChannelDef {
        self.inner.primary_channel.read().clone()
    }

    pub fn channel(&self, name: &str) -> Option<ChannelDef> {
        self.inner.channels.read().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<ChannelDef> {
        let mut channels: Vec<ChannelDef> = self.inner.channels.read().values().cloned().collect();
        channels.sort_by(|a, b| a.name().cmp(b.name()));
        channels
    }

    // ----- transports -----

    /// Register a transport and wire its callbacks back into this client
    pub fn add_transport(&self, transport: Arc<dyn MeshTransport>) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        transport.set_packet_handler(Arc::new(move |packet: NetworkMeshPacket| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    MeshClient { inner }.handle_packet(packet).await;
                }
            }
            .boxed()
        }));

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let name = transport.name();
        transport.set_state_handler(Arc::new(move |event: ListenerEvent| {
            if let Some(inner) = weak.upgrade() {
                MeshClient { inner }.on_transport_state(name, event);
            }
        }));

        tracing::info!("🔌 Registered {} transport", name);
        self.inner.transports.write().push(transport);
    }

    fn transports(&self) -> Vec<Arc<dyn MeshTransport>> {
        self.inner.transports.read().clone()
    }

    /// Start every transport, subscribe to the joined channels and begin
    /// periodic maintenance. Succeeds if at least one transport starts.
    pub async fn connect(&self) -> MeshResult<()> {
        let transports = self.transports();
        if transports.is_empty() {
            return Err(MeshError::NoTransports);
        }

        let channel_names: Vec<String> = self.inner.channels.read().keys().cloned().collect();
        let mut errors = Vec::new();
        for transport in &transports {
            for name in &channel_names {
                transport.add_channel(name).await;
            }
            match transport.start().await {
                Ok(()) => tracing::info!("✅ Started {} transport", transport.name()),
                Err(e) => {
                    tracing::error!("❌ Failed to start {} transport: {}", transport.name(), e);
                    errors.push(e);
                }
            }
        }
        if errors.len() == transports.len() {
            return Err(MeshError::AllTransportsFailed(errors));
        }

        self.start_maintenance();
        Ok(())
    }

    /// Stop every transport and the maintenance task
    pub async fn disconnect(&self) {
        let maintenance = self.inner.maintenance.lock().take();
        if let Some((token, handle)) = maintenance {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Maintenance task ended abnormally: {}", e);
            }
        }

        for transport in self.transports() {
            transport.stop().await;
        }
        self.inner.link_state.lock().up.clear();
        tracing::info!("🔌 Mesh client disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.transports().iter().any(|t| t.is_connected())
    }

    fn on_transport_state(&self, name: &'static str, event: ListenerEvent) {
        let notification = {
            let mut state = self.inner.link_state.lock();
            match event {
                ListenerEvent::Started | ListenerEvent::Restarted => {
                    let was_down = state.up.is_empty();
                    state.up.insert(name);
                    if was_down {
                        let restarted = state.ever_connected;
                        state.ever_connected = true;
                        Some(ConnectionState::Connected { restarted })
                    } else {
                        None
                    }
                }
                ListenerEvent::ConnectionLost => {
                    if state.up.remove(name) && state.up.is_empty() {
                        Some(ConnectionState::ConnectionLost)
                    } else {
                        None
                    }
                }
            }
        };

        tracing::debug!("{} transport reported {:?}", name, event);
        if let Some(state) = notification {
            match state {
                ConnectionState::Connected { restarted: true } => {
                    tracing::info!("🔄 Mesh connection restored")
                }
                ConnectionState::Connected { restarted: false } => {
                    tracing::info!("✅ Mesh connection established")
                }
                ConnectionState::ConnectionLost => {
                    tracing::warn!("⚠️  Lost connection to the mesh on every transport")
                }
            }
            self.dispatch(&MeshEvent::ConnectionState(state));
        }
    }

    // ----- events -----

    pub(crate) fn dispatch(&self, event: &MeshEvent) {
        let handlers = self.inner.event_handlers.read().clone();
        for handler in handlers {
            handler(event);
        }
    }

    // ----- maintenance -----

    fn start_maintenance(&self) {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.maintenance_interval;
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        MeshClient { inner }.run_maintenance();
                    }
                }
            }
        });
        *slot = Some((token, handle));
    }

    /// Evict expired dedup entries, throttle records and traceroute state
    pub fn run_maintenance(&self) {
        let dedup = self.inner.dedup.purge_expired();
        let throttled = self.inner.throttle.cleanup_expired();
        let (requests, records) = self.inner.traceroutes.cleanup_expired();

        let guard = self.inner.node_info_resend_guard;
        self.inner
            .node_info_sent
            .lock()
            .retain(|_, sent| sent.elapsed() < guard);

        if dedup + throttled + requests + records > 0 {
            tracing::debug!(
                "🧹 Maintenance: {} dedup entries, {} throttle records, {} pending traceroutes, {} traceroute rate records removed",
                dedup,
                throttled,
                requests,
                records
            );
        }
    }

    pub fn pending_traceroutes(&self) -> usize {
        self.inner.traceroutes.pending_count()
    }
}

fn clamp_hop_limit(hop_limit: u32) -> u32 {
    hop_limit.min(MAX_HOPS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(client: &MeshClient) -> Arc<Mutex<Vec<MeshEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.add_event_handler(Arc::new(move |e: &MeshEvent| sink.lock().push(e.clone())));
        events
    }

    #[test]
    fn test_hop_limit_is_clamped() {
        let client = MeshClient::new(NodeId(1234));
        assert_eq!(client.hop_limit(), 3);
        client.set_hop_limit(9);
        assert_eq!(client.hop_limit(), 6);
        client.set_hop_limit(5);
        assert_eq!(client.hop_limit(), 5);
    }

    #[test]
    fn test_default_managed_node_is_self() {
        let client = MeshClient::new(NodeId(1234));
        assert!(client.is_managed(NodeId(1234)));
        assert!(!client.is_managed(NodeId(5678)));
        client.set_managed_node_handler(Arc::new(|id: NodeId| id.0 > 1000));
        assert!(client.is_managed(NodeId(5678)));
    }

    #[tokio::test]
    async fn test_add_channel_is_idempotent() {
        let client = MeshClient::new(NodeId(1234));
        let events = collect_events(&client);

        client.add_channel("LongFast", Some("AQ==")).await.unwrap();
        client.add_channel("LongFast", Some("AQ==")).await.unwrap();
        assert_eq!(events.lock().len(), 1);

        // Changing the key counts as a new join
        client.add_channel("LongFast", Some("Ag==")).await.unwrap();
        assert_eq!(events.lock().len(), 2);
        assert_eq!(client.channels().len(), 1);

        match &events.lock()[1] {
            MeshEvent::ChannelJoined(e) => {
                assert_eq!(e.channel, "LongFast");
                assert_eq!(e.key.as_deref(), Some("Ag=="));
            }
            other => panic!("unexpected event {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_connect_without_transports_fails() {
        let client = MeshClient::new(NodeId(1234));
        assert!(matches!(client.connect().await, Err(MeshError::NoTransports)));
    }

    #[test]
    fn test_connection_state_aggregation() {
        let client = MeshClient::new(NodeId(1234));
        let events = collect_events(&client);

        client.on_transport_state("mqtt", ListenerEvent::Started);
        client.on_transport_state("udp", ListenerEvent::Started);
        client.on_transport_state("mqtt", ListenerEvent::ConnectionLost);
        client.on_transport_state("udp", ListenerEvent::ConnectionLost);
        client.on_transport_state("udp", ListenerEvent::Restarted);

        let states: Vec<ConnectionState> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MeshEvent::ConnectionState(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connected { restarted: false },
                ConnectionState::ConnectionLost,
                ConnectionState::Connected { restarted: true },
            ]
        );
    }

    #[test]
    fn test_duplicate_loss_report_is_ignored() {
        let client = MeshClient::new(NodeId(1234));
        let events = collect_events(&client);
        client.on_transport_state("udp", ListenerEvent::ConnectionLost);
        assert!(events.lock().is_empty());
    }
}
