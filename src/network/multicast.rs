//! UDP multicast transport (firmware 2.6+ LAN mesh).
//!
//! Datagrams carry raw `MeshPacket`s with no envelope. The listener owns its
//! socket and rebuilds it with exponential backoff after read failures.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::transport::{
    INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY, MULTICAST_READ_BUFFER,
};
use crate::error::TransportError;
use crate::network::transport::{
    ListenerEvent, MeshTransport, NetworkMeshPacket, PacketHandler, PacketSource, StateHandler,
};
use crate::protobufs::MeshPacket;

struct Shared {
    group: SocketAddrV4,
    interface: Ipv4Addr,
    connected: AtomicBool,
    previously_connected: AtomicBool,
    packet_handler: RwLock<Option<PacketHandler>>,
    state_handler: RwLock<Option<StateHandler>>,
}

impl Shared {
    fn emit(&self, event: ListenerEvent) {
        let handler = self.state_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn mark_up(&self) {
        self.connected.store(true, Ordering::SeqCst);
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

    fn setup_socket(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.group.port()));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(self.group.ip(), &self.interface)?;
        if let Err(e) = socket.set_recv_buffer_size(MULTICAST_READ_BUFFER) {
            tracing::warn!("⚠️  Failed to set multicast receive buffer: {}", e);
        }
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    /// Read until cancelled (Ok) or the socket fails (Err)
    async fn listen_loop(&self, socket: &UdpSocket, token: &CancellationToken) -> std::io::Result<()> {
        let mut buf = vec![0u8; MULTICAST_READ_BUFFER];
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = socket.recv_from(&mut buf) => {
                    let (n, peer) = res?;
                    let packet = match MeshPacket::decode(&buf[..n]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("⚠️  Undecodable multicast datagram from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let handler = self.packet_handler.read().clone();
                    if let Some(handler) = handler {
                        handler(NetworkMeshPacket {
                            packet,
                            channel_name: None,
                            gateway: None,
                            source: PacketSource::Udp,
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn listen_with_reconnect(self: Arc<Self>, token: CancellationToken) {
        let mut backoff = Backoff::new();
        while !token.is_cancelled() {
            let socket = match self.setup_socket() {
                Ok(s) => s,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("❌ UDP multicast setup failed: {} (retry in {:?})", e, delay);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };
            backoff.reset();

            match socket.local_addr() {
                Ok(addr) => tracing::info!("📡 Listening for UDP multicast on {} ({})", self.group, addr),
                Err(_) => tracing::info!("📡 Listening for UDP multicast on {}", self.group),
            }
            self.mark_up();

            match self.listen_loop(&socket, &token).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!("❌ UDP multicast read error: {}", e);
                    self.mark_down();
                }
            }
            drop(socket);

            let delay = backoff.next_delay();
            tracing::warn!("🔄 UDP listener restarting in {:?}", delay);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("UDP multicast listener stopped");
    }
}

/// Exponential reconnect delay, back to the initial value once a socket is up
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_RECONNECT_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_RECONNECT_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.delay = INITIAL_RECONNECT_DELAY;
    }
}

pub struct MulticastTransport {
    shared: Arc<Shared>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MulticastTransport {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self::with_interface(group, port, Ipv4Addr::UNSPECIFIED)
    }

    /// Join the group on a specific local interface
    pub fn with_interface(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Self {
        Self {
            shared: Arc::new(Shared {
                group: SocketAddrV4::new(group, port),
                interface,
                connected: AtomicBool::new(false),
                previously_connected: AtomicBool::new(false),
                packet_handler: RwLock::new(None),
                state_handler: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.shared.group
    }
}

#[async_trait]
impl MeshTransport for MulticastTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.shared.clone().listen_with_reconnect(token.clone()));
        *running = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("UDP listener task ended abnormally: {}", e);
            }
            tracing::info!("🔌 UDP multicast transport stopped");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn add_channel(&self, channel: &str) {
        // The group carries every channel; nothing to subscribe to
        tracing::debug!("UDP transport sees all channels, ignoring join of {}", channel);
    }

    async fn send_packet(&self, _channel: &str, packet: &MeshPacket) -> Result<(), TransportError> {
        let data = packet.encode_to_vec();
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.send_to(&data, SocketAddr::V4(self.shared.group)).await?;
        Ok(())
    }

    fn set_packet_handler(&self, handler: PacketHandler) {
        *self.shared.packet_handler.write() = Some(handler);
    }

    fn set_state_handler(&self, handler: StateHandler) {
        *self.shared.state_handler.write() = Some(handler);
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        if let Some((token, _)) = self.running.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backoff_resets_after_rejoin() {
        let mut backoff = Backoff::new();
        let delays: Vec<Duration> = (0..7).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], INITIAL_RECONNECT_DELAY);
        assert_eq!(delays[1], INITIAL_RECONNECT_DELAY * 2);
        assert_eq!(delays[6], MAX_RECONNECT_DELAY);

        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_RECONNECT_DELAY);
    }

    #[test]
    fn test_state_transitions() {
        let transport = MulticastTransport::new(Ipv4Addr::new(224, 0, 0, 69), 4403);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        transport.set_state_handler(Arc::new(move |e: ListenerEvent| sink.lock().push(e)));

        transport.shared.mark_up();
        transport.shared.mark_down();
        // A second loss without an intervening start is not reported
        transport.shared.mark_down();
        transport.shared.mark_up();

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
    async fn test_stop_without_start_is_noop() {
        let transport = MulticastTransport::new(Ipv4Addr::new(224, 0, 0, 69), 4403);
        transport.stop().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stop_cancels_listener_promptly() {
        let transport = MulticastTransport::new(Ipv4Addr::new(239, 255, 77, 1), 0);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        transport.set_state_handler(Arc::new(move |_: ListenerEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        transport.start().await.unwrap();
        // Starting twice keeps the single listener
        transport.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), transport.stop()).await;
        assert!(stopped.is_ok());
        assert!(!transport.is_connected());
    }
}
