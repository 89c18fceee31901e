//! Local-network transport
//!
//! UDP announces advertise `{id, name, port}` on a fixed discovery port.
//! Every node that hears an announce records the sender and, if its own id
//! sorts lower, dials the sender's data port. Connections are a flat mesh of
//! line-framed TCP links with a `lan_hello` handshake; nothing is relayed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::LanSettings;
use crate::error::{Error, Result};
use crate::protocol::{Announce, Envelope, HelloKind};

use super::link::{LinkInfo, LinkTable};
use super::registry::{DiscoveredPeer, PeerRegistry};
use super::transport::{
    Direction, LogLevel, Transport, TransportContext, TransportEvent, TransportKind,
    TransportStatus,
};

/// Largest announce datagram read
const DATAGRAM_BUF: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LanState::Stopped => "stopped",
            LanState::Starting => "starting",
            LanState::Running => "running",
            LanState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Everything the background tasks share for one run
struct LanShared {
    settings: LanSettings,
    ctx: TransportContext,
    registry: Arc<PeerRegistry>,
    links: Arc<LinkTable>,
    data_port: u16,
    dials: Mutex<Vec<JoinHandle<()>>>,
}

struct LanRuntime {
    shared: Arc<LanShared>,
    tasks: Vec<JoinHandle<()>>,
    data_addr: SocketAddr,
    discovery_addr: SocketAddr,
}

// ─────────────────────────────────────────────────────────────────
// LAN Transport
// ─────────────────────────────────────────────────────────────────

/// UDP discovery plus TCP line connections on the local network
pub struct LanTransport {
    settings: LanSettings,
    registry: Arc<PeerRegistry>,
    state: RwLock<LanState>,
    runtime: Mutex<Option<LanRuntime>>,
}

impl LanTransport {
    pub fn new(settings: LanSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(PeerRegistry::new()),
            state: RwLock::new(LanState::Stopped),
            runtime: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LanState {
        *self.state.read()
    }

    /// Bound TCP data address while running
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.data_addr)
    }

    /// Bound UDP discovery address while running
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.discovery_addr)
    }

    /// Live connections, bound or still in handshake
    pub fn links(&self) -> Vec<LinkInfo> {
        self.runtime
            .lock()
            .as_ref()
            .map(|r| r.shared.links.links())
            .unwrap_or_default()
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        self.registry.all_peers()
    }

    fn set_state(&self, state: LanState, ctx: &TransportContext) {
        *self.state.write() = state;
        ctx.try_emit(TransportEvent::StateChanged {
            transport: TransportKind::Lan,
            state: state.to_string(),
        });
    }

    fn links_table(&self) -> Option<Arc<LinkTable>> {
        self.runtime
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.shared.links))
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn start(&self, ctx: TransportContext) -> Result<()> {
        {
            let mut state = self.state.write();
            let current = *state;
            if current != LanState::Stopped {
                debug!(state = %current, "LAN transport already started");
                return Ok(());
            }
            *state = LanState::Starting;
        }
        self.set_state(LanState::Starting, &ctx);

        let (listener, socket, data_addr, discovery_addr) =
            match bind_sockets(&self.settings).await {
                Ok(bound) => bound,
                Err(e) => {
                    self.set_state(LanState::Stopped, &ctx);
                    return Err(e);
                }
            };
        let socket = Arc::new(socket);

        let links = LinkTable::new(
            TransportKind::Lan,
            HelloKind::Lan,
            ctx.identity.clone(),
            ctx.events.clone(),
        );
        let shared = Arc::new(LanShared {
            settings: self.settings.clone(),
            ctx: ctx.clone(),
            registry: Arc::clone(&self.registry),
            links,
            data_port: data_addr.port(),
            dials: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(accept_loop(Arc::clone(&shared), listener)),
            tokio::spawn(discovery_loop(Arc::clone(&shared), Arc::clone(&socket))),
            tokio::spawn(announce_loop(Arc::clone(&shared), socket)),
        ];

        *self.runtime.lock() = Some(LanRuntime {
            shared,
            tasks,
            data_addr,
            discovery_addr,
        });
        self.set_state(LanState::Running, &ctx);

        info!(
            data = %data_addr,
            discovery = %discovery_addr,
            id = %ctx.identity.id,
            "LAN transport running"
        );
        ctx.log(
            TransportKind::Lan,
            LogLevel::Info,
            format!("listening on {} (discovery {})", data_addr, discovery_addr),
        )
        .await;

        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };
        let ctx = runtime.shared.ctx.clone();
        self.set_state(LanState::Stopping, &ctx);

        // Sockets close once the owning tasks are gone
        for task in runtime.tasks {
            task.abort();
            let _ = task.await;
        }
        for dial in runtime.shared.dials.lock().drain(..) {
            dial.abort();
        }
        runtime.shared.links.close_all();
        self.registry.clear();

        self.set_state(LanState::Stopped, &ctx);
        info!("LAN transport stopped");
    }

    fn broadcast(&self, line: &str) -> usize {
        self.links_table()
            .map(|links| links.broadcast(line))
            .unwrap_or(0)
    }

    fn send_to(&self, peer_id: &str, line: &str) -> Result<()> {
        match self.links_table() {
            Some(links) => links.send_to(peer_id, line),
            None => Err(Error::PeerNotConnected {
                peer: peer_id.to_string(),
                transport: TransportKind::Lan,
            }),
        }
    }

    fn status(&self) -> TransportStatus {
        let state = self.state();
        let running = state == LanState::Running;
        let connected = self
            .links_table()
            .map(|links| links.connected_count())
            .unwrap_or(0);

        TransportStatus {
            kind: TransportKind::Lan,
            state: state.to_string(),
            running,
            advertising: running,
            discovering: running,
            connected,
            discovered: self.registry.peer_count(),
        }
    }
}

async fn bind_sockets(
    settings: &LanSettings,
) -> Result<(TcpListener, UdpSocket, SocketAddr, SocketAddr)> {
    let data = format!("{}:{}", settings.bind_addr, settings.data_port);
    let listener = TcpListener::bind(&data)
        .await
        .map_err(|e| Error::unavailable(TransportKind::Lan, format!("bind {}: {}", data, e)))?;

    let discovery = format!("{}:{}", settings.bind_addr, settings.discovery_port);
    let socket = UdpSocket::bind(&discovery)
        .await
        .map_err(|e| Error::unavailable(TransportKind::Lan, format!("bind {}: {}", discovery, e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::unavailable(TransportKind::Lan, format!("broadcast: {}", e)))?;

    let data_addr = listener.local_addr()?;
    let discovery_addr = socket.local_addr()?;
    Ok((listener, socket, data_addr, discovery_addr))
}

// ─────────────────────────────────────────────────────────────────
// Background Tasks
// ─────────────────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<LanShared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(addr = %addr, "Incoming LAN connection");
                shared.links.attach(stream, Direction::Inbound, None);
            }
            Err(e) => {
                error!(error = %e, "LAN accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn discovery_loop(shared: Arc<LanShared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "Discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let text = String::from_utf8_lossy(&buf[..n]);
        match Envelope::parse(&text) {
            Ok(Envelope::LanAnnounce(announce)) => shared.on_announce(announce, src).await,
            Ok(other) => debug!(kind = other.type_name(), src = %src, "Ignoring datagram"),
            Err(e) => debug!(src = %src, error = %e, "Malformed announce"),
        }
    }
}

async fn announce_loop(shared: Arc<LanShared>, socket: Arc<UdpSocket>) {
    let mut ticker = tokio::time::interval(shared.settings.announce_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        shared.announce(&socket).await;
        shared.prune().await;
    }
}

impl LanShared {
    async fn announce(&self, socket: &UdpSocket) {
        let envelope = Envelope::LanAnnounce(Announce {
            id: self.ctx.identity.id.clone(),
            name: self.ctx.identity.name.clone(),
            port: self.data_port,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode announce");
                return;
            }
        };

        let targets = if self.settings.announce_targets.is_empty() {
            vec![format!("255.255.255.255:{}", self.settings.discovery_port)]
        } else {
            self.settings.announce_targets.clone()
        };

        for target in &targets {
            if let Err(e) = socket.send_to(payload.as_bytes(), target.as_str()).await {
                debug!(target = %target, error = %e, "Announce send failed");
            }
        }
    }

    async fn prune(&self) {
        let stale = self.registry.prune_stale(self.settings.peer_ttl());
        if stale.is_empty() {
            return;
        }

        for peer in &stale {
            info!(peer = %peer.id, name = %peer.name, "Discovered peer aged out");
        }
        self.ctx
            .emit(TransportEvent::DiscoveryChanged {
                transport: TransportKind::Lan,
                discovered: self.registry.peer_count(),
            })
            .await;
    }

    async fn on_announce(self: &Arc<Self>, announce: Announce, src: SocketAddr) {
        if announce.id == self.ctx.identity.id {
            return;
        }

        let addr = SocketAddr::new(src.ip(), announce.port);
        if self.registry.upsert(&announce.id, &announce.name, addr) {
            info!(peer = %announce.id, name = %announce.name, addr = %addr, "Discovered peer");
            self.ctx
                .emit(TransportEvent::DiscoveryChanged {
                    transport: TransportKind::Lan,
                    discovered: self.registry.peer_count(),
                })
                .await;
            self.ctx
                .log(
                    TransportKind::Lan,
                    LogLevel::Info,
                    format!("discovered {} at {}", announce.name, addr),
                )
                .await;
        }

        self.maybe_connect(&announce.id, addr);
    }

    /// Dial a discovered peer if the tie-break makes us the initiator
    fn maybe_connect(self: &Arc<Self>, peer_id: &str, addr: SocketAddr) {
        if !self.ctx.identity.initiates_to(peer_id) {
            return;
        }
        if !self.links.try_reserve_dial(peer_id) {
            return;
        }

        let shared = Arc::clone(self);
        let peer_id = peer_id.to_string();
        let task = tokio::spawn(async move {
            shared.dial(peer_id, addr).await;
        });

        let mut dials = self.dials.lock();
        dials.retain(|d| !d.is_finished());
        dials.push(task);
    }

    async fn dial(&self, peer_id: String, addr: SocketAddr) {
        debug!(peer = %peer_id, addr = %addr, "Dialing peer");
        let result = match tokio::time::timeout(
            self.settings.connect_timeout(),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::connection_failed(addr.to_string(), e.to_string())),
            Err(_) => Err(Error::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.settings.connect_timeout_ms,
            }),
        };

        match result {
            Ok(stream) => {
                self.links.attach(stream, Direction::Outbound, Some(peer_id));
            }
            Err(e) => {
                // Next announce from the peer retries
                warn!(peer = %peer_id, error = %e, "Dial failed");
                self.links.release_dial(&peer_id);
                self.ctx
                    .log(TransportKind::Lan, LogLevel::Warn, e.to_string())
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerIdentity;
    use tokio::sync::mpsc;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn loopback_settings(discovery_port: u16) -> LanSettings {
        LanSettings {
            bind_addr: "127.0.0.1".to_string(),
            data_port: 0,
            discovery_port,
            announce_interval_ms: 50,
            peer_ttl_ms: 200,
            announce_targets: vec![format!("127.0.0.1:{}", discovery_port)],
            ..LanSettings::default()
        }
    }

    fn context(id: &str) -> (TransportContext, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let ctx = TransportContext {
            identity: PeerIdentity::new(id, id),
            host_preferred: false,
            events: tx,
        };
        (ctx, rx)
    }

    #[test]
    fn test_status_when_stopped() {
        let lan = LanTransport::new(LanSettings::default());
        let status = lan.status();
        assert_eq!(status.state, "stopped");
        assert!(!status.running);
        assert_eq!(lan.broadcast("x"), 0);
        assert!(lan.send_to("p", "x").is_err());
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let lan = LanTransport::new(loopback_settings(free_udp_port()));
        let (ctx, _rx) = context("a");

        lan.start(ctx.clone()).await.unwrap();
        assert_eq!(lan.state(), LanState::Running);
        assert!(lan.status().advertising);
        assert!(lan.data_addr().unwrap().port() > 0);

        // Second start is a no-op
        lan.start(ctx).await.unwrap();

        lan.stop().await;
        assert_eq!(lan.state(), LanState::Stopped);
        assert!(lan.data_addr().is_none());
        lan.stop().await;
    }

    #[tokio::test]
    async fn test_port_conflict_is_unavailable() {
        let port = free_udp_port();
        let first = LanTransport::new(loopback_settings(port));
        let second = LanTransport::new(loopback_settings(port));
        let (ctx_a, _rx_a) = context("a");
        let (ctx_b, _rx_b) = context("b");

        first.start(ctx_a).await.unwrap();
        let err = second.start(ctx_b).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransportUnavailable {
                transport: TransportKind::Lan,
                ..
            }
        ));
        assert_eq!(second.state(), LanState::Stopped);
        first.stop().await;
    }

    #[tokio::test]
    async fn test_own_announces_are_ignored() {
        let lan = LanTransport::new(loopback_settings(free_udp_port()));
        let (ctx, _rx) = context("solo");
        lan.start(ctx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lan.discovered().is_empty());
        assert!(lan.links().is_empty());
        lan.stop().await;
    }
}
