//! Proximity clustering transport
//!
//! Thin adapter over a platform proximity SDK. The SDK already delivers a
//! flat mesh of message-bounded payloads, so this layer only adds policy:
//! request every endpoint found and accept every incoming request, both up
//! to a connection cap.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ClusterSettings;
use crate::error::{Error, Result};
use crate::protocol::PeerIdentity;

use super::transport::{
    Direction, LogLevel, Transport, TransportContext, TransportEvent, TransportKind,
    TransportStatus,
};

// ─────────────────────────────────────────────────────────────────
// SDK Boundary
// ─────────────────────────────────────────────────────────────────

/// Callbacks from the proximity SDK
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    EndpointFound { endpoint_id: String, name: String },
    EndpointLost { endpoint_id: String },
    ConnectionInitiated { endpoint_id: String, name: String },
    ConnectionResult { endpoint_id: String, success: bool },
    Disconnected { endpoint_id: String },
    PayloadReceived { endpoint_id: String, bytes: Vec<u8> },
    TransferUpdate {
        endpoint_id: String,
        transferred: u64,
        total: u64,
    },
}

/// Primitives offered by the platform proximity SDK
pub trait ProximitySdk: Send + Sync {
    /// Fresh callback stream for one run
    fn subscribe(&self) -> mpsc::Receiver<ClusterEvent>;

    fn start_advertising(&self, name: &str, service_id: &str) -> Result<()>;
    fn start_discovery(&self, service_id: &str) -> Result<()>;
    fn request_connection(&self, name: &str, endpoint_id: &str) -> Result<()>;
    fn accept_connection(&self, endpoint_id: &str) -> Result<()>;
    fn reject_connection(&self, endpoint_id: &str) -> Result<()>;
    fn send_payload(&self, endpoint_id: &str, bytes: &[u8]) -> Result<()>;
    fn disconnect(&self, endpoint_id: &str);

    /// Stop advertising and discovery and drop every endpoint
    fn stop_all(&self);
}

/// Stand-in for platforms without a proximity SDK; never starts
pub struct NoProximitySdk;

impl NoProximitySdk {
    fn missing() -> Error {
        Error::unavailable(TransportKind::Cluster, "no proximity SDK on this platform")
    }
}

impl ProximitySdk for NoProximitySdk {
    fn subscribe(&self) -> mpsc::Receiver<ClusterEvent> {
        mpsc::channel(1).1
    }
    fn start_advertising(&self, _name: &str, _service_id: &str) -> Result<()> {
        Err(Self::missing())
    }
    fn start_discovery(&self, _service_id: &str) -> Result<()> {
        Err(Self::missing())
    }
    fn request_connection(&self, _name: &str, _endpoint_id: &str) -> Result<()> {
        Err(Self::missing())
    }
    fn accept_connection(&self, _endpoint_id: &str) -> Result<()> {
        Err(Self::missing())
    }
    fn reject_connection(&self, _endpoint_id: &str) -> Result<()> {
        Err(Self::missing())
    }
    fn send_payload(&self, _endpoint_id: &str, _bytes: &[u8]) -> Result<()> {
        Err(Self::missing())
    }
    fn disconnect(&self, _endpoint_id: &str) {}
    fn stop_all(&self) {}
}

// ─────────────────────────────────────────────────────────────────
// Connection Policy State
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ClusterPeers {
    discovered: HashMap<String, String>,

    /// Requested or accepted, waiting for the result
    pending: HashMap<String, (String, Direction)>,

    connected: HashMap<String, String>,
}

impl ClusterPeers {
    /// Slots taken, not counting `endpoint_id`
    fn occupied_except(&self, endpoint_id: &str) -> usize {
        let pending = self
            .pending
            .keys()
            .filter(|id| id.as_str() != endpoint_id)
            .count();
        self.connected.len() + pending
    }
}

struct ClusterShared {
    settings: ClusterSettings,
    sdk: Arc<dyn ProximitySdk>,
    ctx: TransportContext,
    peers: Mutex<ClusterPeers>,
}

// ─────────────────────────────────────────────────────────────────
// Cluster Transport
// ─────────────────────────────────────────────────────────────────

/// Adapter from a proximity SDK to the transport interface
pub struct ClusterTransport {
    settings: ClusterSettings,
    sdk: Arc<dyn ProximitySdk>,
    runtime: Mutex<Option<(Arc<ClusterShared>, JoinHandle<()>)>>,
}

impl ClusterTransport {
    pub fn new(settings: ClusterSettings, sdk: Arc<dyn ProximitySdk>) -> Self {
        Self {
            settings,
            sdk,
            runtime: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Endpoint ids with an established connection
    pub fn connected_endpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared()
            .map(|s| s.peers.lock().connected.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn shared(&self) -> Option<Arc<ClusterShared>> {
        self.runtime.lock().as_ref().map(|(s, _)| Arc::clone(s))
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cluster
    }

    async fn start(&self, ctx: TransportContext) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let events = self.sdk.subscribe();
        let name = ctx.identity.name.clone();
        let service_id = self.settings.service_id.clone();

        let started = self
            .sdk
            .start_advertising(&name, &service_id)
            .and_then(|_| self.sdk.start_discovery(&service_id));
        if let Err(e) = started {
            self.sdk.stop_all();
            return Err(match e {
                Error::TransportUnavailable { .. } | Error::PermissionDenied { .. } => e,
                other => Error::unavailable(TransportKind::Cluster, other.to_string()),
            });
        }

        let shared = Arc::new(ClusterShared {
            settings: self.settings.clone(),
            sdk: Arc::clone(&self.sdk),
            ctx: ctx.clone(),
            peers: Mutex::new(ClusterPeers::default()),
        });
        let task = tokio::spawn(event_loop(Arc::clone(&shared), events));
        *self.runtime.lock() = Some((shared, task));

        ctx.try_emit(TransportEvent::StateChanged {
            transport: TransportKind::Cluster,
            state: "running".to_string(),
        });
        info!(service = %service_id, max_peers = self.settings.max_peers, "Cluster transport running");
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        let Some((shared, task)) = runtime else {
            return;
        };

        task.abort();
        let _ = task.await;
        self.sdk.stop_all();
        *shared.peers.lock() = ClusterPeers::default();

        shared.ctx.try_emit(TransportEvent::StateChanged {
            transport: TransportKind::Cluster,
            state: "stopped".to_string(),
        });
        info!("Cluster transport stopped");
    }

    fn broadcast(&self, line: &str) -> usize {
        let Some(shared) = self.shared() else {
            return 0;
        };
        let endpoints: Vec<String> = shared.peers.lock().connected.keys().cloned().collect();

        endpoints
            .iter()
            .filter(|id| match self.sdk.send_payload(id, line.as_bytes()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(endpoint = %id, error = %e, "Payload send failed");
                    false
                }
            })
            .count()
    }

    fn send_to(&self, peer_id: &str, line: &str) -> Result<()> {
        let connected = self
            .shared()
            .map(|s| s.peers.lock().connected.contains_key(peer_id))
            .unwrap_or(false);
        if !connected {
            return Err(Error::PeerNotConnected {
                peer: peer_id.to_string(),
                transport: TransportKind::Cluster,
            });
        }
        self.sdk.send_payload(peer_id, line.as_bytes())
    }

    fn status(&self) -> TransportStatus {
        match self.shared() {
            Some(shared) => {
                let peers = shared.peers.lock();
                TransportStatus {
                    kind: TransportKind::Cluster,
                    state: "running".to_string(),
                    running: true,
                    advertising: true,
                    discovering: true,
                    connected: peers.connected.len(),
                    discovered: peers.discovered.len(),
                }
            }
            None => TransportStatus::stopped(TransportKind::Cluster),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Event Handling
// ─────────────────────────────────────────────────────────────────

async fn event_loop(shared: Arc<ClusterShared>, mut events: mpsc::Receiver<ClusterEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle(event).await;
    }
    debug!("Cluster event stream ended");
}

impl ClusterShared {
    async fn handle(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::EndpointFound { endpoint_id, name } => {
                self.on_found(endpoint_id, name).await;
            }
            ClusterEvent::EndpointLost { endpoint_id } => {
                let discovered = {
                    let mut peers = self.peers.lock();
                    peers.discovered.remove(&endpoint_id);
                    peers.discovered.len()
                };
                debug!(endpoint = %endpoint_id, "Endpoint lost");
                self.emit_discovered(discovered).await;
            }
            ClusterEvent::ConnectionInitiated { endpoint_id, name } => {
                self.on_initiated(endpoint_id, name).await;
            }
            ClusterEvent::ConnectionResult {
                endpoint_id,
                success,
            } => {
                self.on_result(endpoint_id, success).await;
            }
            ClusterEvent::Disconnected { endpoint_id } => {
                let removed = self.peers.lock().connected.remove(&endpoint_id).is_some();
                if removed {
                    info!(endpoint = %endpoint_id, "Cluster peer disconnected");
                    self.ctx
                        .emit(TransportEvent::PeerDisconnected {
                            transport: TransportKind::Cluster,
                            peer_id: endpoint_id,
                            reason: "endpoint disconnected".to_string(),
                        })
                        .await;
                }
            }
            ClusterEvent::PayloadReceived { endpoint_id, bytes } => {
                let line = String::from_utf8_lossy(&bytes).into_owned();
                self.ctx
                    .emit(TransportEvent::Line {
                        transport: TransportKind::Cluster,
                        from: endpoint_id,
                        line,
                    })
                    .await;
            }
            ClusterEvent::TransferUpdate {
                endpoint_id,
                transferred,
                total,
            } => {
                trace!(endpoint = %endpoint_id, transferred, total, "Transfer update");
            }
        }
    }

    async fn on_found(&self, endpoint_id: String, name: String) {
        let (discovered, request) = {
            let mut peers = self.peers.lock();
            peers.discovered.insert(endpoint_id.clone(), name.clone());
            let known = peers.connected.contains_key(&endpoint_id)
                || peers.pending.contains_key(&endpoint_id);
            let request =
                !known && peers.occupied_except(&endpoint_id) < self.settings.max_peers;
            if request {
                peers
                    .pending
                    .insert(endpoint_id.clone(), (name.clone(), Direction::Outbound));
            }
            (peers.discovered.len(), request)
        };
        self.emit_discovered(discovered).await;

        if !request {
            debug!(endpoint = %endpoint_id, "Not requesting endpoint");
            return;
        }
        if let Err(e) = self
            .sdk
            .request_connection(&self.ctx.identity.name, &endpoint_id)
        {
            self.peers.lock().pending.remove(&endpoint_id);
            warn!(endpoint = %endpoint_id, error = %e, "Connection request failed");
            self.log(LogLevel::Warn, format!("request to {} failed: {}", name, e))
                .await;
        }
    }

    /// Auto-accept up to the cap
    async fn on_initiated(&self, endpoint_id: String, name: String) {
        let accept = {
            let mut peers = self.peers.lock();
            if peers.connected.contains_key(&endpoint_id) {
                return;
            }
            let accept = peers.occupied_except(&endpoint_id) < self.settings.max_peers;
            if accept {
                let direction = peers
                    .pending
                    .get(&endpoint_id)
                    .map(|(_, d)| *d)
                    .unwrap_or(Direction::Inbound);
                peers
                    .pending
                    .insert(endpoint_id.clone(), (name.clone(), direction));
            }
            accept
        };

        let result = if accept {
            self.sdk.accept_connection(&endpoint_id)
        } else {
            info!(endpoint = %endpoint_id, max = self.settings.max_peers, "Peer cap reached, rejecting");
            self.sdk.reject_connection(&endpoint_id)
        };
        if let Err(e) = result {
            self.peers.lock().pending.remove(&endpoint_id);
            warn!(endpoint = %endpoint_id, error = %e, "Accept/reject failed");
        }
    }

    async fn on_result(&self, endpoint_id: String, success: bool) {
        let admitted = {
            let mut peers = self.peers.lock();
            let pending = peers.pending.remove(&endpoint_id);
            match pending {
                Some((name, direction)) if success => {
                    if peers.connected.len() >= self.settings.max_peers {
                        None
                    } else {
                        peers.connected.insert(endpoint_id.clone(), name.clone());
                        Some((name, direction))
                    }
                }
                _ => None,
            }
        };

        match admitted {
            Some((name, direction)) => {
                info!(endpoint = %endpoint_id, name = %name, "Cluster peer connected");
                self.ctx
                    .emit(TransportEvent::PeerConnected {
                        transport: TransportKind::Cluster,
                        peer: PeerIdentity::new(endpoint_id, name),
                        direction,
                    })
                    .await;
            }
            None if success => {
                // Over the cap after all
                self.sdk.disconnect(&endpoint_id);
            }
            None => {
                debug!(endpoint = %endpoint_id, "Connection attempt failed");
                self.log(LogLevel::Warn, format!("connection to {} failed", endpoint_id))
                    .await;
            }
        }
    }

    async fn emit_discovered(&self, discovered: usize) {
        self.ctx
            .emit(TransportEvent::DiscoveryChanged {
                transport: TransportKind::Cluster,
                discovered,
            })
            .await;
    }

    async fn log(&self, level: LogLevel, message: String) {
        self.ctx.log(TransportKind::Cluster, level, message).await;
    }
}
