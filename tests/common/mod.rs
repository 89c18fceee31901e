//! Common test utilities for mesh integration tests
//!
//! Every node runs on loopback with its own discovery port and announces
//! directly to the others, so tests never depend on subnet broadcast.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshnote::config::{DirectSettings, LanSettings, SessionSettings};
use meshnote::mesh::{
    DirectTransport, FixedGroupService, LanTransport, SessionCoordinator, SessionEvent, Transport,
};
use tokio::sync::broadcast::{self, error::RecvError};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

/// Reserve a UDP port on loopback and release it again
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Reserve a TCP port on loopback and release it again
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// LAN settings for a node on `own_port` that announces to `peer_ports`
pub fn lan_settings(own_port: u16, peer_ports: &[u16]) -> LanSettings {
    LanSettings {
        bind_addr: "127.0.0.1".to_string(),
        data_port: 0,
        discovery_port: own_port,
        announce_interval_ms: 50,
        peer_ttl_ms: 1000,
        connect_timeout_ms: 1000,
        announce_targets: peer_ports
            .iter()
            .map(|p| format!("127.0.0.1:{}", p))
            .collect(),
        ..LanSettings::default()
    }
}

/// Session settings with a short note debounce
pub fn session_settings() -> SessionSettings {
    SessionSettings {
        note_debounce_ms: 50,
        ..SessionSettings::default()
    }
}

/// A LAN-only node with a fixed id
pub fn lan_node(id: &str, settings: LanSettings) -> (SessionCoordinator, Arc<LanTransport>) {
    let lan = Arc::new(LanTransport::new(settings));
    let transport: Arc<dyn Transport> = lan.clone();
    let coordinator = SessionCoordinator::new(session_settings(), vec![transport])
        .with_fixed_id(Some(id.to_string()));
    (coordinator, lan)
}

/// A direct-link-only node with a fixed id and role
pub fn direct_node(
    id: &str,
    role: &str,
    port: u16,
    owner_addr: Option<String>,
) -> (SessionCoordinator, Arc<DirectTransport>) {
    let settings = DirectSettings {
        enabled: true,
        port,
        connect_timeout_ms: 1000,
        role: role.to_string(),
        owner_addr,
    };
    let service = Arc::new(FixedGroupService::from_settings(&settings));
    let direct = Arc::new(DirectTransport::new(settings, service));
    let transport: Arc<dyn Transport> = direct.clone();
    let coordinator = SessionCoordinator::new(session_settings(), vec![transport])
        .with_fixed_id(Some(id.to_string()));
    (coordinator, direct)
}

/// Receive events until `pick` returns a value; panics after [`WAIT`]
pub async fn wait_for<T>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = pick(&event) {
                        return value;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("observer channel closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for session event")
}

/// Collect everything published during `window`
pub async fn drain_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => return events,
        }
    }
}

/// Poll `check` until it holds; panics after [`WAIT`]
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    result.expect("condition not reached in time");
}

/// Wait until this node reports a connected peer with `peer_id`
pub async fn wait_connected(rx: &mut broadcast::Receiver<SessionEvent>, peer_id: &str) {
    wait_for(rx, |event| match event {
        SessionEvent::PeerConnected { peer, .. } if peer.id == peer_id => Some(()),
        _ => None,
    })
    .await
}
