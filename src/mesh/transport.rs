//! Transport capability interface
//!
//! The session coordinator only sees this trait and the uniform
//! [`TransportEvent`] stream; it never branches on concrete transport types.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::PeerIdentity;

/// Transport tag carried by every connection and event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// UDP announce + TCP lines on the local network
    Lan,
    /// Platform-mediated direct wireless group
    Direct,
    /// Proximity clustering SDK
    Cluster,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Lan => "lan",
            TransportKind::Direct => "direct",
            TransportKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Severity of a diagnostic surfaced to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events from a transport to the session coordinator
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lifecycle state changed (label is transport specific)
    StateChanged {
        transport: TransportKind,
        state: String,
    },

    /// Handshake completed; the peer is now addressable
    PeerConnected {
        transport: TransportKind,
        peer: PeerIdentity,
        direction: Direction,
    },

    /// A bound connection went away
    PeerDisconnected {
        transport: TransportKind,
        peer_id: String,
        reason: String,
    },

    /// One inbound application line or payload
    Line {
        transport: TransportKind,
        from: String,
        line: String,
    },

    /// Discovery table changed size
    DiscoveryChanged {
        transport: TransportKind,
        discovered: usize,
    },

    /// Diagnostic for the log view
    Log {
        transport: TransportKind,
        level: LogLevel,
        message: String,
    },
}

/// Point-in-time view of one transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub kind: TransportKind,
    pub state: String,
    pub running: bool,
    pub advertising: bool,
    pub discovering: bool,
    pub connected: usize,
    pub discovered: usize,
}

impl TransportStatus {
    pub fn stopped(kind: TransportKind) -> Self {
        Self {
            kind,
            state: "stopped".to_string(),
            running: false,
            advertising: false,
            discovering: false,
            connected: 0,
            discovered: 0,
        }
    }
}

/// What a transport receives when the session starts
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Local identity for this session
    pub identity: PeerIdentity,

    /// Ask for the hub role where roles exist
    pub host_preferred: bool,

    /// Sink for transport events
    pub events: mpsc::Sender<TransportEvent>,
}

impl TransportContext {
    /// Send an event, ignoring a closed session
    pub async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Send without waiting; used on teardown paths
    pub fn try_emit(&self, event: TransportEvent) {
        let _ = self.events.try_send(event);
    }

    /// Surface a diagnostic line
    pub async fn log(&self, transport: TransportKind, level: LogLevel, message: impl Into<String>) {
        self.emit(TransportEvent::Log {
            transport,
            level,
            message: message.into(),
        })
        .await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────

/// Capability interface implemented by every transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Tag of this transport
    fn kind(&self) -> TransportKind;

    /// Bring the transport up; `Err` means it does not run this session
    async fn start(&self, ctx: TransportContext) -> Result<()>;

    /// Tear down sockets, timers and connections. Idempotent.
    async fn stop(&self);

    /// Queue one application line to every directly connected peer.
    /// Returns the number of peers it was queued for.
    fn broadcast(&self, line: &str) -> usize;

    /// Queue one application line to a single peer
    fn send_to(&self, peer_id: &str, line: &str) -> Result<()>;

    /// Current status
    fn status(&self) -> TransportStatus;
}
