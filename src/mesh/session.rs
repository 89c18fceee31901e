//! Session coordinator
//!
//! Owns the lifecycle of every transport for one session, fans outbound
//! envelopes to all of them, and routes inbound lines through the
//! deduplicator into the chat stream or the shared document.
//!
//! Transports report through a single mpsc channel drained by one pump task,
//! so inbound handling is serialized. Observers subscribe to a broadcast
//! channel of [`SessionEvent`]s.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{MeshConfig, SessionSettings};
use crate::error::{Error, Result};
use crate::protocol::{ChatMessage, Envelope, NoteUpdate, PeerIdentity};

use super::cluster::{ClusterTransport, NoProximitySdk};
use super::dedup::MessageDeduplicator;
use super::direct::{DirectTransport, FixedGroupService};
use super::document::{Debouncer, DocumentReplica, DocumentSnapshot};
use super::lan::LanTransport;
use super::transport::{
    LogLevel, Transport, TransportContext, TransportEvent, TransportKind, TransportStatus,
};

// ─────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────

/// Runtime permission flow consulted before each transport starts
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn ensure(&self, transport: TransportKind) -> Result<()>;
}

/// Grants everything; desktop platforms have no runtime prompts
pub struct GrantAll;

#[async_trait]
impl PermissionBroker for GrantAll {
    async fn ensure(&self, _transport: TransportKind) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Observer Events
// ─────────────────────────────────────────────────────────────────

/// Aggregated view across all transports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub advertising: bool,
    pub discovering: bool,
    pub transports: Vec<TransportStatus>,
}

impl StatusSnapshot {
    /// Connected peers on one transport
    pub fn connected(&self, kind: TransportKind) -> usize {
        self.transports
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.connected)
            .sum()
    }

    /// Connections across all transports
    pub fn connected_total(&self) -> usize {
        self.transports.iter().map(|t| t.connected).sum()
    }

    pub fn discovered_total(&self) -> usize {
        self.transports.iter().map(|t| t.discovered).sum()
    }
}

/// One chat line for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub id: Option<String>,
    pub from: String,
    pub name: Option<String>,
    pub message: String,
    pub timestamp: i64,

    /// None for lines this node sent
    pub transport: Option<TransportKind>,
}

/// Events published to observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(StatusSnapshot),
    Log {
        transport: Option<TransportKind>,
        level: LogLevel,
        message: String,
    },
    Chat(ChatLine),
    Document(DocumentSnapshot),
    PeerConnected {
        transport: TransportKind,
        peer: PeerIdentity,
    },
    PeerDisconnected {
        transport: TransportKind,
        peer_id: String,
    },
}

// ─────────────────────────────────────────────────────────────────
// Active Session State
// ─────────────────────────────────────────────────────────────────

/// State that exists only between start and stop
struct ActiveSession {
    identity: PeerIdentity,
    dedup: MessageDeduplicator,
    document: DocumentReplica,
    debouncer: Debouncer,
    transports: Vec<Arc<dyn Transport>>,
    all_transports: Vec<Arc<dyn Transport>>,
    observers: broadcast::Sender<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveSession {
    fn publish(&self, event: SessionEvent) {
        let _ = self.observers.send(event);
    }

    fn publish_status(&self) {
        self.publish(SessionEvent::Status(status_of(&self.all_transports, true)));
    }

    fn log(&self, transport: Option<TransportKind>, level: LogLevel, message: impl Into<String>) {
        self.publish(SessionEvent::Log {
            transport,
            level,
            message: message.into(),
        });
    }

    /// Queue a line on every running transport
    fn fan_out(&self, line: &str) -> usize {
        self.transports.iter().map(|t| t.broadcast(line)).sum()
    }

    fn transport(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Note envelope for the current replica state with a fresh, remembered id
    fn note_envelope(&self, snapshot: &DocumentSnapshot) -> Result<String> {
        let id = self.dedup.next_id();
        self.dedup.remember(&id);
        let envelope = Envelope::NoteUpdate(NoteUpdate {
            id: Some(id),
            note: snapshot.text.clone(),
            timestamp: snapshot.timestamp,
            from: Some(self.identity.id.clone()),
        });
        Ok(envelope.encode()?)
    }

    /// Debounced broadcast of the latest local document state
    fn broadcast_document(&self) {
        let snapshot = self.document.snapshot();
        match self.note_envelope(&snapshot) {
            Ok(line) => {
                let sent = self.fan_out(&line);
                debug!(timestamp = snapshot.timestamp, peers = sent, "Broadcast note update");
            }
            Err(e) => warn!(error = %e, "Failed to encode note update"),
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { transport, state } => {
                debug!(transport = %transport, state = %state, "Transport state changed");
                self.publish_status();
            }
            TransportEvent::PeerConnected {
                transport, peer, ..
            } => {
                self.log(
                    Some(transport),
                    LogLevel::Info,
                    format!("connected to {}", peer),
                );
                self.send_catch_up(transport, &peer.id);
                self.publish(SessionEvent::PeerConnected { transport, peer });
                self.publish_status();
            }
            TransportEvent::PeerDisconnected {
                transport,
                peer_id,
                reason,
            } => {
                self.log(
                    Some(transport),
                    LogLevel::Info,
                    format!("disconnected from {} ({})", peer_id, reason),
                );
                self.publish(SessionEvent::PeerDisconnected { transport, peer_id });
                self.publish_status();
            }
            TransportEvent::Line {
                transport,
                from,
                line,
            } => self.handle_line(transport, from, line),
            TransportEvent::DiscoveryChanged { .. } => self.publish_status(),
            TransportEvent::Log {
                transport,
                level,
                message,
            } => self.log(Some(transport), level, message),
        }
    }

    /// Unicast the current document to a peer that just connected
    fn send_catch_up(&self, kind: TransportKind, peer_id: &str) {
        let snapshot = self.document.snapshot();
        if snapshot.timestamp <= 0 {
            return;
        }
        let Some(transport) = self.transport(kind) else {
            return;
        };

        let result = self
            .note_envelope(&snapshot)
            .and_then(|line| transport.send_to(peer_id, &line));
        match result {
            Ok(()) => debug!(peer = %peer_id, transport = %kind, "Sent document catch-up"),
            Err(e) => warn!(peer = %peer_id, error = %e, "Document catch-up failed"),
        }
    }

    fn handle_line(&self, transport: TransportKind, from: String, line: String) {
        let envelope = match Envelope::parse(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Degrade to opaque chat rather than dropping
                debug!(transport = %transport, from = %from, error = %e, "Malformed line");
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|value| value.get("id")?.as_str().map(str::to_string));
                if let Some(id) = id.as_deref() {
                    if !self.dedup.remember(id) {
                        trace!(id = %id, transport = %transport, "Duplicate dropped");
                        return;
                    }
                }
                self.publish(SessionEvent::Chat(ChatLine {
                    id,
                    from,
                    name: None,
                    message: line,
                    timestamp: Self::now_ms(),
                    transport: Some(transport),
                }));
                return;
            }
        };

        if let Some(id) = envelope.dedup_key() {
            if !self.dedup.remember(id) {
                trace!(id = %id, transport = %transport, "Duplicate dropped");
                return;
            }
        }

        match envelope {
            Envelope::Chat(chat) => {
                self.publish(SessionEvent::Chat(ChatLine {
                    id: chat.id,
                    from: chat.from.unwrap_or(from),
                    name: chat.name,
                    message: chat.message,
                    timestamp: chat.timestamp,
                    transport: Some(transport),
                }));
            }
            Envelope::NoteUpdate(update) => {
                if self.document.apply_remote_update(update.timestamp, &update.note) {
                    // A pending local broadcast is now stale
                    self.debouncer.cancel();
                    self.publish(SessionEvent::Document(self.document.snapshot()));
                } else {
                    trace!(timestamp = update.timestamp, "Stale note update ignored");
                }
            }
            other => debug!(kind = other.type_name(), "Ignoring control envelope"),
        }
    }
}

async fn pump(session: Arc<ActiveSession>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        session.handle_transport_event(event);
    }
    debug!("Transport event stream closed");
}

fn status_of(transports: &[Arc<dyn Transport>], running: bool) -> StatusSnapshot {
    let transports: Vec<TransportStatus> = transports.iter().map(|t| t.status()).collect();
    StatusSnapshot {
        running,
        advertising: transports.iter().any(|t| t.advertising),
        discovering: transports.iter().any(|t| t.discovering),
        transports,
    }
}

// ─────────────────────────────────────────────────────────────────
// Session Coordinator
// ─────────────────────────────────────────────────────────────────

/// Runs one mesh session across every configured transport
pub struct SessionCoordinator {
    settings: SessionSettings,
    fixed_id: Option<String>,
    transports: Vec<Arc<dyn Transport>>,
    permissions: Arc<dyn PermissionBroker>,
    observers: broadcast::Sender<SessionEvent>,
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<Arc<ActiveSession>>>,
}

impl SessionCoordinator {
    pub fn new(settings: SessionSettings, transports: Vec<Arc<dyn Transport>>) -> Self {
        let (observers, _) = broadcast::channel(settings.event_buffer.max(16));
        Self {
            settings,
            fixed_id: None,
            transports,
            permissions: Arc::new(GrantAll),
            observers,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// Coordinator with the transports enabled in `config`
    pub fn from_config(config: &MeshConfig) -> Self {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if config.lan.enabled {
            transports.push(Arc::new(LanTransport::new(config.lan.clone())));
        }
        if config.direct.enabled {
            let service = Arc::new(FixedGroupService::from_settings(&config.direct));
            transports.push(Arc::new(DirectTransport::new(config.direct.clone(), service)));
        }
        if config.cluster.enabled {
            transports.push(Arc::new(ClusterTransport::new(
                config.cluster.clone(),
                Arc::new(NoProximitySdk),
            )));
        }

        Self::new(config.session.clone(), transports).with_fixed_id(config.node.id.clone())
    }

    /// Use a fixed identity instead of generating one per start
    pub fn with_fixed_id(mut self, id: Option<String>) -> Self {
        self.fixed_id = id;
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionBroker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.observers.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Identity of the running session
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.active.lock().as_ref().map(|s| s.identity.clone())
    }

    fn session(&self) -> Result<Arc<ActiveSession>> {
        self.active
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::SessionNotRunning)
    }

    /// Start every transport; succeeds if at least one comes up.
    ///
    /// Calling start on a running session returns the current identity.
    pub async fn start(&self, name: &str, host_preferred: bool) -> Result<PeerIdentity> {
        let _guard = self.lifecycle.lock().await;
        if let Some(identity) = self.identity() {
            return Ok(identity);
        }

        let identity = match &self.fixed_id {
            Some(id) => PeerIdentity::new(id.clone(), name),
            None => PeerIdentity::generate(name),
        };
        info!(id = %identity.id, name = %identity.name, host_preferred, "Starting session");

        let (events_tx, events_rx) = mpsc::channel(self.settings.event_buffer.max(16));
        let ctx = TransportContext {
            identity: identity.clone(),
            host_preferred,
            events: events_tx,
        };

        let mut started: Vec<Arc<dyn Transport>> = Vec::new();
        let mut failures = Vec::new();
        for transport in &self.transports {
            let kind = transport.kind();
            let result = match self.permissions.ensure(kind).await {
                Ok(()) => transport.start(ctx.clone()).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!(transport = %kind, "Transport started");
                    started.push(Arc::clone(transport));
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Transport did not start");
                    self.publish_log(Some(kind), LogLevel::Warn, e.to_string());
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }
        drop(ctx);

        if started.is_empty() {
            for transport in &self.transports {
                transport.stop().await;
            }
            return Err(Error::AllTransportsFailed { failures });
        }

        let session = Arc::new(ActiveSession {
            identity: identity.clone(),
            dedup: MessageDeduplicator::new(identity.id.clone(), self.settings.dedup_window),
            document: DocumentReplica::new(),
            debouncer: Debouncer::new(self.settings.note_debounce()),
            transports: started,
            all_transports: self.transports.clone(),
            observers: self.observers.clone(),
            pump: Mutex::new(None),
        });
        let task = tokio::spawn(pump(Arc::clone(&session), events_rx));
        *session.pump.lock() = Some(task);
        *self.active.lock() = Some(Arc::clone(&session));

        session.log(None, LogLevel::Info, format!("session started as {}", identity));
        session.publish_status();
        Ok(identity)
    }

    /// Stop every transport and drop all session state. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let session = self.active.lock().take();
        let Some(session) = session else {
            return;
        };

        let pump = session.pump.lock().take();
        if let Some(task) = pump {
            task.abort();
        }
        session.debouncer.cancel();
        for transport in &session.transports {
            transport.stop().await;
        }

        info!(id = %session.identity.id, "Session stopped");
        self.publish_log(None, LogLevel::Info, "session stopped".to_string());
        let _ = self
            .observers
            .send(SessionEvent::Status(status_of(&self.transports, false)));
    }

    /// Send a chat line to every connected peer; returns its message id
    pub fn send_chat(&self, text: &str) -> Result<String> {
        let session = self.session()?;
        let id = session.dedup.next_id();
        session.dedup.remember(&id);

        let timestamp = ActiveSession::now_ms();
        let envelope = Envelope::Chat(ChatMessage {
            id: Some(id.clone()),
            message: text.to_string(),
            from: Some(session.identity.id.clone()),
            name: Some(session.identity.name.clone()),
            timestamp,
        });
        let sent = session.fan_out(&envelope.encode()?);
        debug!(id = %id, peers = sent, "Chat sent");

        session.publish(SessionEvent::Chat(ChatLine {
            id: Some(id.clone()),
            from: session.identity.id.clone(),
            name: Some(session.identity.name.clone()),
            message: text.to_string(),
            timestamp,
            transport: None,
        }));
        Ok(id)
    }

    /// Fan an already encoded envelope out to every transport.
    ///
    /// Its id, if any, is remembered so echoes are dropped.
    pub fn broadcast(&self, line: &str) -> Result<usize> {
        let session = self.session()?;
        if let Ok(envelope) = Envelope::parse(line) {
            if let Some(id) = envelope.dedup_key() {
                session.dedup.remember(id);
            }
        }
        Ok(session.fan_out(line))
    }

    /// Apply a local edit and schedule its debounced broadcast.
    ///
    /// Returns false when the text did not change.
    pub fn edit_document(&self, text: &str) -> Result<bool> {
        let session = self.session()?;
        let Some(snapshot) = session.document.apply_local_edit(text) else {
            return Ok(false);
        };
        session.publish(SessionEvent::Document(snapshot));

        let weak: Weak<ActiveSession> = Arc::downgrade(&session);
        session.debouncer.schedule(move || async move {
            if let Some(session) = weak.upgrade() {
                session.broadcast_document();
            }
        });
        Ok(true)
    }

    /// Current document; empty when no session runs
    pub fn document(&self) -> DocumentSnapshot {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.document.snapshot())
            .unwrap_or_default()
    }

    pub fn status(&self) -> StatusSnapshot {
        status_of(&self.transports, self.is_running())
    }

    fn publish_log(&self, transport: Option<TransportKind>, level: LogLevel, message: String) {
        let _ = self.observers.send(SessionEvent::Log {
            transport,
            level,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// In-memory transport that records sends and lets tests inject events
    struct FakeTransport {
        kind: TransportKind,
        fail: bool,
        ctx: Mutex<Option<TransportContext>>,
        broadcasts: Mutex<Vec<String>>,
        unicasts: Mutex<Vec<(String, String)>>,
        stops: AtomicUsize,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                ctx: Mutex::new(None),
                broadcasts: Mutex::new(Vec::new()),
                unicasts: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
            })
        }

        async fn inject(&self, event: TransportEvent) {
            let tx = self.ctx.lock().as_ref().unwrap().events.clone();
            tx.send(event).await.unwrap();
        }

        async fn line(&self, from: &str, line: &str) {
            self.inject(TransportEvent::Line {
                transport: self.kind,
                from: from.to_string(),
                line: line.to_string(),
            })
            .await;
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn start(&self, ctx: TransportContext) -> Result<()> {
            if self.fail {
                return Err(Error::unavailable(self.kind, "not on this device"));
            }
            *self.ctx.lock() = Some(ctx);
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.ctx.lock().take();
        }

        fn broadcast(&self, line: &str) -> usize {
            self.broadcasts.lock().push(line.to_string());
            1
        }

        fn send_to(&self, peer_id: &str, line: &str) -> Result<()> {
            self.unicasts
                .lock()
                .push((peer_id.to_string(), line.to_string()));
            Ok(())
        }

        fn status(&self) -> TransportStatus {
            let running = self.ctx.lock().is_some();
            TransportStatus {
                running,
                state: if running { "running" } else { "stopped" }.to_string(),
                ..TransportStatus::stopped(self.kind)
            }
        }
    }

    fn coordinator(transports: Vec<Arc<FakeTransport>>) -> SessionCoordinator {
        let transports = transports
            .into_iter()
            .map(|t| t as Arc<dyn Transport>)
            .collect();
        SessionCoordinator::new(SessionSettings::default(), transports)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn chats(events: &[SessionEvent]) -> Vec<ChatLine> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Chat(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_transports_failing_rolls_back() {
        let lan = FakeTransport::new(TransportKind::Lan, true);
        let direct = FakeTransport::new(TransportKind::Direct, true);
        let session = coordinator(vec![lan.clone(), direct.clone()]);

        let err = assert_err!(session.start("me", false).await);
        match err {
            Error::AllTransportsFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!session.is_running());
        assert_eq!(lan.stops.load(Ordering::SeqCst), 1);
        assert_eq!(direct.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let direct = FakeTransport::new(TransportKind::Direct, true);
        let session = coordinator(vec![lan.clone(), direct]);

        let identity = assert_ok!(session.start("me", false).await);
        assert_eq!(identity.name, "me");
        assert!(session.status().running);
        assert!(session.status().transports[0].running);

        // Starting again keeps the same identity
        let again = assert_ok!(session.start("other", true).await);
        assert_eq!(again, identity);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_permission_denied_skips_transport() {
        struct DenyLan;
        #[async_trait]
        impl PermissionBroker for DenyLan {
            async fn ensure(&self, transport: TransportKind) -> Result<()> {
                match transport {
                    TransportKind::Lan => Err(Error::PermissionDenied { transport }),
                    _ => Ok(()),
                }
            }
        }

        let lan = FakeTransport::new(TransportKind::Lan, false);
        let cluster = FakeTransport::new(TransportKind::Cluster, false);
        let session = coordinator(vec![lan.clone(), cluster.clone()])
            .with_permissions(Arc::new(DenyLan));

        assert_ok!(session.start("me", false).await);
        assert!(lan.ctx.lock().is_none());
        assert!(cluster.ctx.lock().is_some());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_chat_delivered_once() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let direct = FakeTransport::new(TransportKind::Direct, false);
        let session = coordinator(vec![lan.clone(), direct.clone()]);
        let mut rx = session.subscribe();
        session.start("me", false).await.unwrap();

        let line = r#"{"type":"chat","id":"A-1000-0","message":"hi","from":"A","name":"Ann","timestamp":1000}"#;
        lan.line("A", line).await;
        direct.line("owner", line).await;
        lan.line("A", line).await;
        settle().await;

        let received = chats(&drain(&mut rx));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, "A");
        assert_eq!(received[0].message, "hi");
        assert_eq!(received[0].transport, Some(TransportKind::Lan));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_line_shown_as_chat() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        let mut rx = session.subscribe();
        session.start("me", false).await.unwrap();

        lan.line("peer", "not json at all").await;
        settle().await;

        let received = chats(&drain(&mut rx));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, "not json at all");
        assert_eq!(received[0].from, "peer");
        assert!(received[0].id.is_none());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_chat_without_message_is_deduplicated() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let direct = FakeTransport::new(TransportKind::Direct, false);
        let session = coordinator(vec![lan.clone(), direct.clone()]);
        let mut rx = session.subscribe();
        session.start("me", false).await.unwrap();

        let line = r#"{"type":"chat","id":"A-1000-7","from":"A","timestamp":1000}"#;
        lan.line("A", line).await;
        direct.line("owner", line).await;
        settle().await;

        let received = chats(&drain(&mut rx));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id.as_deref(), Some("A-1000-7"));
        assert_eq!(received[0].message, "");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_unparsable_line_with_id_is_deduplicated() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let direct = FakeTransport::new(TransportKind::Direct, false);
        let session = coordinator(vec![lan.clone(), direct.clone()]);
        let mut rx = session.subscribe();
        session.start("me", false).await.unwrap();

        // Unknown type still carries a mesh id
        let line = r#"{"type":"reaction","id":"A-1000-8","emoji":"+1"}"#;
        lan.line("A", line).await;
        direct.line("owner", line).await;
        lan.line("A", line).await;
        settle().await;

        let received = chats(&drain(&mut rx));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id.as_deref(), Some("A-1000-8"));
        assert_eq!(received[0].message, line);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_own_chat_echo_is_dropped() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        let mut rx = session.subscribe();
        session.start("me", false).await.unwrap();

        let id = session.send_chat("hello").unwrap();
        let sent = lan.broadcasts.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(&id));

        lan.line("relay", &sent[0]).await;
        settle().await;

        let received = chats(&drain(&mut rx));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].transport, None);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_remote_note_updates_are_last_writer_wins() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        session.start("me", false).await.unwrap();

        lan.line("p", r#"{"type":"note_update","id":"p-1","note":"new","timestamp":200}"#)
            .await;
        lan.line("p", r#"{"type":"note_update","id":"p-2","note":"old","timestamp":100}"#)
            .await;
        settle().await;

        let doc = session.document();
        assert_eq!(doc.text, "new");
        assert_eq!(doc.timestamp, 200);

        // Refreshing the view with the remote text is not a local edit
        assert!(!session.edit_document("new").unwrap());
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_are_debounced_into_one_broadcast() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        session.start("me", false).await.unwrap();

        for text in ["h", "he", "hel", "hello"] {
            assert!(session.edit_document(text).unwrap());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(lan.broadcasts.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = lan.broadcasts.lock().clone();
        assert_eq!(sent.len(), 1);
        match Envelope::parse(&sent[0]).unwrap() {
            Envelope::NoteUpdate(update) => {
                assert_eq!(update.note, "hello");
                assert_eq!(update.timestamp, session.document().timestamp);
            }
            other => panic!("expected note update, got {}", other.type_name()),
        }
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_peer_gets_single_catch_up_unicast() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        session.start("me", false).await.unwrap();

        session.edit_document("shared text").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(lan.broadcasts.lock().len(), 1);

        lan.inject(TransportEvent::PeerConnected {
            transport: TransportKind::Lan,
            peer: PeerIdentity::new("late", "Late"),
            direction: crate::mesh::Direction::Inbound,
        })
        .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let unicasts = lan.unicasts.lock().clone();
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].0, "late");
        match Envelope::parse(&unicasts[0].1).unwrap() {
            Envelope::NoteUpdate(update) => {
                assert_eq!(update.note, "shared text");
                assert_eq!(update.timestamp, session.document().timestamp);
            }
            other => panic!("expected note update, got {}", other.type_name()),
        }
        assert_eq!(lan.broadcasts.lock().len(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_no_catch_up_for_empty_document() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        session.start("me", false).await.unwrap();

        lan.inject(TransportEvent::PeerConnected {
            transport: TransportKind::Lan,
            peer: PeerIdentity::new("p", "P"),
            direction: crate::mesh::Direction::Outbound,
        })
        .await;
        settle().await;

        assert!(lan.unicasts.lock().is_empty());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_resets() {
        let lan = FakeTransport::new(TransportKind::Lan, false);
        let session = coordinator(vec![lan.clone()]);
        session.start("me", false).await.unwrap();
        session.edit_document("draft").unwrap();

        session.stop().await;
        session.stop().await;

        assert!(!session.is_running());
        assert!(session.document().is_empty());
        assert_eq!(lan.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(session.send_chat("x"), Err(Error::SessionNotRunning)));
        assert!(matches!(session.edit_document("x"), Err(Error::SessionNotRunning)));
    }
}
