//! Direct-link transport
//!
//! A platform group service decides who owns the group. The owner listens
//! and relays every application line to all other members, making it the
//! hub of a star; clients dial the owner and consume lines locally. Framing
//! and handshake match the LAN transport, with `hello` in place of
//! `lan_hello`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DirectSettings;
use crate::error::{Error, Result};
use crate::protocol::HelloKind;

use super::link::{LinkInfo, LinkTable};
use super::transport::{
    Direction, LogLevel, Transport, TransportContext, TransportEvent, TransportKind,
    TransportStatus,
};

// ─────────────────────────────────────────────────────────────────
// Group Service
// ─────────────────────────────────────────────────────────────────

/// Role assigned by group formation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    /// Hub: accepts members and relays between them
    Owner,
    /// Leaf: dials the owner
    Client,
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::Owner => write!(f, "owner"),
            GroupRole::Client => write!(f, "client"),
        }
    }
}

/// Notifications from the platform group service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// Group is up; `owner_addr` is "host" or "host:port"
    Formed {
        role: GroupRole,
        owner_addr: Option<String>,
    },

    /// Membership changed; clients without a link dial again
    MembersChanged,

    /// Group went away
    Dissolved,

    /// Formation failed
    Failed { reason: String },
}

/// Platform service that forms direct wireless groups.
///
/// The reported role is final for the group; the transport never
/// renegotiates it.
#[async_trait]
pub trait GroupService: Send + Sync {
    /// Form or join a group; events arrive on the returned channel
    async fn form_group(&self, host_preferred: bool) -> Result<mpsc::Receiver<GroupEvent>>;

    /// Leave the group
    async fn dissolve(&self);
}

/// Group service driven by configuration, for ordinary IP networks.
///
/// Role `auto` becomes owner when the session prefers hosting.
pub struct FixedGroupService {
    role: String,
    owner_addr: Option<String>,
    events: Mutex<Option<mpsc::Sender<GroupEvent>>>,
}

impl FixedGroupService {
    pub fn new(role: impl Into<String>, owner_addr: Option<String>) -> Self {
        Self {
            role: role.into(),
            owner_addr,
            events: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &DirectSettings) -> Self {
        Self::new(settings.role.clone(), settings.owner_addr.clone())
    }

    /// Role this service will report
    pub fn resolve_role(&self, host_preferred: bool) -> GroupRole {
        match self.role.to_lowercase().as_str() {
            "owner" => GroupRole::Owner,
            "client" => GroupRole::Client,
            _ if host_preferred => GroupRole::Owner,
            _ => GroupRole::Client,
        }
    }

    /// Inject a membership change into a formed group
    pub fn notify_members_changed(&self) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.try_send(GroupEvent::MembersChanged);
        }
    }
}

#[async_trait]
impl GroupService for FixedGroupService {
    async fn form_group(&self, host_preferred: bool) -> Result<mpsc::Receiver<GroupEvent>> {
        let role = self.resolve_role(host_preferred);
        if role == GroupRole::Client && self.owner_addr.is_none() {
            return Err(Error::unavailable(
                TransportKind::Direct,
                "client role needs direct.owner_addr",
            ));
        }

        let (tx, rx) = mpsc::channel(16);
        let _ = tx.try_send(GroupEvent::Formed {
            role,
            owner_addr: self.owner_addr.clone(),
        });
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn dissolve(&self) {
        self.events.lock().take();
    }
}

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    Idle,
    Initializing,
    Forming,
    GroupFormed(GroupRole),
    TearingDown,
}

impl fmt::Display for DirectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectState::Idle => write!(f, "idle"),
            DirectState::Initializing => write!(f, "initializing"),
            DirectState::Forming => write!(f, "forming"),
            DirectState::GroupFormed(role) => write!(f, "group_formed({})", role),
            DirectState::TearingDown => write!(f, "tearing_down"),
        }
    }
}

struct DirectShared {
    settings: DirectSettings,
    ctx: TransportContext,
    links: Arc<LinkTable>,
    state: Arc<RwLock<DirectState>>,
    owner_addr: RwLock<Option<String>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    dial: Mutex<Option<JoinHandle<()>>>,
    dialing: AtomicBool,
}

struct DirectRuntime {
    shared: Arc<DirectShared>,
    group_task: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────
// Direct Transport
// ─────────────────────────────────────────────────────────────────

/// Owner/client star over a platform-formed group
pub struct DirectTransport {
    settings: DirectSettings,
    service: Arc<dyn GroupService>,
    state: Arc<RwLock<DirectState>>,
    runtime: Mutex<Option<DirectRuntime>>,
}

impl DirectTransport {
    pub fn new(settings: DirectSettings, service: Arc<dyn GroupService>) -> Self {
        Self {
            settings,
            service,
            state: Arc::new(RwLock::new(DirectState::Idle)),
            runtime: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DirectState {
        *self.state.read()
    }

    pub fn role(&self) -> Option<GroupRole> {
        match self.state() {
            DirectState::GroupFormed(role) => Some(role),
            _ => None,
        }
    }

    /// Owner listening address once the group formed
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.shared().and_then(|s| *s.listen_addr.read())
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.shared().map(|s| s.links.links()).unwrap_or_default()
    }

    fn shared(&self) -> Option<Arc<DirectShared>> {
        self.runtime
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.shared))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn start(&self, ctx: TransportContext) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != DirectState::Idle {
                return Ok(());
            }
            *state = DirectState::Initializing;
        }
        set_state(&self.state, &ctx, DirectState::Initializing);
        set_state(&self.state, &ctx, DirectState::Forming);

        let mut group_events = match self.service.form_group(ctx.host_preferred).await {
            Ok(rx) => rx,
            Err(e) => {
                set_state(&self.state, &ctx, DirectState::Idle);
                return Err(e);
            }
        };

        let links = LinkTable::new(
            TransportKind::Direct,
            HelloKind::Direct,
            ctx.identity.clone(),
            ctx.events.clone(),
        );
        let shared = Arc::new(DirectShared {
            settings: self.settings.clone(),
            ctx: ctx.clone(),
            links,
            state: Arc::clone(&self.state),
            owner_addr: RwLock::new(None),
            listen_addr: RwLock::new(None),
            listener: Mutex::new(None),
            dial: Mutex::new(None),
            dialing: AtomicBool::new(false),
        });

        // Formation the service already reported must succeed before start does
        while let Ok(event) = group_events.try_recv() {
            if let Err(e) = handle_group_event(&shared, event).await {
                error!(error = %e, "Direct-link group setup failed");
                shared.teardown_group().await;
                self.service.dissolve().await;
                set_state(&self.state, &ctx, DirectState::Idle);
                return Err(e);
            }
        }

        let group_task = tokio::spawn(group_loop(Arc::clone(&shared), group_events));
        *self.runtime.lock() = Some(DirectRuntime { shared, group_task });

        info!(host_preferred = ctx.host_preferred, "Direct-link transport started");
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };
        let ctx = runtime.shared.ctx.clone();
        set_state(&self.state, &ctx, DirectState::TearingDown);

        runtime.group_task.abort();
        let _ = runtime.group_task.await;
        runtime.shared.teardown_group().await;
        self.service.dissolve().await;

        set_state(&self.state, &ctx, DirectState::Idle);
        info!("Direct-link transport stopped");
    }

    fn broadcast(&self, line: &str) -> usize {
        self.shared().map(|s| s.links.broadcast(line)).unwrap_or(0)
    }

    fn send_to(&self, peer_id: &str, line: &str) -> Result<()> {
        match self.shared() {
            Some(shared) => shared.links.send_to(peer_id, line),
            None => Err(Error::PeerNotConnected {
                peer: peer_id.to_string(),
                transport: TransportKind::Direct,
            }),
        }
    }

    fn status(&self) -> TransportStatus {
        let state = self.state();
        let connected = self
            .shared()
            .map(|s| s.links.connected_count())
            .unwrap_or(0);

        TransportStatus {
            kind: TransportKind::Direct,
            state: state.to_string(),
            running: !matches!(state, DirectState::Idle | DirectState::TearingDown),
            advertising: state == DirectState::GroupFormed(GroupRole::Owner),
            discovering: state == DirectState::Forming,
            connected,
            discovered: connected,
        }
    }
}

fn set_state(state: &RwLock<DirectState>, ctx: &TransportContext, next: DirectState) {
    *state.write() = next;
    ctx.try_emit(TransportEvent::StateChanged {
        transport: TransportKind::Direct,
        state: next.to_string(),
    });
}

// ─────────────────────────────────────────────────────────────────
// Group Handling
// ─────────────────────────────────────────────────────────────────

async fn group_loop(shared: Arc<DirectShared>, mut events: mpsc::Receiver<GroupEvent>) {
    while let Some(event) = events.recv().await {
        if let Err(e) = handle_group_event(&shared, event).await {
            warn!(error = %e, "Group setup failed");
            shared
                .ctx
                .log(TransportKind::Direct, LogLevel::Warn, e.to_string())
                .await;
            shared.teardown_group().await;
            set_state(&shared.state, &shared.ctx, DirectState::Forming);
        }
    }
    debug!("Group event stream ended");
}

async fn handle_group_event(shared: &Arc<DirectShared>, event: GroupEvent) -> Result<()> {
    debug!(?event, "Group event");
    match event {
        GroupEvent::Formed { role, owner_addr } => shared.on_formed(role, owner_addr).await?,
        GroupEvent::MembersChanged => {
            let is_client = *shared.state.read() == DirectState::GroupFormed(GroupRole::Client);
            if is_client && shared.links.connected_count() == 0 {
                shared.start_dial();
            }
        }
        GroupEvent::Dissolved => {
            info!("Group dissolved");
            shared.teardown_group().await;
            set_state(&shared.state, &shared.ctx, DirectState::Forming);
            shared
                .ctx
                .log(TransportKind::Direct, LogLevel::Info, "group dissolved")
                .await;
        }
        GroupEvent::Failed { reason } => {
            warn!(reason = %reason, "Group formation failed");
            shared
                .ctx
                .log(
                    TransportKind::Direct,
                    LogLevel::Warn,
                    format!("group formation failed: {}", reason),
                )
                .await;
        }
    }
    Ok(())
}

impl DirectShared {
    /// Enter the formed state; an owner only gets there once it is listening
    async fn on_formed(self: &Arc<Self>, role: GroupRole, owner_addr: Option<String>) -> Result<()> {
        if matches!(*self.state.read(), DirectState::GroupFormed(_)) {
            debug!("Ignoring repeated group formation");
            return Ok(());
        }

        *self.owner_addr.write() = owner_addr;
        self.links.set_relay(role == GroupRole::Owner);
        if role == GroupRole::Owner {
            if let Err(e) = self.start_listener().await {
                self.links.set_relay(false);
                return Err(e);
            }
        }

        set_state(&self.state, &self.ctx, DirectState::GroupFormed(role));
        info!(role = %role, "Group formed");
        self.ctx
            .log(
                TransportKind::Direct,
                LogLevel::Info,
                format!("group formed as {}", role),
            )
            .await;

        if role == GroupRole::Client {
            self.start_dial();
        }
        Ok(())
    }

    async fn start_listener(self: &Arc<Self>) -> Result<()> {
        let bind = format!("0.0.0.0:{}", self.settings.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::unavailable(TransportKind::Direct, format!("bind {}: {}", bind, e)))?;

        let addr = listener.local_addr().ok();
        *self.listen_addr.write() = addr;
        info!(addr = ?addr, "Group owner listening");

        let links = Arc::clone(&self.links);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(addr = %peer_addr, "Group member connected");
                        links.attach(stream, Direction::Inbound, None);
                    }
                    Err(e) => {
                        error!(error = %e, "Owner accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Dial the owner once; no automatic retry
    fn start_dial(self: &Arc<Self>) {
        let Some(target) = self.owner_target() else {
            warn!("Group owner address unknown");
            return;
        };
        if self.dialing.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            shared.dial_owner(target).await;
            shared.dialing.store(false, Ordering::Release);
        });
        if let Some(previous) = self.dial.lock().replace(task) {
            previous.abort();
        }
    }

    /// Owner address with the group port filled in when absent
    fn owner_target(&self) -> Option<String> {
        let addr = self.owner_addr.read().clone()?;
        if addr.parse::<SocketAddr>().is_ok() {
            return Some(addr);
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, self.settings.port).to_string());
        }
        if addr.contains(':') {
            Some(addr)
        } else {
            Some(format!("{}:{}", addr, self.settings.port))
        }
    }

    async fn dial_owner(&self, target: String) {
        debug!(owner = %target, "Dialing group owner");
        let result = match tokio::time::timeout(
            self.settings.connect_timeout(),
            TcpStream::connect(target.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::connection_failed(target.clone(), e.to_string())),
            Err(_) => Err(Error::ConnectionTimeout {
                addr: target.clone(),
                timeout_ms: self.settings.connect_timeout_ms,
            }),
        };

        match result {
            Ok(stream) => {
                self.links.attach(stream, Direction::Outbound, None);
            }
            Err(e) => {
                warn!(owner = %target, error = %e, "Owner dial failed");
                self.ctx
                    .log(TransportKind::Direct, LogLevel::Warn, e.to_string())
                    .await;
            }
        }
    }

    /// Close the listener, any dial in flight and every connection
    async fn teardown_group(&self) {
        let listener = self.listener.lock().take();
        if let Some(task) = listener {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.dial.lock().take() {
            task.abort();
        }
        self.dialing.store(false, Ordering::Release);
        self.links.set_relay(false);
        self.links.close_all();
        *self.listen_addr.write() = None;
    }
}
