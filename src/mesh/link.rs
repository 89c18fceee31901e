//! Line-framed TCP connection table
//!
//! Shared by the local-network and direct-link transports. Every connection
//! gets a writer task fed by a channel and a reader task that performs the
//! hello handshake, resolves duplicate connections to the same peer, and
//! forwards application lines as [`TransportEvent::Line`].
//!
//! Closing a connection means aborting its tasks, which drops both socket
//! halves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{read_line, write_line, Envelope, Hello, HelloKind, PeerIdentity};

use super::transport::{Direction, LogLevel, TransportEvent, TransportKind};

/// A connection must complete the handshake within this window
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound lines queued per connection before sends start failing
const WRITE_QUEUE: usize = 256;

/// Table-local connection number
pub type ConnId = u64;

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

struct Link {
    /// Set once the hello arrives
    peer: Option<PeerIdentity>,

    direction: Direction,

    /// Peer this connection was dialed for, until the hello binds it
    dialed: Option<String>,

    write_tx: mpsc::Sender<String>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
    opened_at: Instant,
}

impl Link {
    fn close(self) {
        self.writer.abort();
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

#[derive(Default)]
struct LinkState {
    links: HashMap<ConnId, Link>,

    /// At most one bound connection per peer
    by_peer: HashMap<String, ConnId>,

    /// Dials in flight
    pending: HashSet<String>,
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub conn_id: ConnId,
    pub peer: Option<PeerIdentity>,
    pub direction: Direction,
    pub age: Duration,
}

enum Binding {
    New(Direction),
    Replaced(Direction),
    Duplicate,
    Gone,
}

// ─────────────────────────────────────────────────────────────────
// Link Table
// ─────────────────────────────────────────────────────────────────

/// All connections of one stream transport for one session
pub struct LinkTable {
    kind: TransportKind,
    hello: HelloKind,
    identity: PeerIdentity,
    events: mpsc::Sender<TransportEvent>,
    relay: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<LinkState>,
}

impl LinkTable {
    pub fn new(
        kind: TransportKind,
        hello: HelloKind,
        identity: PeerIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            hello,
            identity,
            events,
            relay: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            state: Mutex::new(LinkState::default()),
        })
    }

    /// Forward every inbound application line to all other connections
    pub fn set_relay(&self, enabled: bool) {
        self.relay.store(enabled, Ordering::Release);
    }

    pub fn is_relay(&self) -> bool {
        self.relay.load(Ordering::Acquire)
    }

    /// Claim the right to dial `peer_id`.
    ///
    /// False if the peer already has a live connection or a dial in flight.
    pub fn try_reserve_dial(&self, peer_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.by_peer.contains_key(peer_id) || state.pending.contains(peer_id) {
            return false;
        }
        state.pending.insert(peer_id.to_string())
    }

    /// Give back a reservation after a failed dial
    pub fn release_dial(&self, peer_id: &str) {
        self.state.lock().pending.remove(peer_id);
    }

    pub fn is_dialing(&self, peer_id: &str) -> bool {
        self.state.lock().pending.contains(peer_id)
    }

    /// Take ownership of a fresh socket and start its tasks.
    ///
    /// `dialed` names the peer an outbound dial was reserved for.
    pub fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
        dialed: Option<String>,
    ) -> ConnId {
        let _ = stream.set_nodelay(true);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel::<String>(WRITE_QUEUE);

        // Hello goes out before anything else on this socket
        match self.hello.envelope(&self.identity.id, &self.identity.name).encode() {
            Ok(line) => {
                let _ = write_tx.try_send(line);
            }
            Err(e) => warn!(transport = %self.kind, error = %e, "Failed to encode hello"),
        }

        let label = format!("{}#{}", self.kind, conn_id);
        let writer = tokio::spawn(write_loop(label, write_half, write_rx));

        self.state.lock().links.insert(
            conn_id,
            Link {
                peer: None,
                direction,
                dialed,
                write_tx,
                writer,
                reader: None,
                opened_at: Instant::now(),
            },
        );

        let table = Arc::clone(self);
        let reader = tokio::spawn(async move {
            table.read_loop(conn_id, read_half).await;
        });

        match self.state.lock().links.get_mut(&conn_id) {
            Some(link) => link.reader = Some(reader),
            None => reader.abort(),
        }

        debug!(transport = %self.kind, conn = conn_id, ?direction, "Connection attached");
        conn_id
    }

    /// Queue a line to one bound peer
    pub fn send_to(&self, peer_id: &str, line: &str) -> Result<()> {
        let state = self.state.lock();
        let link = state
            .by_peer
            .get(peer_id)
            .and_then(|id| state.links.get(id))
            .ok_or_else(|| Error::PeerNotConnected {
                peer: peer_id.to_string(),
                transport: self.kind,
            })?;

        link.write_tx
            .try_send(line.to_string())
            .map_err(|e| Error::ConnectionLost {
                peer: peer_id.to_string(),
                message: e.to_string(),
            })
    }

    /// Queue a line to every bound peer; returns how many accepted it
    pub fn broadcast(&self, line: &str) -> usize {
        self.send_filtered(line, None)
    }

    /// Queue a line to every bound peer except the connection it came from
    pub fn send_all_except(&self, conn_id: ConnId, line: &str) -> usize {
        self.send_filtered(line, Some(conn_id))
    }

    fn send_filtered(&self, line: &str, skip: Option<ConnId>) -> usize {
        let state = self.state.lock();
        let mut sent = 0;
        for (id, link) in state.links.iter() {
            if Some(*id) == skip || link.peer.is_none() {
                continue;
            }
            match link.write_tx.try_send(line.to_string()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(transport = %self.kind, conn = id, error = %e, "Dropped outbound line"),
            }
        }
        sent
    }

    /// Peers with a bound connection
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.state
            .lock()
            .links
            .values()
            .filter_map(|l| l.peer.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().by_peer.len()
    }

    /// All connections, bound or not
    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .state
            .lock()
            .links
            .iter()
            .map(|(id, l)| LinkInfo {
                conn_id: *id,
                peer: l.peer.clone(),
                direction: l.direction,
                age: l.opened_at.elapsed(),
            })
            .collect();
        links.sort_by_key(|l| l.conn_id);
        links
    }

    /// Close every connection and forget pending dials
    pub fn close_all(&self) {
        let links: Vec<Link> = {
            let mut state = self.state.lock();
            state.by_peer.clear();
            state.pending.clear();
            state.links.drain().map(|(_, l)| l).collect()
        };

        if !links.is_empty() {
            debug!(transport = %self.kind, count = links.len(), "Closing connections");
        }
        for link in links {
            link.close();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Connection Tasks
    // ─────────────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, conn_id: ConnId, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();

        let hello = match tokio::time::timeout(
            HELLO_TIMEOUT,
            self.await_hello(&mut reader, &mut buf),
        )
        .await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                debug!(transport = %self.kind, conn = conn_id, error = %e, "Handshake failed");
                self.detach(conn_id);
                return;
            }
            Err(_) => {
                warn!(transport = %self.kind, conn = conn_id, "Hello timeout, closing connection");
                self.detach(conn_id);
                return;
            }
        };

        if hello.id == self.identity.id {
            let err = Error::SelfConnection { id: hello.id };
            warn!(transport = %self.kind, conn = conn_id, "{}", err);
            self.log(LogLevel::Warn, err.to_string()).await;
            self.detach(conn_id);
            return;
        }

        let peer = PeerIdentity::new(hello.id, hello.name);
        match self.bind(conn_id, &peer) {
            Binding::New(direction) => {
                info!(transport = %self.kind, peer = %peer.id, name = %peer.name, ?direction, "Peer connected");
                let _ = self
                    .events
                    .send(TransportEvent::PeerConnected {
                        transport: self.kind,
                        peer: peer.clone(),
                        direction,
                    })
                    .await;
            }
            // The peer never went away, so the session is not told again
            Binding::Replaced(direction) => {
                debug!(transport = %self.kind, peer = %peer.id, ?direction, "Replaced older connection");
            }
            Binding::Duplicate => {
                debug!(transport = %self.kind, peer = %peer.id, conn = conn_id, "Closing duplicate connection");
                self.detach(conn_id);
                return;
            }
            Binding::Gone => return,
        }

        let reason = loop {
            match read_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if self.is_relay() {
                        self.send_all_except(conn_id, &line);
                    }
                    let event = TransportEvent::Line {
                        transport: self.kind,
                        from: peer.id.clone(),
                        line,
                    };
                    if self.events.send(event).await.is_err() {
                        break "session closed".to_string();
                    }
                }
                Ok(None) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            }
        };

        if let Some(peer_id) = self.detach(conn_id) {
            info!(transport = %self.kind, peer = %peer_id, reason = %reason, "Peer disconnected");
            let _ = self
                .events
                .send(TransportEvent::PeerDisconnected {
                    transport: self.kind,
                    peer_id,
                    reason,
                })
                .await;
        }
    }

    /// Wait for the first hello of our kind; earlier lines are dropped
    async fn await_hello(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        buf: &mut Vec<u8>,
    ) -> anyhow::Result<Hello> {
        loop {
            let line = read_line(reader, buf)
                .await?
                .ok_or_else(|| anyhow::anyhow!("closed before hello"))?;

            if let Ok(envelope) = Envelope::parse(&line) {
                if let Some(hello) = self.hello.matches(&envelope) {
                    return Ok(hello.clone());
                }
            }
            debug!(transport = %self.kind, "Discarding line received before hello");
        }
    }

    /// Attach a peer identity to a connection, resolving duplicates.
    ///
    /// Against a live connection in the other direction the one matching
    /// the tie-break wins; in the same direction the newer one wins.
    fn bind(&self, conn_id: ConnId, peer: &PeerIdentity) -> Binding {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pending.remove(&peer.id);

        // The dialed id may differ from the one the hello announced
        let direction = match state.links.get_mut(&conn_id) {
            Some(link) => {
                if let Some(dialed) = link.dialed.take() {
                    state.pending.remove(&dialed);
                }
                link.direction
            }
            None => return Binding::Gone,
        };

        let preferred = if self.identity.initiates_to(&peer.id) {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        let mut replaced = None;
        if let Some(&existing) = state.by_peer.get(&peer.id) {
            if existing != conn_id {
                let keep_new = match state.links.get(&existing).map(|l| l.direction) {
                    Some(existing_dir) if existing_dir != direction => direction == preferred,
                    _ => true,
                };
                if !keep_new {
                    return Binding::Duplicate;
                }
                replaced = state.links.remove(&existing);
            }
        }

        state.by_peer.insert(peer.id.clone(), conn_id);
        if let Some(link) = state.links.get_mut(&conn_id) {
            link.peer = Some(peer.clone());
        }
        drop(guard);

        match replaced {
            Some(old) => {
                old.close();
                Binding::Replaced(direction)
            }
            None => Binding::New(direction),
        }
    }

    /// Remove a connection from the reader's own task.
    ///
    /// Returns the peer id if this connection was the peer's bound one.
    fn detach(&self, conn_id: ConnId) -> Option<String> {
        let mut state = self.state.lock();
        let link = state.links.remove(&conn_id)?;

        if let Some(dialed) = &link.dialed {
            state.pending.remove(dialed);
        }

        let mut served = None;
        if let Some(peer) = &link.peer {
            if state.by_peer.get(&peer.id) == Some(&conn_id) {
                state.by_peer.remove(&peer.id);
                served = Some(peer.id.clone());
            }
        }
        drop(state);

        link.writer.abort();
        served
    }

    async fn log(&self, level: LogLevel, message: String) {
        let _ = self
            .events
            .send(TransportEvent::Log {
                transport: self.kind,
                level,
                message,
            })
            .await;
    }
}

impl Drop for LinkTable {
    fn drop(&mut self) {
        for (_, link) in self.state.get_mut().links.drain() {
            link.close();
        }
    }
}

/// Drain the channel onto the socket
async fn write_loop(label: String, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            debug!(conn = %label, error = %e, "Write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn table(id: &str) -> (Arc<LinkTable>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let identity = PeerIdentity::new(id, format!("node-{}", id));
        (LinkTable::new(TransportKind::Lan, HelloKind::Lan, identity, tx), rx)
    }

    /// Dial from `from` to `to` over loopback
    async fn dial(from: &Arc<LinkTable>, to: &Arc<LinkTable>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        from.attach(client.unwrap(), Direction::Outbound, Some(to.identity.id.clone()));
        to.attach(accepted.unwrap().0, Direction::Inbound, None);
    }

    /// Attach one end of a loopback pair to `table` and hand back the raw far end
    async fn raw_peer(table: &Arc<LinkTable>, direction: Direction, dialed: Option<&str>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (client, accepted) = (client.unwrap(), accepted.unwrap().0);
        match direction {
            Direction::Outbound => {
                table.attach(client, direction, dialed.map(str::to_string));
                accepted
            }
            Direction::Inbound => {
                table.attach(accepted, direction, dialed.map(str::to_string));
                client
            }
        }
    }

    async fn send_raw(stream: &mut TcpStream, line: &str) {
        use tokio::io::AsyncWriteExt;
        stream.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_line(rx: &mut mpsc::Receiver<TransportEvent>) -> (String, String) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let TransportEvent::Line { from, line, .. } = event {
                return (from, line);
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_binds_and_delivers() {
        let (a, _a_rx) = table("a");
        let (b, mut b_rx) = table("b");
        assert!(a.try_reserve_dial("b"));
        dial(&a, &b).await;

        wait_until(|| a.connected_count() == 1 && b.connected_count() == 1).await;
        assert!(!a.is_dialing("b"));
        assert_eq!(b.peers()[0].name, "node-a");

        a.send_to("b", r#"{"type":"chat","message":"hi"}"#).unwrap();
        let (from, line) = next_line(&mut b_rx).await;
        assert_eq!(from, "a");
        assert_eq!(line, r#"{"type":"chat","message":"hi"}"#);
    }

    #[tokio::test]
    async fn test_reservation_blocks_second_dial() {
        let (a, _rx) = table("a");
        assert!(a.try_reserve_dial("b"));
        assert!(!a.try_reserve_dial("b"));
        a.release_dial("b");
        assert!(a.try_reserve_dial("b"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (a, _rx) = table("a");
        let err = a.send_to("nobody", "x").unwrap_err();
        assert!(matches!(err, Error::PeerNotConnected { .. }));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (a, _a_rx) = table("same");
        let (b, _b_rx) = table("same");
        dial(&a, &b).await;

        wait_until(|| a.links().is_empty() && b.links().is_empty()).await;
        assert_eq!(a.connected_count(), 0);
        assert!(!a.is_dialing("same"));
    }

    #[tokio::test]
    async fn test_crossed_dials_keep_initiator_link() {
        let (a, _a_rx) = table("a");
        let (b, _b_rx) = table("b");

        dial(&a, &b).await;
        wait_until(|| a.connected_count() == 1 && b.connected_count() == 1).await;

        // The non-initiator races a second connection
        dial(&b, &a).await;
        wait_until(|| a.links().len() == 1 && b.links().len() == 1).await;

        assert_eq!(a.links()[0].direction, Direction::Outbound);
        assert_eq!(b.links()[0].direction, Direction::Inbound);
        assert_eq!(a.connected_count(), 1);
        assert_eq!(b.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_reports_nothing_bound() {
        let (a, _a_rx) = table("a");
        let (b, mut b_rx) = table("b");
        dial(&a, &b).await;
        wait_until(|| b.connected_count() == 1).await;

        a.close_all();
        assert!(a.links().is_empty());

        // The far side notices the closed socket
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let TransportEvent::PeerDisconnected { peer_id, .. } = event {
                assert_eq!(peer_id, "a");
                break;
            }
        }
        assert_eq!(b.connected_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_closed_after_hello_timeout() {
        let (a, _rx) = table("a");
        let _silent = raw_peer(&a, Direction::Inbound, None).await;
        assert_eq!(a.links().len(), 1);

        tokio::time::sleep(HELLO_TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(a.links().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        wait_until(|| a.links().is_empty()).await;
        assert_eq!(a.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_lines_before_hello_are_dropped() {
        let (a, mut rx) = table("a");
        let mut far = raw_peer(&a, Direction::Inbound, None).await;

        send_raw(&mut far, r#"{"type":"chat","id":"b-1-0","message":"early"}"#).await;
        // Wrong handshake kind for this table
        send_raw(&mut far, r#"{"type":"hello","id":"b","name":"B"}"#).await;
        send_raw(&mut far, r#"{"type":"lan_hello","id":"b","name":"B"}"#).await;
        send_raw(&mut far, r#"{"type":"chat","id":"b-1-1","message":"late"}"#).await;

        let (from, line) = next_line(&mut rx).await;
        assert_eq!(from, "b");
        assert_eq!(line, r#"{"type":"chat","id":"b-1-1","message":"late"}"#);
    }

    #[tokio::test]
    async fn test_unbound_dial_holds_reservation_until_hello() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (a, _rx) = table("a");
        assert!(a.try_reserve_dial("b"));
        let far = raw_peer(&a, Direction::Outbound, Some("b")).await;
        let (far_read, mut far_write) = far.into_split();
        let mut far_lines = BufReader::new(far_read).lines();

        // The far side withholds its hello while discovery keeps firing
        for _ in 0..5 {
            assert!(!a.try_reserve_dial("b"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.links().len(), 1);
        assert_eq!(a.connected_count(), 0);

        use tokio::io::AsyncWriteExt;
        far_write
            .write_all(b"{\"type\":\"lan_hello\",\"id\":\"b\",\"name\":\"B\"}\n")
            .await
            .unwrap();
        wait_until(|| a.connected_count() == 1).await;

        let chat = r#"{"type":"chat","id":"A-1000-0","message":"once"}"#;
        assert_eq!(a.broadcast(chat), 1);

        let mut received = Vec::new();
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_millis(300), far_lines.next_line()).await
        {
            received.push(line);
        }
        assert_eq!(received.len(), 2, "got {:?}", received);
        assert!(received[0].contains("lan_hello"));
        assert_eq!(received[1], chat);
        assert_eq!(a.links().len(), 1);
    }

    #[tokio::test]
    async fn test_replacing_link_does_not_reconnect_peer() {
        let (a, mut rx) = table("a");
        assert!(a.identity.initiates_to("b"));

        // The peer dials us first
        let mut inbound = raw_peer(&a, Direction::Inbound, None).await;
        send_raw(&mut inbound, r#"{"type":"lan_hello","id":"b","name":"B"}"#).await;
        wait_until(|| a.connected_count() == 1).await;

        // Our own dial lands afterwards and wins the tie-break
        assert!(a.try_reserve_dial("b"));
        let mut outbound = raw_peer(&a, Direction::Outbound, Some("b")).await;
        send_raw(&mut outbound, r#"{"type":"lan_hello","id":"b","name":"B"}"#).await;
        wait_until(|| {
            let links = a.links();
            links.len() == 1 && links[0].direction == Direction::Outbound
        })
        .await;
        assert!(!a.is_dialing("b"));

        let mut connected = 0;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            match event {
                TransportEvent::PeerConnected { peer, .. } => {
                    assert_eq!(peer.id, "b");
                    connected += 1;
                }
                TransportEvent::PeerDisconnected { peer_id, .. } => {
                    panic!("unexpected disconnect of {}", peer_id)
                }
                _ => {}
            }
        }
        assert_eq!(connected, 1);
        assert_eq!(a.connected_count(), 1);
        drop(inbound);
    }

    #[tokio::test]
    async fn test_hello_with_other_id_releases_dialed_reservation() {
        let (a, _rx) = table("a");
        assert!(a.try_reserve_dial("old-id"));
        let mut far = raw_peer(&a, Direction::Outbound, Some("old-id")).await;
        assert!(a.is_dialing("old-id"));

        send_raw(&mut far, r#"{"type":"lan_hello","id":"new-id","name":"Renamed"}"#).await;
        wait_until(|| a.connected_count() == 1).await;

        assert_eq!(a.peers()[0].id, "new-id");
        assert!(!a.is_dialing("old-id"));
        assert!(!a.is_dialing("new-id"));
        assert!(a.try_reserve_dial("old-id"));
    }
}
