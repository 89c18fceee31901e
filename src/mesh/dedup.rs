//! Message deduplication
//!
//! Every envelope carrying an `id` passes through [`MessageDeduplicator`]
//! before it is acted on, so retransmissions, relay echoes and multi-path
//! deliveries are handled once.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Default number of ids remembered
pub const DEFAULT_WINDOW: usize = 300;

// ─────────────────────────────────────────────────────────────────
// Recent-Message Window
// ─────────────────────────────────────────────────────────────────

/// Insertion-ordered set of the most recent ids, oldest evicted first
#[derive(Debug)]
pub struct RecentWindow {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            members: HashSet::with_capacity(capacity + 1),
        }
    }

    /// Insert `id`; returns false if it is already present
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }

        self.members.insert(id.to_string());
        self.order.push_back(id.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }

        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────
// Deduplicator
// ─────────────────────────────────────────────────────────────────

/// Thread-safe deduplicator and message id source for one session
pub struct MessageDeduplicator {
    session_id: String,
    counter: AtomicU64,
    window: Mutex<RecentWindow>,
}

impl MessageDeduplicator {
    pub fn new(session_id: impl Into<String>, window: usize) -> Self {
        Self {
            session_id: session_id.into(),
            counter: AtomicU64::new(0),
            window: Mutex::new(RecentWindow::new(window)),
        }
    }

    /// Record `id`; true the first time it is seen.
    ///
    /// Test and insert happen under one lock, so two racing deliveries of
    /// the same id cannot both win.
    pub fn remember(&self, id: &str) -> bool {
        self.window.lock().insert(id)
    }

    /// Next unique id: `<session>-<unix ms>-<counter>`
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        generate_id(&self.session_id, chrono::Utc::now().timestamp_millis(), n)
    }
}

/// Combine session identity, a millisecond timestamp and a per-session counter
pub fn generate_id(session_id: &str, timestamp_ms: i64, counter: u64) -> String {
    format!("{}-{}-{}", session_id, timestamp_ms, counter)
}
