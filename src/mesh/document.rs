//! Shared note replica
//!
//! A single last-writer-wins text value. Remote updates are applied only
//! when strictly newer; local edits are stamped and broadcast after a quiet
//! period so a burst of keystrokes becomes one network update.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Text plus the stamp of the write that produced it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub text: String,

    /// Milliseconds; 0 means never written
    pub timestamp: i64,
}

impl DocumentSnapshot {
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0
    }
}

/// Session-lifetime note replica
#[derive(Debug, Default)]
pub struct DocumentReplica {
    state: Mutex<DocumentSnapshot>,
}

impl DocumentReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.state.lock().clone()
    }

    /// Stamp a local edit with the current time.
    ///
    /// Returns `None` when the text is unchanged, which is how a view
    /// refreshing itself after a remote update avoids echoing it back.
    pub fn apply_local_edit(&self, text: &str) -> Option<DocumentSnapshot> {
        self.apply_local_edit_at(text, chrono::Utc::now().timestamp_millis())
    }

    /// Stamp a local edit at `now_ms`; the stamp never goes backwards
    pub fn apply_local_edit_at(&self, text: &str, now_ms: i64) -> Option<DocumentSnapshot> {
        let mut state = self.state.lock();
        if state.text == text && state.timestamp > 0 {
            return None;
        }

        state.timestamp = now_ms.max(state.timestamp + 1);
        state.text = text.to_string();
        Some(state.clone())
    }

    /// Merge a remote write; accepted only if strictly newer
    pub fn apply_remote_update(&self, timestamp: i64, note: &str) -> bool {
        let mut state = self.state.lock();
        if timestamp <= state.timestamp {
            return false;
        }

        state.timestamp = timestamp;
        state.text = note.to_string();
        true
    }
}

// ─────────────────────────────────────────────────────────────────
// Debounce
// ─────────────────────────────────────────────────────────────────

/// Cancel-and-reschedule one-shot timer
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Run `action` once `delay` has passed without another call
    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        });

        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    /// Drop a scheduled action without running it
    pub fn cancel(&self) {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
