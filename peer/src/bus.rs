//! In-process room channel.
//!
//! Implements the pub/sub contract the engine is written against: ordered
//! per-sender broadcast delivery with the sender's own messages echoed
//! back, plus a presence registry queried as full snapshots. Backed by a
//! shared mutex so simulated peers in one process (the demo binary and the
//! integration tests) exercise the real fan-out paths.

use protocol::PresenceRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

struct BusInner {
    /// Per-subscriber inbox of encoded broadcast payloads.
    inboxes: HashMap<String, VecDeque<Vec<u8>>>,
    presence: HashMap<String, PresenceRecord>,
    /// Snapshot ordering: ids in first-announcement order, so duplicate
    /// handling ("last entry wins") can be exercised deterministically.
    order: Vec<String>,
}

/// A shared in-memory room channel.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                inboxes: HashMap::new(),
                presence: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a subscriber and returns its handle.
    pub fn subscribe(&self, peer_id: &str) -> BusHandle {
        let mut inner = self.lock();
        inner.inboxes.entry(peer_id.to_string()).or_default();
        BusHandle {
            peer_id: peer_id.to_string(),
            bus: self.clone(),
        }
    }

    /// Simulates an abrupt disconnect: the peer's inbox and presence row
    /// vanish without any goodbye message.
    pub fn drop_peer(&self, peer_id: &str) {
        let mut inner = self.lock();
        inner.inboxes.remove(peer_id);
        inner.presence.remove(peer_id);
        inner.order.retain(|id| id != peer_id);
    }

    /// Full presence snapshot in announcement order.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.presence.get(id).cloned())
            .collect()
    }
}

/// One subscriber's view of the channel.
pub struct BusHandle {
    peer_id: String,
    bus: MemoryBus,
}

impl BusHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Publishes to every subscriber, the sender included.
    pub fn publish(&self, payload: Vec<u8>) {
        let mut inner = self.bus.lock();
        for inbox in inner.inboxes.values_mut() {
            inbox.push_back(payload.clone());
        }
    }

    /// Publishes or replaces this peer's presence row.
    pub fn set_presence(&self, record: PresenceRecord) {
        let mut inner = self.bus.lock();
        if !inner.presence.contains_key(&self.peer_id) {
            inner.order.push(self.peer_id.clone());
        }
        inner.presence.insert(self.peer_id.clone(), record);
    }

    /// Drains this peer's pending broadcast payloads, in arrival order.
    pub fn poll(&self) -> Vec<Vec<u8>> {
        let mut inner = self.bus.lock();
        match inner.inboxes.get_mut(&self.peer_id) {
            Some(inbox) => inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.bus.snapshot()
    }

    /// Graceful unsubscribe.
    pub fn leave(&self) {
        self.bus.drop_peer(&self.peer_id);
    }
}
