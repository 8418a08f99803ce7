//! Durable per-session key-value storage.
//!
//! Models the browser-session store the engine keeps its identity and
//! per-room flags in: the stable peer id, the "I was host for room X"
//! marker that drives host reclamation, and the cached join key that lets a
//! refreshed client resume as a racer. Injected as a trait so tests and the
//! demo driver can run entirely in memory.

use std::collections::HashMap;

/// Key under which the stable per-session peer id is stored.
pub const PEER_ID_KEY: &str = "peer_id";

/// Marker set when this peer is (or becomes) host of `room`; checked on
/// host-absence so the original host always reclaims without waiting.
pub fn host_marker_key(room: &str) -> String {
    format!("host:{room}")
}

/// Cache of the join key presented for `room`, so a refresh resumes the
/// racer role and a promoted host can keep handing out the original key.
pub fn join_key_cache_key(room: &str) -> String {
    format!("key:{room}")
}

/// String key-value store scoped to the browser session.
pub trait SessionStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn remove(&mut self, key: &str);

    /// Clears the per-room keys when the peer leaves `room`.
    fn clear_room(&mut self, room: &str) {
        self.remove(&host_marker_key(room));
        self.remove(&join_key_cache_key(room));
    }
}

/// In-memory store used by tests and the simulated peers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}
