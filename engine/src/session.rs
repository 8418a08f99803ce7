//! Identity and session bootstrap.
//!
//! Derives the stable per-session peer id and the capability tokens the
//! rest of the engine relies on. The peer id is minted once and persisted
//! so a refreshed client resumes with the same identity; join keys are
//! minted by the host at room creation and never rotated.

use crate::store::{SessionStore, PEER_ID_KEY};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// How the local peer intends to enter a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinIntent {
    pub room_id: String,
    pub display_name: String,
    /// Capability token required to race; absence always means spectator.
    pub join_key: Option<String>,
    /// Explicit spectate link: never attempt to claim a racer slot.
    pub spectate: bool,
}

impl JoinIntent {
    pub fn racer(room_id: impl Into<String>, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: name.into(),
            join_key: Some(key.into()),
            spectate: false,
        }
    }

    pub fn spectator(room_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: name.into(),
            join_key: None,
            spectate: true,
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Loads the session's peer id, minting and persisting one on first use.
pub fn load_or_create_peer_id(store: &mut dyn SessionStore) -> String {
    if let Some(id) = store.get(PEER_ID_KEY) {
        return id;
    }
    let id = random_token(12);
    store.set(PEER_ID_KEY, &id);
    id
}

/// Mints a fresh room join key (host-side, at room creation).
pub fn mint_join_key() -> String {
    random_token(10)
}

/// Mints a chat message id used for echo deduplication.
pub fn mint_message_id() -> String {
    random_token(8)
}
