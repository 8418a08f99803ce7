use crate::member::Member;
use crate::presence::RoomSettings;
use crate::RacePhase;
use serde::{Deserialize, Serialize};

/// One racer's row in a ranked result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// 1-based finishing position.
    pub position: u32,
    pub id: String,
    pub name: String,
    pub wpm: f32,
    pub accuracy: f32,
    /// Elapsed time in seconds.
    pub time: f64,
}

/// A chat line, deduplicated by `id` so the sender's own echo is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    #[serde(default)]
    pub sent_at_ms: u64,
}

/// Full room snapshot the host sends to a (re)joining peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedRaceState {
    pub phase: RacePhase,
    pub paragraph: String,
    pub paragraph_index: u32,
    #[serde(default)]
    pub countdown_end_ms: Option<u64>,
    #[serde(default)]
    pub race_start_ms: Option<u64>,
    pub settings: RoomSettings,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub results: Vec<RankedResult>,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// Broadcast events carried on the room channel.
///
/// Delivery is at-least-once and ordered per sender, and the channel echoes
/// a peer's own broadcasts back to it, so every handler must be idempotent.
/// Unknown or malformed payloads fail to decode and are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaceEvent {
    /// Host-to-joiner snapshot; ignored by everyone but `target`.
    StateSync {
        target: String,
        state: SyncedRaceState,
    },
    ReadyUpdate {
        id: String,
        ready: bool,
    },
    NameUpdate {
        id: String,
        name: String,
    },
    SettingsUpdate {
        settings: RoomSettings,
    },
    LobbyNameUpdate {
        name: String,
    },
    /// Race is starting: absolute end-of-countdown timestamp plus the
    /// paragraph so peers joining mid-broadcast see the same text.
    Countdown {
        end_ms: u64,
        paragraph: String,
        paragraph_index: u32,
    },
    /// Countdown elapsed; all peers compute elapsed time from `start_ms`.
    RaceStart {
        start_ms: u64,
    },
    Progress {
        id: String,
        progress: f32,
        wpm: f32,
        accuracy: f32,
        cursor: u32,
    },
    Finish {
        id: String,
        wpm: f32,
        accuracy: f32,
        time: f64,
        #[serde(default)]
        word_speeds: Vec<f32>,
        #[serde(default)]
        keylog: String,
    },
    /// Authoritative final standings from the host.
    RaceFinished {
        results: Vec<RankedResult>,
    },
    /// Rematch: fresh paragraph, telemetry reset. Carries the absolute
    /// round number so duplicate delivery cannot double-increment.
    NewRound {
        round: u32,
        paragraph: String,
        paragraph_index: u32,
    },
    Chat(ChatMessage),
    /// Point-to-point request to view `target`'s historical stats.
    StatsRequest {
        from: String,
        target: String,
    },
    StatsResponse {
        target: String,
        from: String,
        #[serde(default)]
        payload: String,
    },
    HostReclaimed {
        host_id: String,
    },
    HostTransferred {
        old_host_id: String,
        new_host_id: String,
    },
}

impl RaceEvent {
    /// Serializes the event for the wire.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decodes a wire payload; `None` for anything malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}
