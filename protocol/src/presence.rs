use crate::member::Member;
use crate::RacePhase;
use serde::{Deserialize, Serialize};

/// Room-wide settings, owned by the host and mirrored on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomSettings {
    /// When set, the race timer starts for everyone at the broadcast start
    /// timestamp; otherwise each racer's timer starts on their first
    /// keystroke.
    pub realtime_mode: bool,
    /// When set, typing errors must be corrected before advancing.
    pub strict_mode: bool,
}

/// Race state embedded in the host's presence record.
///
/// This is the recovery path for late joiners and refreshed clients: the
/// broadcast channel only reaches peers subscribed at send time, so the
/// host repeats the essentials in its own presence row. It also carries the
/// join key the admission check validates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRaceState {
    pub phase: RacePhase,
    pub paragraph: String,
    pub paragraph_index: u32,
    #[serde(default)]
    pub countdown_end_ms: Option<u64>,
    #[serde(default)]
    pub race_start_ms: Option<u64>,
    pub join_key: String,
    pub settings: RoomSettings,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub round: u32,
}

/// One peer's row in the periodically-synchronized presence registry.
///
/// Every peer announces its own record; the transport fans the full set out
/// to all subscribers. Only the host populates `race_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: String,
    pub name: String,
    pub ready: bool,
    pub progress: f32,
    pub wpm: f32,
    pub accuracy: f32,
    pub cursor: u32,
    pub finished: bool,
    pub time: f64,
    #[serde(default)]
    pub word_speeds: Vec<f32>,
    #[serde(default)]
    pub keylog: String,
    pub is_host: bool,
    pub is_spectator: bool,
    /// Spectating only until the next waiting phase.
    #[serde(default)]
    pub late_joiner: bool,
    #[serde(default)]
    pub race_state: Option<HostRaceState>,
}

impl PresenceRecord {
    /// Builds the presence row a peer announces for its own member record.
    pub fn from_member(member: &Member, race_state: Option<HostRaceState>) -> Self {
        Self {
            id: member.id.clone(),
            name: member.name.clone(),
            ready: member.ready,
            progress: member.progress,
            wpm: member.wpm,
            accuracy: member.accuracy,
            cursor: member.cursor,
            finished: member.finished,
            time: member.time,
            word_speeds: member.word_speeds.clone(),
            keylog: member.keylog.clone(),
            is_host: member.is_host,
            is_spectator: member.is_spectator,
            late_joiner: member.late_joiner,
            race_state,
        }
    }

    /// First-sighting conversion: a member record seeded from presence.
    pub fn to_member(&self) -> Member {
        let mut m = Member::new(self.id.clone(), self.name.clone());
        m.ready = self.ready;
        m.progress = self.progress;
        m.wpm = self.wpm;
        m.accuracy = self.accuracy;
        m.cursor = self.cursor;
        m.finished = self.finished;
        m.time = self.time;
        m.word_speeds = self.word_speeds.clone();
        m.keylog = self.keylog.clone();
        m.is_host = self.is_host;
        m.is_spectator = self.is_spectator;
        m.late_joiner = self.late_joiner;
        m
    }
}
