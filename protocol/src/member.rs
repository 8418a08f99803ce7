use serde::{Deserialize, Serialize};

/// A single peer as tracked by the race engine.
///
/// One record exists per peer id, created on first presence sighting and
/// merged against every later snapshot and broadcast event. The telemetry
/// fields `progress`, `cursor`, `finished` and (once finished) `wpm` are
/// monotonic during a round: a stale presence snapshot must never pull them
/// backwards. They only legitimately reset when a new round begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub is_host: bool,
    pub is_spectator: bool,
    /// Peer vanished from presence mid-race but had progress; retained so
    /// its progress bar stays visible in case it reconnects.
    pub disconnected: bool,
    /// Joined during a live race (or over capacity) with a valid key;
    /// promoted to racer automatically at the next waiting phase.
    pub late_joiner: bool,
    pub ready: bool,
    pub finished: bool,
    /// Completion percentage, 0.0..=100.0.
    pub progress: f32,
    /// Live words-per-minute; final once `finished` is set.
    pub wpm: f32,
    /// Live accuracy percentage.
    pub accuracy: f32,
    /// Character position of the caret in the paragraph.
    pub cursor: u32,
    /// Finishing time in seconds; 0.0 until finished.
    pub time: f64,
    /// Per-word speed series, opaque to the engine, meaningful once finished.
    #[serde(default)]
    pub word_speeds: Vec<f32>,
    /// Raw keystroke log, opaque to the engine.
    #[serde(default)]
    pub keylog: String,
}

impl Member {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_host: false,
            is_spectator: false,
            disconnected: false,
            late_joiner: false,
            ready: false,
            finished: false,
            progress: 0.0,
            wpm: 0.0,
            accuracy: 0.0,
            cursor: 0,
            time: 0.0,
            word_speeds: Vec::new(),
            keylog: String::new(),
        }
    }

    /// Returns the member's race telemetry to its initial values for a new
    /// round. Identity and role flags are untouched.
    pub fn reset_telemetry(&mut self) {
        self.ready = false;
        self.finished = false;
        self.progress = 0.0;
        self.wpm = 0.0;
        self.accuracy = 0.0;
        self.cursor = 0;
        self.time = 0.0;
        self.word_speeds.clear();
        self.keylog.clear();
    }

    /// A connected, non-spectator participant: counted toward the racer
    /// minimum and eligible as a failover candidate.
    pub fn is_active_racer(&self) -> bool {
        !self.is_spectator && !self.disconnected
    }
}
