//! Shared wire types for the typing-race room channel.
//!
//! Everything that crosses the pub/sub channel lives here: the broadcast
//! event enum, the per-peer presence record, the member record both sides
//! merge into, and the protocol constants that every peer must agree on.

use serde::{Deserialize, Serialize};

pub mod event;
pub mod member;
pub mod paragraphs;
pub mod presence;

pub use event::{ChatMessage, RaceEvent, RankedResult, SyncedRaceState};
pub use member::Member;
pub use presence::{HostRaceState, PresenceRecord, RoomSettings};

/// Maximum number of racer slots in a room. Peers beyond this join as
/// spectators until a slot frees up at the next round.
pub const MAX_RACERS: usize = 5;

/// Delay between the host starting a race and the race actually beginning.
pub const COUNTDOWN_MS: u64 = 5_000;

/// Seconds a room waits for a vanished host before promoting a new one.
pub const HOST_FAILOVER_SECS: u32 = 60;

/// Number of chat messages retained in the room log.
pub const CHAT_LOG_CAP: usize = 50;

/// Client-side timeout for a pending stats request.
pub const STATS_TIMEOUT_MS: u64 = 10_000;

/// Delay before the secondary duplicate-name check after joining, long
/// enough for simultaneous joiners to show up in a presence snapshot.
pub const NAME_RECHECK_DELAY_MS: u64 = 2_000;

/// Lifecycle phase of a race room, as seen by a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RacePhase {
    /// Not connected to any room.
    #[default]
    Idle,
    /// Channel subscription in flight.
    Connecting,
    /// In the lobby, waiting for racers to ready up.
    Waiting,
    /// Countdown broadcast received, race about to begin.
    Countdown,
    /// Race in progress.
    Racing,
    /// All racers finished; results are final until a rematch.
    Finished,
}

impl RacePhase {
    /// True while a race is actually underway (countdown or typing).
    pub fn is_live(self) -> bool {
        matches!(self, RacePhase::Countdown | RacePhase::Racing)
    }

    /// True whenever the room needs a host to make progress.
    pub fn needs_host(self) -> bool {
        matches!(
            self,
            RacePhase::Waiting | RacePhase::Countdown | RacePhase::Racing
        )
    }
}
