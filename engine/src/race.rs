//! Race session core: lifecycle state, the merged member replica, and the
//! local operations a client UI drives.
//!
//! Each peer owns one [`RaceEngine`]. The engine is synchronous and
//! deterministic: it consumes presence snapshots, broadcast events, local
//! UI actions and explicit `now_ms` timestamps, and emits its side effects
//! through an outbox the transport driver drains. All timers are plain
//! deadlines fired from [`RaceEngine::tick`], so tests can simulate time.

use crate::admission;
use crate::election::FailoverState;
use crate::results::{self, RaceSummary};
use crate::session::{self, JoinIntent};
use crate::store::{host_marker_key, join_key_cache_key, SessionStore};
use log::{debug, info, warn};
use protocol::{
    ChatMessage, HostRaceState, Member, PresenceRecord, RaceEvent, RacePhase, RankedResult,
    RoomSettings, SyncedRaceState, CHAT_LOG_CAP, COUNTDOWN_MS, NAME_RECHECK_DELAY_MS,
    STATS_TIMEOUT_MS,
};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Errors returned by local engine operations.
///
/// These surface to the local UI only; nothing arriving from the network
/// produces an error (malformed input is simply dropped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotHost,
    NotJoined,
    InvalidPhase,
    NotEnoughRacers,
    RacersNotReady,
    SpectatorForbidden,
    UnknownMember,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EngineError::NotHost => "only the host can do this",
            EngineError::NotJoined => "not in a room",
            EngineError::InvalidPhase => "not allowed in the current race phase",
            EngineError::NotEnoughRacers => "need at least two racers",
            EngineError::RacersNotReady => "not all racers are ready",
            EngineError::SpectatorForbidden => "spectators cannot do this",
            EngineError::UnknownMember => "no such member",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for EngineError {}

/// Side effects the engine asks its transport driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Publish a broadcast event on the room channel.
    Broadcast(RaceEvent),
    /// Announce the local peer's presence record.
    Presence(PresenceRecord),
}

/// The host's authoritative copy of the race data.
///
/// Mutated only by the host's own handlers, never by a remote peer; used
/// to answer late-joiner state syncs and as a merge floor against stale
/// presence snapshots.
#[derive(Debug, Clone)]
pub struct HostAuthoritativeState {
    pub join_key: String,
    pub members: HashMap<String, Member>,
}

/// An outstanding stats request with its client-side timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStats {
    pub target_id: String,
    pub deadline_ms: u64,
}

/// A received stats response, held for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReply {
    pub from: String,
    pub payload: String,
}

/// Capped chat log with id-based deduplication.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    seen: HashSet<String>,
}

impl ChatLog {
    /// Appends a message unless its id was already seen. Returns whether
    /// the message was new.
    pub fn push(&mut self, msg: ChatMessage) -> bool {
        if !self.seen.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push_back(msg);
        while self.messages.len() > CHAT_LOG_CAP {
            if let Some(old) = self.messages.pop_front() {
                self.seen.remove(&old.id);
            }
        }
        true
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// The per-peer race coordination engine.
pub struct RaceEngine {
    pub(crate) peer_id: String,
    pub(crate) intent: JoinIntent,
    pub(crate) phase: RacePhase,
    pub(crate) members: HashMap<String, Member>,
    pub(crate) settings: RoomSettings,
    pub(crate) room_name: String,
    pub(crate) paragraph: String,
    pub(crate) paragraph_index: u32,
    pub(crate) countdown_end_ms: Option<u64>,
    pub(crate) race_start_ms: Option<u64>,
    pub(crate) round: u32,
    pub(crate) results: Vec<RankedResult>,
    pub(crate) summary: Option<RaceSummary>,
    pub(crate) chat: ChatLog,
    pub(crate) host_state: Option<HostAuthoritativeState>,
    pub(crate) failover: Option<FailoverState>,
    pub(crate) last_host_id: Option<String>,
    pub(crate) pending_stats: Option<PendingStats>,
    pub(crate) received_stats: Option<StatsReply>,
    pub(crate) stats_payload: Option<String>,
    /// Host only: deadline at which the countdown ends and racing starts.
    pub(crate) race_start_due: Option<u64>,
    pub(crate) name_recheck_at: Option<u64>,
    pub(crate) name_checked: bool,
    pub(crate) admitted: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) store: Box<dyn SessionStore>,
    pub(crate) outbox: Vec<Outbound>,
}

impl RaceEngine {
    /// Creates a room as its host: mints the join key, marks the durable
    /// "I was host" flag, and picks the first paragraph.
    pub fn create(
        room_id: impl Into<String>,
        room_name: impl Into<String>,
        display_name: impl Into<String>,
        mut store: Box<dyn SessionStore>,
    ) -> Self {
        let room_id = room_id.into();
        let peer_id = session::load_or_create_peer_id(store.as_mut());
        let join_key = session::mint_join_key();
        store.set(&host_marker_key(&room_id), "1");
        store.set(&join_key_cache_key(&room_id), &join_key);

        let paragraph_index = rand::thread_rng().gen_range(0..protocol::paragraphs::count()) as u32;
        let intent = JoinIntent {
            room_id,
            display_name: display_name.into(),
            join_key: Some(join_key.clone()),
            spectate: false,
        };

        let mut engine = Self::bare(peer_id, intent, store);
        engine.room_name = room_name.into();
        engine.paragraph_index = paragraph_index;
        engine.paragraph = protocol::paragraphs::get(paragraph_index).to_string();
        engine.host_state = Some(HostAuthoritativeState {
            join_key,
            members: HashMap::new(),
        });
        engine.admitted = true;
        engine
    }

    /// Joins an existing room. A key presented now is cached per room so a
    /// refreshed session resumes as a racer; with no key, a previously
    /// cached one is reused.
    pub fn join(mut intent: JoinIntent, mut store: Box<dyn SessionStore>) -> Self {
        let peer_id = session::load_or_create_peer_id(store.as_mut());
        let cache_key = join_key_cache_key(&intent.room_id);
        match &intent.join_key {
            Some(key) => store.set(&cache_key, key),
            None if !intent.spectate => intent.join_key = store.get(&cache_key),
            None => {}
        }
        Self::bare(peer_id, intent, store)
    }

    fn bare(peer_id: String, intent: JoinIntent, store: Box<dyn SessionStore>) -> Self {
        Self {
            peer_id,
            intent,
            phase: RacePhase::Idle,
            members: HashMap::new(),
            settings: RoomSettings::default(),
            room_name: String::new(),
            paragraph: String::new(),
            paragraph_index: 0,
            countdown_end_ms: None,
            race_start_ms: None,
            round: 1,
            results: Vec::new(),
            summary: None,
            chat: ChatLog::default(),
            host_state: None,
            failover: None,
            last_host_id: None,
            pending_stats: None,
            received_stats: None,
            stats_payload: None,
            race_start_due: None,
            name_recheck_at: None,
            name_checked: false,
            admitted: false,
            last_error: None,
            store,
            outbox: Vec::new(),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Local peer initiates the channel subscription.
    pub fn connect(&mut self) {
        if self.phase == RacePhase::Idle {
            self.phase = RacePhase::Connecting;
            self.last_error = None;
        }
    }

    /// Channel subscription acknowledged; enter the lobby.
    pub fn on_subscribed(&mut self, now: u64) {
        if self.phase != RacePhase::Connecting {
            return;
        }
        self.phase = RacePhase::Waiting;

        let mut me = Member::new(self.peer_id.clone(), self.intent.display_name.clone());
        me.is_host = self.host_state.is_some();
        me.is_spectator = self.intent.spectate;
        if me.is_host {
            self.last_host_id = Some(self.peer_id.clone());
        }
        if let Some(hs) = self.host_state.as_mut() {
            hs.members.insert(me.id.clone(), me.clone());
        }
        self.members.insert(me.id.clone(), me);

        self.name_recheck_at = Some(now + NAME_RECHECK_DELAY_MS);
        info!("joined room {} as {}", self.intent.room_id, self.peer_id);
        self.announce();
    }

    /// Channel subscription failed: back to idle with a user-visible
    /// error. No automatic retry.
    pub fn on_subscribe_error(&mut self, reason: &str) {
        warn!("subscription failed: {reason}");
        self.phase = RacePhase::Idle;
        self.last_error = Some(reason.to_string());
    }

    /// Leaves the room, clearing the per-room durable state.
    pub fn leave(&mut self) {
        self.store.clear_room(&self.intent.room_id.clone());
        self.phase = RacePhase::Idle;
        self.members.clear();
        self.host_state = None;
        self.failover = None;
        self.race_start_due = None;
        self.pending_stats = None;
        info!("left room {}", self.intent.room_id);
    }

    // ---- local actions ---------------------------------------------------

    /// Toggles the local peer's ready flag (lobby and post-race only).
    pub fn set_ready(&mut self, ready: bool, _now: u64) -> Result<(), EngineError> {
        let me = self.self_member().ok_or(EngineError::NotJoined)?;
        if me.is_spectator {
            return Err(EngineError::SpectatorForbidden);
        }
        if !matches!(self.phase, RacePhase::Waiting | RacePhase::Finished) {
            return Err(EngineError::InvalidPhase);
        }
        let id = self.peer_id.clone();
        self.update_member(&id, |m| m.ready = ready);
        self.broadcast(RaceEvent::ReadyUpdate { id, ready });
        Ok(())
    }

    /// Renames the local peer, deduplicating against current members.
    pub fn set_name(&mut self, desired: &str, _now: u64) -> Result<(), EngineError> {
        if self.self_member().is_none() {
            return Err(EngineError::NotJoined);
        }
        let taken: Vec<String> = self
            .members
            .values()
            .filter(|m| m.id != self.peer_id)
            .map(|m| m.name.clone())
            .collect();
        let name = admission::dedupe_name(desired, &taken);
        let id = self.peer_id.clone();
        self.update_member(&id, |m| m.name = name.clone());
        self.broadcast(RaceEvent::NameUpdate { id, name });
        Ok(())
    }

    /// Host-only: updates the room-wide settings.
    pub fn update_settings(&mut self, settings: RoomSettings) -> Result<(), EngineError> {
        if !self.is_host() {
            return Err(EngineError::NotHost);
        }
        self.settings = settings;
        self.broadcast(RaceEvent::SettingsUpdate { settings });
        self.announce();
        Ok(())
    }

    /// Host-only: renames the room.
    pub fn set_room_name(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.is_host() {
            return Err(EngineError::NotHost);
        }
        self.room_name = name.to_string();
        self.broadcast(RaceEvent::LobbyNameUpdate {
            name: name.to_string(),
        });
        self.announce();
        Ok(())
    }

    /// Host-only: starts the countdown, gated on at least two ready
    /// racers. The paragraph for the round is fixed at this moment.
    pub fn start_race(&mut self, now: u64) -> Result<(), EngineError> {
        if !self.is_host() {
            return Err(EngineError::NotHost);
        }
        if self.phase != RacePhase::Waiting {
            return Err(EngineError::InvalidPhase);
        }
        let racers: Vec<&Member> = self
            .members
            .values()
            .filter(|m| m.is_active_racer())
            .collect();
        if racers.len() < 2 {
            return Err(EngineError::NotEnoughRacers);
        }
        if racers.iter().any(|m| !m.ready) {
            return Err(EngineError::RacersNotReady);
        }

        let end_ms = now + COUNTDOWN_MS;
        self.race_start_due = Some(end_ms);
        let event = RaceEvent::Countdown {
            end_ms,
            paragraph: self.paragraph.clone(),
            paragraph_index: self.paragraph_index,
        };
        info!("race countdown started, begins at {end_ms}");
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    /// Reports the local racer's live telemetry during a race.
    pub fn report_progress(
        &mut self,
        progress: f32,
        wpm: f32,
        accuracy: f32,
        cursor: u32,
        now: u64,
    ) -> Result<(), EngineError> {
        let me = self.self_member().ok_or(EngineError::NotJoined)?;
        if me.is_spectator {
            return Err(EngineError::SpectatorForbidden);
        }
        if self.phase != RacePhase::Racing || me.finished {
            return Err(EngineError::InvalidPhase);
        }
        let event = RaceEvent::Progress {
            id: self.peer_id.clone(),
            progress,
            wpm,
            accuracy,
            cursor,
        };
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    /// Reports the local racer's finished-session metrics, as produced by
    /// the stats collaborator.
    pub fn report_finish(
        &mut self,
        wpm: f32,
        accuracy: f32,
        time: f64,
        word_speeds: Vec<f32>,
        keylog: String,
        now: u64,
    ) -> Result<(), EngineError> {
        let me = self.self_member().ok_or(EngineError::NotJoined)?;
        if me.is_spectator {
            return Err(EngineError::SpectatorForbidden);
        }
        if self.phase != RacePhase::Racing || me.finished {
            return Err(EngineError::InvalidPhase);
        }
        let event = RaceEvent::Finish {
            id: self.peer_id.clone(),
            wpm,
            accuracy,
            time,
            word_speeds,
            keylog,
        };
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    /// Host-only: starts a new round after a finished race.
    pub fn rematch(&mut self, now: u64) -> Result<(), EngineError> {
        if !self.is_host() {
            return Err(EngineError::NotHost);
        }
        if self.phase != RacePhase::Finished {
            return Err(EngineError::InvalidPhase);
        }
        let paragraph_index = self.pick_next_paragraph();
        let event = RaceEvent::NewRound {
            round: self.round + 1,
            paragraph: protocol::paragraphs::get(paragraph_index).to_string(),
            paragraph_index,
        };
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    /// Sends a chat message; the channel echo is deduplicated by id.
    pub fn send_chat(&mut self, text: &str, now: u64) -> Result<(), EngineError> {
        let me = self.self_member().ok_or(EngineError::NotJoined)?;
        let msg = ChatMessage {
            id: session::mint_message_id(),
            sender_id: self.peer_id.clone(),
            sender_name: me.name.clone(),
            text: text.to_string(),
            sent_at_ms: now,
        };
        let event = RaceEvent::Chat(msg);
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    /// Requests another member's historical stats; cleared after a
    /// response or the client-side timeout.
    pub fn request_stats(&mut self, target_id: &str, now: u64) -> Result<(), EngineError> {
        if !self.members.contains_key(target_id) {
            return Err(EngineError::UnknownMember);
        }
        self.pending_stats = Some(PendingStats {
            target_id: target_id.to_string(),
            deadline_ms: now + STATS_TIMEOUT_MS,
        });
        self.received_stats = None;
        self.broadcast(RaceEvent::StatsRequest {
            from: self.peer_id.clone(),
            target: target_id.to_string(),
        });
        Ok(())
    }

    /// Sets the opaque stats payload served to other peers' requests.
    pub fn set_stats_payload(&mut self, payload: impl Into<String>) {
        self.stats_payload = Some(payload.into());
    }

    // ---- timers ----------------------------------------------------------

    /// Fires any deadlines that have come due. Driven on a coarse interval
    /// by the transport driver, or with simulated time in tests.
    pub fn tick(&mut self, now: u64) {
        if let Some(due) = self.race_start_due {
            if now >= due && self.is_host() && self.phase == RacePhase::Countdown {
                self.race_start_due = None;
                let event = RaceEvent::RaceStart { start_ms: now };
                info!("countdown elapsed, race starting");
                self.broadcast(event.clone());
                self.handle_event(event, now);
            }
        }

        if let Some(at) = self.name_recheck_at {
            if now >= at {
                self.name_recheck_at = None;
                self.recheck_name();
            }
        }

        if let Some(pending) = &self.pending_stats {
            if now >= pending.deadline_ms {
                debug!("stats request to {} timed out", pending.target_id);
                self.pending_stats = None;
            }
        }

        self.tick_failover(now);
    }

    /// Delayed duplicate-name resolution: orders conflicting ids and every
    /// peer but the lexicographically first renames itself.
    fn recheck_name(&mut self) {
        if let Some(new_name) = admission::rename_for_collision(&self.peer_id, &self.members) {
            info!("display name collision, renaming to {new_name}");
            let id = self.peer_id.clone();
            self.update_member(&id, |m| m.name = new_name.clone());
            self.broadcast(RaceEvent::NameUpdate {
                id,
                name: new_name,
            });
        }
    }

    // ---- shared internals ------------------------------------------------

    pub(crate) fn broadcast(&mut self, event: RaceEvent) {
        self.outbox.push(Outbound::Broadcast(event));
    }

    /// Applies a mutation to a member in the local replica and, when the
    /// local peer is host, in the authoritative copy; re-announces presence
    /// when the member is the local peer.
    pub(crate) fn update_member<F: FnMut(&mut Member)>(&mut self, id: &str, mut f: F) {
        if let Some(m) = self.members.get_mut(id) {
            f(m);
        }
        if let Some(hs) = self.host_state.as_mut() {
            if let Some(m) = hs.members.get_mut(id) {
                f(m);
            }
        }
        if id == self.peer_id {
            self.announce();
        }
    }

    /// Queues the local presence record for publication.
    pub(crate) fn announce(&mut self) {
        let Some(member) = self.members.get(&self.peer_id).cloned() else {
            return;
        };
        let race_state = if member.is_host {
            Some(self.host_race_state())
        } else {
            None
        };
        self.outbox
            .push(Outbound::Presence(PresenceRecord::from_member(
                &member, race_state,
            )));
    }

    pub(crate) fn host_race_state(&self) -> HostRaceState {
        HostRaceState {
            phase: self.phase,
            paragraph: self.paragraph.clone(),
            paragraph_index: self.paragraph_index,
            countdown_end_ms: self.countdown_end_ms,
            race_start_ms: self.race_start_ms,
            join_key: self
                .host_state
                .as_ref()
                .map(|h| h.join_key.clone())
                .unwrap_or_default(),
            settings: self.settings,
            room_name: self.room_name.clone(),
            round: self.round,
        }
    }

    /// Full snapshot for a (re)joining peer, served from the authoritative
    /// copy when we are host.
    pub(crate) fn synced_state(&self) -> SyncedRaceState {
        let members = match &self.host_state {
            Some(hs) => hs.members.values().cloned().collect(),
            None => self.members.values().cloned().collect(),
        };
        SyncedRaceState {
            phase: self.phase,
            paragraph: self.paragraph.clone(),
            paragraph_index: self.paragraph_index,
            countdown_end_ms: self.countdown_end_ms,
            race_start_ms: self.race_start_ms,
            settings: self.settings,
            room_name: self.room_name.clone(),
            round: self.round,
            results: self.results.clone(),
            members,
        }
    }

    pub(crate) fn recompute_results(&mut self) {
        self.results = results::standings(self.members.values());
        self.summary = results::summarize(&self.results);
    }

    pub(crate) fn pick_next_paragraph(&self) -> u32 {
        let count = protocol::paragraphs::count() as u32;
        if count <= 1 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        loop {
            let index = rng.gen_range(0..count);
            if index != self.paragraph_index {
                return index;
            }
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> &str {
        &self.intent.room_id
    }

    pub fn phase(&self) -> RacePhase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn paragraph(&self) -> &str {
        &self.paragraph
    }

    pub fn paragraph_index(&self) -> u32 {
        self.paragraph_index
    }

    pub fn settings(&self) -> RoomSettings {
        self.settings
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn race_start_ms(&self) -> Option<u64> {
        self.race_start_ms
    }

    pub fn countdown_end_ms(&self) -> Option<u64> {
        self.countdown_end_ms
    }

    pub fn members(&self) -> &HashMap<String, Member> {
        &self.members
    }

    pub fn self_member(&self) -> Option<&Member> {
        self.members.get(&self.peer_id)
    }

    pub fn is_host(&self) -> bool {
        self.self_member().map(|m| m.is_host).unwrap_or(false)
    }

    /// The join key, available on the host only.
    pub fn join_key(&self) -> Option<&str> {
        self.host_state.as_ref().map(|h| h.join_key.as_str())
    }

    /// Racers (including disconnected-but-retained ones), for rendering.
    pub fn racers(&self) -> Vec<&Member> {
        let mut racers: Vec<&Member> = self
            .members
            .values()
            .filter(|m| !m.is_spectator)
            .collect();
        racers.sort_by(|a, b| a.id.cmp(&b.id));
        racers
    }

    pub fn spectators(&self) -> Vec<&Member> {
        let mut specs: Vec<&Member> = self.members.values().filter(|m| m.is_spectator).collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Current (possibly partial) ranked standings.
    pub fn results(&self) -> &[RankedResult] {
        &self.results
    }

    pub fn summary(&self) -> Option<&RaceSummary> {
        self.summary.as_ref()
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn pending_stats(&self) -> Option<&PendingStats> {
        self.pending_stats.as_ref()
    }

    pub fn received_stats(&self) -> Option<&StatsReply> {
        self.received_stats.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Drains the queued side effects for the transport driver.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn host_engine() -> RaceEngine {
        let mut engine = RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        engine.connect();
        engine.on_subscribed(0);
        engine
    }

    #[test]
    fn test_create_connect_subscribe_reaches_waiting() {
        let mut engine = RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        assert_eq!(engine.phase(), RacePhase::Idle);

        engine.connect();
        assert_eq!(engine.phase(), RacePhase::Connecting);

        engine.on_subscribed(0);
        assert_eq!(engine.phase(), RacePhase::Waiting);
        assert!(engine.is_host());
        assert!(engine.join_key().is_some());
        assert!(!engine.paragraph().is_empty());
    }

    #[test]
    fn test_subscribe_error_reverts_to_idle() {
        let mut engine = RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        engine.connect();
        engine.on_subscribe_error("channel refused");
        assert_eq!(engine.phase(), RacePhase::Idle);
        assert_eq!(engine.last_error(), Some("channel refused"));
    }

    #[test]
    fn test_start_race_requires_two_ready_racers() {
        let mut engine = host_engine();
        assert_eq!(engine.start_race(10), Err(EngineError::NotEnoughRacers));

        let mut bob = Member::new("zz-bob", "bob");
        bob.ready = true;
        engine.members.insert(bob.id.clone(), bob);
        engine.update_member(&engine.peer_id.clone(), |m| m.ready = false);
        assert_eq!(engine.start_race(10), Err(EngineError::RacersNotReady));

        engine.update_member(&engine.peer_id.clone(), |m| m.ready = true);
        assert_eq!(engine.start_race(10), Ok(()));
        assert_eq!(engine.phase(), RacePhase::Countdown);
        assert_eq!(engine.countdown_end_ms(), Some(10 + COUNTDOWN_MS));
    }

    #[test]
    fn test_countdown_deadline_fires_race_start() {
        let mut engine = host_engine();
        let mut bob = Member::new("zz-bob", "bob");
        bob.ready = true;
        engine.members.insert(bob.id.clone(), bob);
        engine.update_member(&engine.peer_id.clone(), |m| m.ready = true);
        engine.start_race(1_000).unwrap();

        engine.tick(1_000 + COUNTDOWN_MS - 1);
        assert_eq!(engine.phase(), RacePhase::Countdown);

        engine.tick(1_000 + COUNTDOWN_MS);
        assert_eq!(engine.phase(), RacePhase::Racing);
        assert_eq!(engine.race_start_ms(), Some(1_000 + COUNTDOWN_MS));
    }

    #[test]
    fn test_spectator_cannot_ready() {
        let mut engine = host_engine();
        engine.update_member(&engine.peer_id.clone(), |m| m.is_spectator = true);
        assert_eq!(engine.set_ready(true, 0), Err(EngineError::SpectatorForbidden));
    }

    #[test]
    fn test_progress_outside_race_rejected() {
        let mut engine = host_engine();
        assert_eq!(
            engine.report_progress(10.0, 50.0, 99.0, 5, 0),
            Err(EngineError::InvalidPhase)
        );
    }

    #[test]
    fn test_chat_log_caps_and_dedupes() {
        let mut log = ChatLog::default();
        let msg = ChatMessage {
            id: "m1".into(),
            sender_id: "p1".into(),
            sender_name: "alice".into(),
            text: "hi".into(),
            sent_at_ms: 0,
        };
        assert!(log.push(msg.clone()));
        assert!(!log.push(msg));
        assert_eq!(log.len(), 1);

        for i in 0..(CHAT_LOG_CAP + 10) {
            log.push(ChatMessage {
                id: format!("m-{i}"),
                sender_id: "p1".into(),
                sender_name: "alice".into(),
                text: "spam".into(),
                sent_at_ms: i as u64,
            });
        }
        assert_eq!(log.len(), CHAT_LOG_CAP);
    }

    #[test]
    fn test_stats_request_times_out() {
        let mut engine = host_engine();
        engine.members.insert("zz-bob".into(), Member::new("zz-bob", "bob"));
        engine.request_stats("zz-bob", 100).unwrap();
        assert!(engine.pending_stats().is_some());

        engine.tick(100 + STATS_TIMEOUT_MS - 1);
        assert!(engine.pending_stats().is_some());

        engine.tick(100 + STATS_TIMEOUT_MS);
        assert!(engine.pending_stats().is_none());
    }

    #[test]
    fn test_join_reuses_cached_key_on_refresh() {
        let mut store = MemoryStore::new();
        store.set(&join_key_cache_key("room-1"), "k-cached");
        let intent = JoinIntent {
            room_id: "room-1".into(),
            display_name: "bob".into(),
            join_key: None,
            spectate: false,
        };
        let engine = RaceEngine::join(intent, Box::new(store));
        assert_eq!(engine.intent.join_key.as_deref(), Some("k-cached"));
    }

    #[test]
    fn test_leave_clears_room_keys_and_state() {
        let mut engine = host_engine();
        engine.leave();
        assert_eq!(engine.phase(), RacePhase::Idle);
        assert!(engine.members().is_empty());
        assert!(engine.store.get(&host_marker_key("room-1")).is_none());
        assert!(engine.store.get(&join_key_cache_key("room-1")).is_none());
    }

    #[test]
    fn test_outbox_drains() {
        let mut engine = host_engine();
        assert!(!engine.drain_outbox().is_empty());
        assert!(engine.drain_outbox().is_empty());
    }
}
