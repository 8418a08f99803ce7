//! Host election and failover.
//!
//! The host is whoever carries the `is_host` presence flag; nobody votes.
//! When the flag disappears while the room still needs a host, every peer
//! independently runs the same deterministic selection: the original host
//! (identified by its durable per-room marker) reclaims immediately, and
//! otherwise a countdown runs after which the lexicographically smallest
//! connected racer promotes itself. Promotion is announced through the
//! promoted peer's own presence record; reclamation and voluntary handoff
//! are broadcast so the countdown is cancelled everywhere at once.

use crate::race::{EngineError, HostAuthoritativeState, RaceEngine};
use crate::session;
use crate::store::{host_marker_key, join_key_cache_key};
use log::{info, warn};
use protocol::{RaceEvent, RacePhase, HOST_FAILOVER_SECS};

/// An in-flight host failover countdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverState {
    /// The host whose presence disappeared.
    pub lost_host_id: String,
    pub lost_at_ms: u64,
    /// Currently-projected next host; recomputed every tick since members
    /// may keep leaving during the countdown.
    pub candidate: Option<String>,
    pub remaining_secs: u32,
    pub(crate) next_tick_ms: u64,
}

impl RaceEngine {
    /// The failover countdown, if one is running (for the rendering layer).
    pub fn failover(&self) -> Option<&FailoverState> {
        self.failover.as_ref()
    }

    /// Deterministic next-host candidate: the lexicographically smallest
    /// id among connected, non-spectator members. Identical on every peer
    /// holding the same member set.
    pub fn candidate_id(&self) -> Option<String> {
        self.members
            .values()
            .filter(|m| m.is_active_racer())
            .map(|m| m.id.clone())
            .min()
    }

    /// Called when a presence snapshot shows no host while the room needs
    /// one.
    pub(crate) fn on_host_absent(&mut self, now: u64) {
        if self.is_host() {
            // Our own flag simply has not round-tripped yet.
            return;
        }
        if self
            .store
            .get(&host_marker_key(&self.intent.room_id))
            .is_some()
        {
            info!("host absent and we previously served as host, reclaiming");
            self.reclaim_host(now);
            return;
        }
        if self.failover.is_none() {
            let candidate = self.candidate_id();
            let lost_host_id = self.last_host_id.clone().unwrap_or_default();
            warn!(
                "host {lost_host_id} missing from presence, promoting {candidate:?} in {HOST_FAILOVER_SECS}s"
            );
            self.failover = Some(FailoverState {
                lost_host_id,
                lost_at_ms: now,
                candidate,
                remaining_secs: HOST_FAILOVER_SECS,
                next_tick_ms: now + 1_000,
            });
        }
    }

    pub(crate) fn cancel_failover(&mut self, reason: &str) {
        if self.failover.take().is_some() {
            info!("host failover cancelled: {reason}");
        }
    }

    /// Advances the failover countdown; at zero, the candidate — evaluated
    /// independently on every peer — self-promotes.
    pub(crate) fn tick_failover(&mut self, now: u64) {
        let candidate = self.candidate_id();
        let Some(f) = self.failover.as_mut() else {
            return;
        };
        f.candidate = candidate.clone();
        while f.remaining_secs > 0 && now >= f.next_tick_ms {
            f.remaining_secs -= 1;
            f.next_tick_ms += 1_000;
        }
        if f.remaining_secs > 0 {
            return;
        }

        self.failover = None;
        if candidate.as_deref() == Some(self.peer_id.as_str()) {
            info!("failover countdown elapsed, promoting self to host");
            self.promote_self(now);
        } else {
            info!("failover countdown elapsed, expecting {candidate:?} to take over");
        }
    }

    /// Original-host reclamation: immediate, broadcast so every peer
    /// cancels its countdown without waiting for the next presence sync.
    fn reclaim_host(&mut self, now: u64) {
        self.become_host(now);
        self.cancel_failover("reclaimed host role");
        self.broadcast(RaceEvent::HostReclaimed {
            host_id: self.peer_id.clone(),
        });
        self.announce();
    }

    /// Countdown-elapsed promotion: learned by others through the next
    /// presence sync only, no broadcast.
    fn promote_self(&mut self, now: u64) {
        self.become_host(now);
        let marker = host_marker_key(&self.intent.room_id);
        self.store.set(&marker, "1");
        self.announce();
    }

    /// Marks the local peer host and rehydrates the authoritative copy
    /// from the currently-merged member list. If the room is mid-countdown
    /// the race-start deadline is inherited too, so the race still begins.
    fn become_host(&mut self, now: u64) {
        let join_key = self
            .store
            .get(&join_key_cache_key(&self.intent.room_id))
            .or_else(|| self.intent.join_key.clone())
            .unwrap_or_else(|| {
                warn!("no cached join key to inherit, minting a fresh one");
                session::mint_join_key()
            });
        let peer = self.peer_id.clone();
        for m in self.members.values_mut() {
            m.is_host = m.id == peer;
        }
        self.host_state = Some(HostAuthoritativeState {
            join_key,
            members: self.members.clone(),
        });
        self.last_host_id = Some(peer);
        if self.phase == RacePhase::Countdown && self.race_start_due.is_none() {
            let due = self.countdown_end_ms.unwrap_or(now).max(now);
            info!("inheriting race-start deadline at {due}");
            self.race_start_due = Some(due);
        }
    }

    /// Voluntary handoff: the current host names a successor directly.
    pub fn transfer_host(&mut self, new_host_id: &str, now: u64) -> Result<(), EngineError> {
        if !self.is_host() {
            return Err(EngineError::NotHost);
        }
        if new_host_id == self.peer_id {
            return Ok(());
        }
        let eligible = self
            .members
            .get(new_host_id)
            .map(|m| m.is_active_racer())
            .unwrap_or(false);
        if !eligible {
            return Err(EngineError::UnknownMember);
        }
        let event = RaceEvent::HostTransferred {
            old_host_id: self.peer_id.clone(),
            new_host_id: new_host_id.to_string(),
        };
        self.broadcast(event.clone());
        self.handle_event(event, now);
        Ok(())
    }

    pub(crate) fn apply_host_reclaimed(&mut self, host_id: &str) {
        self.cancel_failover("host reclaimed");
        let was_host = self.is_host();
        let hid = host_id.to_string();
        for m in self.members.values_mut() {
            m.is_host = m.id == hid;
        }
        self.last_host_id = Some(hid);
        if host_id != self.peer_id && was_host {
            // Rare double-host window: yield to the reclaiming original.
            warn!("yielding host role to reclaiming {host_id}");
            self.host_state = None;
            let marker = host_marker_key(&self.intent.room_id);
            self.store.remove(&marker);
        }
        self.announce();
    }

    pub(crate) fn apply_host_transferred(&mut self, old_host_id: &str, new_host_id: &str, now: u64) {
        self.cancel_failover("host transferred");
        if new_host_id == self.peer_id {
            info!("received host role from {old_host_id}");
            self.become_host(now);
            let marker = host_marker_key(&self.intent.room_id);
            self.store.set(&marker, "1");
        } else {
            if self.is_host() || old_host_id == self.peer_id {
                // Outgoing host: drop the authoritative copy and the
                // durable marker so we never attempt reclamation later.
                self.host_state = None;
                let marker = host_marker_key(&self.intent.room_id);
                self.store.remove(&marker);
            }
            let nid = new_host_id.to_string();
            for m in self.members.values_mut() {
                m.is_host = m.id == nid;
            }
            self.last_host_id = Some(nid);
        }
        self.announce();
    }
}
