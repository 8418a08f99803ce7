//! Presence synchronization.
//!
//! On every presence snapshot the engine reconciles the transport's view
//! of the room against its local replica: members are created on first
//! sighting, merged field-by-field under the monotonic rules, retained
//! with a `disconnected` flag when they vanish mid-race with progress, and
//! dropped otherwise. The snapshot is also where host absence is detected
//! and where a joining peer classifies itself against the host's embedded
//! race state.

use crate::admission::{self, Role};
use crate::merge::merge_presence;
use crate::race::RaceEngine;
use log::{debug, info};
use protocol::{HostRaceState, PresenceRecord, RaceEvent, RacePhase};
use std::collections::HashMap;

impl RaceEngine {
    /// Reconciles a full-membership presence snapshot.
    pub fn handle_presence(&mut self, snapshot: &[PresenceRecord], now: u64) {
        if matches!(self.phase, RacePhase::Idle | RacePhase::Connecting) {
            return;
        }

        // Deduplicate by id; the last snapshot entry per id wins.
        let mut latest: HashMap<&str, &PresenceRecord> = HashMap::new();
        for rec in snapshot {
            latest.insert(rec.id.as_str(), rec);
        }

        // The host's embedded race state drives admission and late-joiner
        // recovery, so absorb it before merging members.
        if let Some(host_rec) = latest.values().find(|r| r.is_host).copied() {
            self.last_host_id = Some(host_rec.id.clone());
            if host_rec.id != self.peer_id {
                // Capacity is judged against the snapshot, since the local
                // replica is still empty on the very first one.
                let racer_count = latest
                    .values()
                    .filter(|r| r.id != self.peer_id && !r.is_spectator)
                    .count();
                if let Some(hs) = host_rec.race_state.clone() {
                    self.absorb_host_state(&hs, racer_count);
                }
            }
        }

        let allow_reset = self.phase == RacePhase::Waiting;
        let self_id = self.peer_id.clone();

        // Merge into the authoritative copy first; it then acts as the
        // floor for the local replica so host knowledge never regresses.
        if let Some(hs) = self.host_state.as_mut() {
            for (id, rec) in &latest {
                if *id == self_id.as_str() {
                    continue;
                }
                match hs.members.get_mut(*id) {
                    Some(m) => merge_presence(m, rec, None, allow_reset),
                    None => {
                        hs.members.insert((*id).to_string(), rec.to_member());
                    }
                }
            }
        }

        let mut new_ids: Vec<String> = Vec::new();
        for (id, rec) in &latest {
            if *id == self_id.as_str() {
                continue;
            }
            if self.members.contains_key(*id) {
                let floor = self
                    .host_state
                    .as_ref()
                    .and_then(|h| h.members.get(*id))
                    .cloned();
                if let Some(m) = self.members.get_mut(*id) {
                    merge_presence(m, rec, floor.as_ref(), allow_reset);
                }
            } else {
                debug!("first presence sighting of {id}");
                self.members.insert((*id).to_string(), rec.to_member());
                new_ids.push((*id).to_string());
            }
        }

        // A (re)joining peer gets the full room state from the host.
        if self.is_host() {
            for id in &new_ids {
                debug!("sending state sync to {id}");
                let state = self.synced_state();
                self.broadcast(RaceEvent::StateSync {
                    target: id.clone(),
                    state,
                });
            }
        }

        self.handle_departures(&latest);

        // Host liveness.
        let host_present = latest.values().any(|r| r.is_host);
        if host_present {
            self.cancel_failover("host present in snapshot");
        } else {
            // The vanished host showing up again (even before it re-flags
            // itself) cancels the countdown; it will reclaim on its own.
            let lost_host_returned = self
                .failover
                .as_ref()
                .map(|f| latest.contains_key(f.lost_host_id.as_str()))
                .unwrap_or(false);
            if lost_host_returned {
                self.cancel_failover("previous host reappeared");
            }
        }
        if !host_present && self.phase.needs_host() {
            self.on_host_absent(now);
        }

        // Join-time duplicate-name check, once the first snapshot is in.
        if !self.name_checked {
            self.name_checked = true;
            self.dedupe_own_name();
        }
    }

    fn handle_departures(&mut self, latest: &HashMap<&str, &PresenceRecord>) {
        let absent: Vec<String> = self
            .members
            .keys()
            .filter(|id| id.as_str() != self.peer_id && !latest.contains_key(id.as_str()))
            .cloned()
            .collect();

        for id in absent {
            let retain = self
                .members
                .get(&id)
                .map(|m| self.phase.is_live() && !m.is_spectator && m.progress > 0.0)
                .unwrap_or(false);
            if retain {
                info!("{id} dropped from presence mid-race, retaining progress");
                self.update_member(&id, |m| m.disconnected = true);
            } else {
                debug!("{id} left the room");
                self.members.remove(&id);
                if let Some(hs) = self.host_state.as_mut() {
                    hs.members.remove(&id);
                }
            }
        }
    }

    /// Classifies the local peer against the host's announced state and
    /// adopts the room context when joining into a live race.
    fn absorb_host_state(&mut self, hs: &HostRaceState, racer_count: usize) {
        if self.is_host() || self.admitted {
            return;
        }

        let role = admission::classify(&self.intent, hs, racer_count);
        let self_id = self.peer_id.clone();
        match role {
            Role::Racer => info!("admitted as racer"),
            Role::Spectator { late_joiner } => {
                info!("joining as spectator (late joiner: {late_joiner})");
                self.update_member(&self_id, |m| {
                    m.is_spectator = true;
                    m.late_joiner = late_joiner;
                });
            }
        }
        self.admitted = true;

        // Adopt the room context we joined into.
        self.settings = hs.settings;
        self.room_name = hs.room_name.clone();
        self.round = hs.round;
        self.paragraph = hs.paragraph.clone();
        self.paragraph_index = hs.paragraph_index;
        if hs.phase.is_live() && self.phase == RacePhase::Waiting {
            self.phase = hs.phase;
            self.countdown_end_ms = hs.countdown_end_ms;
            self.race_start_ms = hs.race_start_ms;
        }
        self.announce();
    }

    fn dedupe_own_name(&mut self) {
        let Some(me) = self.members.get(&self.peer_id) else {
            return;
        };
        let name = me.name.clone();
        let taken: Vec<String> = self
            .members
            .values()
            .filter(|m| m.id != self.peer_id)
            .map(|m| m.name.clone())
            .collect();
        let deduped = admission::dedupe_name(&name, &taken);
        if deduped != name {
            info!("display name taken, using {deduped}");
            let id = self.peer_id.clone();
            self.update_member(&id, |m| m.name = deduped.clone());
            self.broadcast(RaceEvent::NameUpdate { id, name: deduped });
        }
    }
}
