//! Broadcast event handling.
//!
//! Every event arriving on the room channel is dispatched here, including
//! the echo of the local peer's own broadcasts, so each handler is written
//! to be idempotent and tolerant of duplicates and reordering across
//! senders. Events carry absolute timestamps and absolute counters rather
//! than deltas for exactly this reason.

use crate::merge::merge_presence;
use crate::race::{RaceEngine, StatsReply};
use crate::results;
use log::{debug, info};
use protocol::{
    ChatMessage, PresenceRecord, RaceEvent, RacePhase, RankedResult, SyncedRaceState, MAX_RACERS,
};

impl RaceEngine {
    /// Applies one decoded broadcast event against the local replica.
    pub fn handle_event(&mut self, event: RaceEvent, now: u64) {
        match event {
            RaceEvent::StateSync { target, state } => self.apply_state_sync(&target, state),
            RaceEvent::ReadyUpdate { id, ready } => {
                self.update_member(&id, |m| m.ready = ready);
            }
            RaceEvent::NameUpdate { id, name } => {
                self.update_member(&id, |m| m.name = name.clone());
            }
            RaceEvent::SettingsUpdate { settings } => {
                self.settings = settings;
            }
            RaceEvent::LobbyNameUpdate { name } => {
                self.room_name = name;
            }
            RaceEvent::Countdown {
                end_ms,
                paragraph,
                paragraph_index,
            } => self.apply_countdown(end_ms, paragraph, paragraph_index),
            RaceEvent::RaceStart { start_ms } => self.apply_race_start(start_ms),
            RaceEvent::Progress {
                id,
                progress,
                wpm,
                accuracy,
                cursor,
            } => self.apply_progress(&id, progress, wpm, accuracy, cursor),
            RaceEvent::Finish {
                id,
                wpm,
                accuracy,
                time,
                word_speeds,
                keylog,
            } => self.apply_finish(&id, wpm, accuracy, time, word_speeds, keylog, now),
            RaceEvent::RaceFinished { results } => self.apply_race_finished(results),
            RaceEvent::NewRound {
                round,
                paragraph,
                paragraph_index,
            } => self.apply_new_round(round, paragraph, paragraph_index),
            RaceEvent::Chat(msg) => self.apply_chat(msg),
            RaceEvent::StatsRequest { from, target } => self.apply_stats_request(&from, &target),
            RaceEvent::StatsResponse {
                target,
                from,
                payload,
            } => self.apply_stats_response(&target, &from, payload),
            RaceEvent::HostReclaimed { host_id } => self.apply_host_reclaimed(&host_id),
            RaceEvent::HostTransferred {
                old_host_id,
                new_host_id,
            } => self.apply_host_transferred(&old_host_id, &new_host_id, now),
        }
    }

    /// Adopts the host's full room snapshot. Only the addressed joiner
    /// applies it; the host itself and bystanders drop it.
    fn apply_state_sync(&mut self, target: &str, state: SyncedRaceState) {
        if self.is_host() || target != self.peer_id {
            return;
        }
        if self.phase == RacePhase::Finished && state.phase != RacePhase::Finished {
            debug!("dropping state sync that would rewind a finished race");
            return;
        }

        self.phase = state.phase;
        self.paragraph = state.paragraph;
        self.paragraph_index = state.paragraph_index;
        self.countdown_end_ms = state.countdown_end_ms;
        self.race_start_ms = state.race_start_ms;
        self.settings = state.settings;
        self.room_name = state.room_name;
        self.round = self.round.max(state.round);
        if !state.results.is_empty() {
            self.summary = results::summarize(&state.results);
            self.results = state.results;
        }

        let allow_reset = self.phase == RacePhase::Waiting;
        for member in state.members {
            if member.id == self.peer_id {
                continue;
            }
            match self.members.get_mut(&member.id) {
                Some(local) => {
                    let seen = PresenceRecord::from_member(&member, None);
                    merge_presence(local, &seen, None, allow_reset);
                }
                None => {
                    self.members.insert(member.id.clone(), member);
                }
            }
        }
        info!("applied room state sync, phase {:?}", self.phase);
    }

    fn apply_countdown(&mut self, end_ms: u64, paragraph: String, paragraph_index: u32) {
        if !matches!(self.phase, RacePhase::Waiting | RacePhase::Countdown) {
            return;
        }
        self.phase = RacePhase::Countdown;
        self.countdown_end_ms = Some(end_ms);
        self.paragraph = paragraph;
        self.paragraph_index = paragraph_index;
        if self.is_host() {
            self.announce();
        }
    }

    /// `Waiting` is accepted too: a peer that missed the countdown event
    /// still joins the race on the start signal.
    fn apply_race_start(&mut self, start_ms: u64) {
        if !matches!(self.phase, RacePhase::Countdown | RacePhase::Waiting) {
            return;
        }
        self.phase = RacePhase::Racing;
        self.race_start_ms = Some(start_ms);
        self.countdown_end_ms = None;
        if self.is_host() {
            self.announce();
        }
    }

    fn apply_progress(&mut self, id: &str, progress: f32, wpm: f32, accuracy: f32, cursor: u32) {
        if !self.members.contains_key(id) {
            debug!("progress for unknown member {id}, ignoring");
            return;
        }
        self.update_member(id, |m| {
            m.progress = m.progress.max(progress);
            m.cursor = m.cursor.max(cursor);
            if !m.finished {
                m.wpm = wpm;
                m.accuracy = accuracy;
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_finish(
        &mut self,
        id: &str,
        wpm: f32,
        accuracy: f32,
        time: f64,
        word_speeds: Vec<f32>,
        keylog: String,
        now: u64,
    ) {
        if !self.members.contains_key(id) {
            debug!("finish for unknown member {id}, ignoring");
            return;
        }
        let already = self.members.get(id).map(|m| m.finished).unwrap_or(false);
        if already {
            // Duplicate delivery; a final result only ever grows.
            self.update_member(id, |m| m.wpm = m.wpm.max(wpm));
        } else {
            info!("{id} finished at {wpm:.1} wpm");
            self.update_member(id, |m| {
                m.finished = true;
                m.progress = 100.0;
                m.wpm = wpm;
                m.accuracy = accuracy;
                m.time = time;
                m.word_speeds = word_speeds.clone();
                m.keylog = keylog.clone();
            });
        }
        self.recompute_results();

        // Host closes the race once every racer has a final result.
        // Disconnected racers are never force-finished, so the room can
        // stay in Racing until they return or drop out entirely.
        if self.is_host() && self.phase == RacePhase::Racing {
            let all_finished = self
                .members
                .values()
                .filter(|m| !m.is_spectator)
                .all(|m| m.finished);
            if all_finished {
                let event = RaceEvent::RaceFinished {
                    results: self.results.clone(),
                };
                self.broadcast(event.clone());
                self.handle_event(event, now);
            }
        }
    }

    /// Only accepted while a race is running (or already closed); a stale
    /// duplicate arriving after a new round has reset the lobby is dropped.
    fn apply_race_finished(&mut self, final_results: Vec<RankedResult>) {
        if !matches!(self.phase, RacePhase::Racing | RacePhase::Finished) {
            debug!("final results outside a race, ignoring");
            return;
        }
        self.summary = results::summarize(&final_results);
        self.results = final_results;
        self.phase = RacePhase::Finished;
        self.race_start_due = None;
        self.countdown_end_ms = None;
        info!("race finished, {} ranked", self.results.len());

        // Back to a "ready up again" posture for the rematch.
        let ids: Vec<String> = self.members.keys().cloned().collect();
        for id in ids {
            self.update_member(&id, |m| m.ready = false);
        }
    }

    fn apply_new_round(&mut self, round: u32, paragraph: String, paragraph_index: u32) {
        if matches!(self.phase, RacePhase::Idle | RacePhase::Connecting) {
            return;
        }
        // The round number is absolute, so a duplicate delivery (or the
        // echo of our own broadcast) is a no-op.
        if round <= self.round {
            return;
        }
        info!("round {round} starting");
        self.round = round;
        self.phase = RacePhase::Waiting;
        self.paragraph = paragraph;
        self.paragraph_index = paragraph_index;
        self.countdown_end_ms = None;
        self.race_start_ms = None;
        self.race_start_due = None;
        self.results.clear();
        self.summary = None;

        let ids: Vec<String> = self.members.keys().cloned().collect();
        for id in ids {
            self.update_member(&id, |m| m.reset_telemetry());
        }
        self.promote_late_joiners();
    }

    /// Back in the lobby, late joiners become racers in deterministic id
    /// order while capacity allows.
    fn promote_late_joiners(&mut self) {
        let mut racer_count = self
            .members
            .values()
            .filter(|m| m.is_active_racer())
            .count();
        let mut pending: Vec<String> = self
            .members
            .values()
            .filter(|m| m.is_spectator && m.late_joiner && !m.disconnected)
            .map(|m| m.id.clone())
            .collect();
        pending.sort_unstable();

        for id in pending {
            if racer_count >= MAX_RACERS {
                break;
            }
            info!("promoting late joiner {id} to racer");
            self.update_member(&id, |m| {
                m.is_spectator = false;
                m.late_joiner = false;
            });
            racer_count += 1;
        }
    }

    fn apply_chat(&mut self, msg: ChatMessage) {
        if self.chat.push(msg) {
            debug!("chat message appended, log size {}", self.chat.len());
        }
    }

    fn apply_stats_request(&mut self, from: &str, target: &str) {
        if target != self.peer_id || from == self.peer_id {
            return;
        }
        debug!("serving stats request from {from}");
        self.broadcast(RaceEvent::StatsResponse {
            target: from.to_string(),
            from: self.peer_id.clone(),
            payload: self.stats_payload.clone().unwrap_or_default(),
        });
    }

    fn apply_stats_response(&mut self, target: &str, from: &str, payload: String) {
        if target != self.peer_id {
            return;
        }
        let solicited = self
            .pending_stats
            .as_ref()
            .map(|p| p.target_id == from)
            .unwrap_or(false);
        if !solicited {
            debug!("unsolicited stats response from {from}, ignoring");
            return;
        }
        self.pending_stats = None;
        self.received_stats = Some(StatsReply {
            from: from.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::JoinIntent;
    use crate::store::MemoryStore;
    use protocol::{Member, RoomSettings};

    fn host_engine() -> RaceEngine {
        let mut engine =
            RaceEngine::create("room-1", "office", "alice", Box::new(MemoryStore::new()));
        engine.connect();
        engine.on_subscribed(0);
        engine.drain_outbox();
        engine
    }

    fn member_engine(id: &str) -> RaceEngine {
        let mut store = MemoryStore::new();
        crate::store::SessionStore::set(&mut store, crate::store::PEER_ID_KEY, id);
        let intent = JoinIntent::racer("room-1", format!("name-{id}"), "k1");
        let mut engine = RaceEngine::join(intent, Box::new(store));
        engine.connect();
        engine.on_subscribed(0);
        engine.drain_outbox();
        engine
    }

    fn add_member(engine: &mut RaceEngine, id: &str) {
        let m = Member::new(id, format!("name-{id}"));
        engine.members.insert(m.id.clone(), m.clone());
        if let Some(hs) = engine.host_state.as_mut() {
            hs.members.insert(m.id.clone(), m);
        }
    }

    fn finish_event(id: &str, wpm: f32) -> RaceEvent {
        RaceEvent::Finish {
            id: id.into(),
            wpm,
            accuracy: 97.0,
            time: 30.0,
            word_speeds: vec![wpm],
            keylog: String::new(),
        }
    }

    #[test]
    fn test_countdown_then_start_on_follower() {
        let mut engine = member_engine("zz-bob");
        engine.handle_event(
            RaceEvent::Countdown {
                end_ms: 5_000,
                paragraph: "pack my box".into(),
                paragraph_index: 3,
            },
            0,
        );
        assert_eq!(engine.phase(), RacePhase::Countdown);
        assert_eq!(engine.paragraph(), "pack my box");
        assert_eq!(engine.countdown_end_ms(), Some(5_000));

        engine.handle_event(RaceEvent::RaceStart { start_ms: 5_000 }, 5_000);
        assert_eq!(engine.phase(), RacePhase::Racing);
        assert_eq!(engine.race_start_ms(), Some(5_000));
        assert_eq!(engine.countdown_end_ms(), None);
    }

    #[test]
    fn test_race_start_from_waiting_is_accepted() {
        let mut engine = member_engine("zz-bob");
        engine.handle_event(RaceEvent::RaceStart { start_ms: 9_000 }, 9_000);
        assert_eq!(engine.phase(), RacePhase::Racing);
    }

    #[test]
    fn test_progress_is_monotonic_and_unknown_ignored() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.phase = RacePhase::Racing;

        for (progress, cursor) in [(30.0, 60), (10.0, 20), (55.0, 110)] {
            engine.handle_event(
                RaceEvent::Progress {
                    id: "zz-bob".into(),
                    progress,
                    wpm: 70.0,
                    accuracy: 95.0,
                    cursor,
                },
                0,
            );
        }
        let bob = &engine.members()["zz-bob"];
        assert_eq!(bob.progress, 55.0);
        assert_eq!(bob.cursor, 110);

        engine.handle_event(
            RaceEvent::Progress {
                id: "ghost".into(),
                progress: 50.0,
                wpm: 70.0,
                accuracy: 95.0,
                cursor: 10,
            },
            0,
        );
        assert!(!engine.members().contains_key("ghost"));
    }

    #[test]
    fn test_host_broadcasts_race_finished_after_last_finish() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.phase = RacePhase::Racing;
        let self_id = engine.peer_id().to_string();

        engine.handle_event(finish_event("zz-bob", 80.0), 0);
        assert_eq!(engine.phase(), RacePhase::Racing);
        assert_eq!(engine.results().len(), 1);

        engine.handle_event(finish_event(&self_id, 92.0), 0);
        assert_eq!(engine.phase(), RacePhase::Finished);
        assert_eq!(engine.results().len(), 2);
        assert_eq!(engine.results()[0].id, self_id);

        let sent_final = engine.drain_outbox().iter().any(|o| {
            matches!(
                o,
                crate::race::Outbound::Broadcast(RaceEvent::RaceFinished { .. })
            )
        });
        assert!(sent_final);
        assert!(engine.members().values().all(|m| !m.ready));
    }

    #[test]
    fn test_unfinished_disconnected_racer_keeps_race_open() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.update_member("zz-bob", |m| m.disconnected = true);
        engine.phase = RacePhase::Racing;

        let self_id = engine.peer_id().to_string();
        engine.handle_event(finish_event(&self_id, 90.0), 0);
        assert_eq!(engine.phase(), RacePhase::Racing);
    }

    #[test]
    fn test_duplicate_finish_keeps_max_wpm() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.phase = RacePhase::Racing;

        engine.handle_event(finish_event("zz-bob", 80.0), 0);
        engine.handle_event(finish_event("zz-bob", 75.0), 0);
        assert_eq!(engine.members()["zz-bob"].wpm, 80.0);
    }

    #[test]
    fn test_state_sync_applies_only_to_target() {
        let mut host = host_engine();
        add_member(&mut host, "zz-bob");
        host.phase = RacePhase::Racing;
        host.race_start_ms = Some(7_000);
        host.room_name = "office".into();
        let state = host.synced_state();

        let mut bystander = member_engine("yy-carol");
        bystander.handle_event(
            RaceEvent::StateSync {
                target: "zz-bob".into(),
                state: state.clone(),
            },
            0,
        );
        assert_eq!(bystander.phase(), RacePhase::Waiting);

        let mut joiner = member_engine("zz-bob");
        joiner.handle_event(
            RaceEvent::StateSync {
                target: "zz-bob".into(),
                state,
            },
            0,
        );
        assert_eq!(joiner.phase(), RacePhase::Racing);
        assert_eq!(joiner.race_start_ms(), Some(7_000));
        assert_eq!(joiner.room_name(), "office");
        assert!(joiner.members().len() >= 2);
    }

    #[test]
    fn test_state_sync_never_rewinds_finished() {
        let mut host = host_engine();
        host.phase = RacePhase::Racing;
        let state = host.synced_state();

        let mut peer = member_engine("zz-bob");
        peer.phase = RacePhase::Finished;
        peer.handle_event(
            RaceEvent::StateSync {
                target: "zz-bob".into(),
                state,
            },
            0,
        );
        assert_eq!(peer.phase(), RacePhase::Finished);
    }

    #[test]
    fn test_new_round_resets_and_promotes_late_joiner() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.update_member("zz-bob", |m| {
            m.finished = true;
            m.progress = 100.0;
            m.wpm = 85.0;
            m.ready = true;
        });
        add_member(&mut engine, "yy-late");
        engine.update_member("yy-late", |m| {
            m.is_spectator = true;
            m.late_joiner = true;
        });
        engine.phase = RacePhase::Finished;

        engine.handle_event(
            RaceEvent::NewRound {
                round: 2,
                paragraph: "fresh text".into(),
                paragraph_index: 1,
            },
            0,
        );
        assert_eq!(engine.round(), 2);
        assert_eq!(engine.phase(), RacePhase::Waiting);
        assert_eq!(engine.paragraph(), "fresh text");
        assert!(engine.results().is_empty());

        let bob = &engine.members()["zz-bob"];
        assert!(!bob.finished && !bob.ready);
        assert_eq!(bob.progress, 0.0);

        let late = &engine.members()["yy-late"];
        assert!(!late.is_spectator && !late.late_joiner);
    }

    #[test]
    fn test_new_round_echo_is_idempotent() {
        let mut engine = host_engine();
        engine.phase = RacePhase::Finished;
        let event = RaceEvent::NewRound {
            round: 2,
            paragraph: "text".into(),
            paragraph_index: 0,
        };
        engine.handle_event(event.clone(), 0);
        assert_eq!(engine.round(), 2);

        // Duplicate delivery of the same absolute round number.
        engine.handle_event(event, 1);
        assert_eq!(engine.round(), 2);
    }

    #[test]
    fn test_stale_race_finished_cannot_rewind_a_fresh_lobby() {
        let mut engine = host_engine();
        add_member(&mut engine, "zz-bob");
        engine.phase = RacePhase::Racing;
        let self_id = engine.peer_id().to_string();
        engine.handle_event(finish_event("zz-bob", 80.0), 0);
        engine.handle_event(finish_event(&self_id, 92.0), 0);
        assert_eq!(engine.phase(), RacePhase::Finished);
        let replay = RaceEvent::RaceFinished {
            results: engine.results().to_vec(),
        };

        engine.handle_event(
            RaceEvent::NewRound {
                round: 2,
                paragraph: "text".into(),
                paragraph_index: 0,
            },
            1,
        );
        assert_eq!(engine.phase(), RacePhase::Waiting);

        // A redelivered copy of the closed round's results.
        engine.handle_event(replay, 2);
        assert_eq!(engine.phase(), RacePhase::Waiting);
        assert!(engine.results().is_empty());
    }

    #[test]
    fn test_promotion_respects_capacity() {
        let mut engine = host_engine();
        // Host plus these fill all but one racer slot.
        for i in 0..MAX_RACERS - 2 {
            add_member(&mut engine, &format!("r-{i}"));
        }
        add_member(&mut engine, "s-1");
        add_member(&mut engine, "s-2");
        for id in ["s-1", "s-2"] {
            engine.update_member(id, |m| {
                m.is_spectator = true;
                m.late_joiner = true;
            });
        }

        engine.promote_late_joiners();
        let promoted: Vec<bool> = ["s-1", "s-2"]
            .iter()
            .map(|id| !engine.members()[*id].is_spectator)
            .collect();
        assert_eq!(promoted, vec![true, false]);
    }

    #[test]
    fn test_chat_echo_is_deduplicated() {
        let mut engine = host_engine();
        engine.send_chat("hello", 10).unwrap();
        assert_eq!(engine.chat().len(), 1);

        // Replay the broadcast as the channel echo.
        let echoed = engine.drain_outbox().into_iter().find_map(|o| match o {
            crate::race::Outbound::Broadcast(e @ RaceEvent::Chat(_)) => Some(e),
            _ => None,
        });
        engine.handle_event(echoed.unwrap(), 11);
        assert_eq!(engine.chat().len(), 1);
    }

    #[test]
    fn test_stats_request_response_flow() {
        let mut asker = host_engine();
        add_member(&mut asker, "zz-bob");
        let asker_id = asker.peer_id().to_string();

        let mut responder = member_engine("zz-bob");
        responder.set_stats_payload("{\"races\":12}");

        asker.request_stats("zz-bob", 0).unwrap();
        responder.handle_event(
            RaceEvent::StatsRequest {
                from: asker_id.clone(),
                target: "zz-bob".into(),
            },
            0,
        );
        let reply = responder.drain_outbox().into_iter().find_map(|o| match o {
            crate::race::Outbound::Broadcast(e @ RaceEvent::StatsResponse { .. }) => Some(e),
            _ => None,
        });

        asker.handle_event(reply.unwrap(), 1);
        assert!(asker.pending_stats().is_none());
        let got = asker.received_stats().unwrap();
        assert_eq!(got.from, "zz-bob");
        assert_eq!(got.payload, "{\"races\":12}");
    }

    #[test]
    fn test_unsolicited_stats_response_ignored() {
        let mut engine = host_engine();
        let self_id = engine.peer_id().to_string();
        engine.handle_event(
            RaceEvent::StatsResponse {
                target: self_id,
                from: "zz-bob".into(),
                payload: "junk".into(),
            },
            0,
        );
        assert!(engine.received_stats().is_none());
    }

    #[test]
    fn test_settings_and_lobby_name_updates_apply() {
        let mut engine = member_engine("zz-bob");
        engine.handle_event(
            RaceEvent::SettingsUpdate {
                settings: RoomSettings {
                    realtime_mode: true,
                    strict_mode: true,
                },
            },
            0,
        );
        assert!(engine.settings().realtime_mode);
        assert!(engine.settings().strict_mode);

        engine.handle_event(
            RaceEvent::LobbyNameUpdate {
                name: "speed demons".into(),
            },
            0,
        );
        assert_eq!(engine.room_name(), "speed demons");
    }
}
