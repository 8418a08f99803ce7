//! Admission control: racer vs. spectator classification and display-name
//! deduplication.
//!
//! Classification never hard-fails a join; the worst outcome is spectator
//! mode. Name collisions are resolved deterministically on every peer so no
//! negotiation round-trip is needed.

use crate::session::JoinIntent;
use protocol::{HostRaceState, Member, MAX_RACERS};
use std::collections::HashMap;

/// Outcome of the admission check for a joining peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Racer,
    Spectator {
        /// Held a valid key but arrived mid-race or over capacity; will be
        /// promoted to racer at the next waiting phase.
        late_joiner: bool,
    },
}

/// Classifies a joining peer against the host's announced race state.
///
/// `racer_count` counts connected non-spectator members already present.
pub fn classify(intent: &JoinIntent, host_state: &HostRaceState, racer_count: usize) -> Role {
    if intent.spectate {
        return Role::Spectator { late_joiner: false };
    }
    match &intent.join_key {
        Some(key) if *key == host_state.join_key => {}
        _ => return Role::Spectator { late_joiner: false },
    }
    if racer_count >= MAX_RACERS || host_state.phase.is_live() {
        return Role::Spectator { late_joiner: true };
    }
    Role::Racer
}

/// Picks a display name that does not collide case-insensitively with any
/// name in `taken`, appending ` (2)`, ` (3)`, ... as needed.
pub fn dedupe_name(desired: &str, taken: &[String]) -> String {
    let base = desired.trim();
    let base = if base.is_empty() { "anonymous" } else { base };

    let clashes = |candidate: &str| {
        taken
            .iter()
            .any(|t| t.to_lowercase() == candidate.to_lowercase())
    };

    if !clashes(base) {
        return base.to_string();
    }
    for n in 2u32.. {
        let candidate = format!("{base} ({n})");
        if !clashes(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// Secondary collision check for simultaneous joins.
///
/// If the local peer shares its name (case-insensitively) with other
/// members, the conflicting ids are ordered and everyone but the
/// lexicographically first renames itself. Returns the replacement name
/// the local peer should take, or `None` if it keeps its name.
pub fn rename_for_collision(self_id: &str, members: &HashMap<String, Member>) -> Option<String> {
    let own_name = members.get(self_id)?.name.to_lowercase();

    let mut conflicting: Vec<&str> = members
        .values()
        .filter(|m| m.name.to_lowercase() == own_name)
        .map(|m| m.id.as_str())
        .collect();
    if conflicting.len() < 2 {
        return None;
    }
    conflicting.sort_unstable();
    if conflicting[0] == self_id {
        return None;
    }

    let taken: Vec<String> = members
        .values()
        .filter(|m| m.id != self_id)
        .map(|m| m.name.clone())
        .collect();
    Some(dedupe_name(&members[self_id].name, &taken))
}
