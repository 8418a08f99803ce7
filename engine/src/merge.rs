//! Per-field merge rules for presence snapshots.
//!
//! Presence and broadcast events synchronize independently, so a snapshot
//! can arrive carrying values older than what a broadcast already applied.
//! The merge is therefore field-by-field: monotonic telemetry takes the
//! maximum of what is known, while fields that legitimately move both ways
//! follow the snapshot. The one exception is the window right after a
//! rematch reset, where the snapshot is authoritative and telemetry may
//! legitimately return to zero.

use protocol::{Member, PresenceRecord};

/// Merges a freshly observed presence row into the locally-held member.
///
/// `floor` is the host's authoritative copy of the same member, if the
/// local peer is host: its monotonic fields act as a lower bound on top of
/// the local ones. `allow_reset` is set while the room is back in the
/// waiting phase, where snapshot values override even if lower.
pub fn merge_presence(
    local: &mut Member,
    seen: &PresenceRecord,
    floor: Option<&Member>,
    allow_reset: bool,
) {
    // Identity and role flags always follow the peer's own announcement.
    local.name = seen.name.clone();
    local.ready = seen.ready;
    local.is_host = seen.is_host;
    local.is_spectator = seen.is_spectator;
    local.late_joiner = seen.late_joiner;
    local.disconnected = false;

    // Live accuracy fluctuates legitimately in both directions.
    local.accuracy = seen.accuracy;

    if allow_reset {
        local.progress = seen.progress;
        local.cursor = seen.cursor;
        local.finished = seen.finished;
        local.wpm = seen.wpm;
        local.time = seen.time;
        local.word_speeds = seen.word_speeds.clone();
        local.keylog = seen.keylog.clone();
        return;
    }

    let floor_progress = floor.map(|f| f.progress).unwrap_or(0.0);
    let floor_cursor = floor.map(|f| f.cursor).unwrap_or(0);
    let floor_finished = floor.map(|f| f.finished).unwrap_or(false);

    local.progress = local.progress.max(seen.progress).max(floor_progress);
    local.cursor = local.cursor.max(seen.cursor).max(floor_cursor);

    let was_finished = local.finished;
    local.finished = local.finished || seen.finished || floor_finished;

    if local.finished {
        // Words-per-minute at finish is monotonic: a stale snapshot must
        // not shrink a final result.
        let floor_wpm = floor.filter(|f| f.finished).map(|f| f.wpm).unwrap_or(0.0);
        if was_finished {
            local.wpm = local.wpm.max(seen.wpm).max(floor_wpm);
        } else {
            local.wpm = seen.wpm.max(floor_wpm).max(local.wpm);
        }
        // Final-only fields adopt from whichever finished record has them.
        if seen.finished {
            if local.time == 0.0 {
                local.time = seen.time;
            }
            if local.word_speeds.is_empty() {
                local.word_speeds = seen.word_speeds.clone();
            }
            if local.keylog.is_empty() {
                local.keylog = seen.keylog.clone();
            }
        }
    } else {
        // Live wpm follows the snapshot while the racer is still typing.
        local.wpm = seen.wpm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::PresenceRecord;

    fn record(member: &Member) -> PresenceRecord {
        PresenceRecord::from_member(member, None)
    }

    #[test]
    fn test_stale_progress_does_not_regress() {
        let mut local = Member::new("p1", "alice");
        local.progress = 60.0;
        local.cursor = 150;

        let mut stale = Member::new("p1", "alice");
        stale.progress = 40.0;
        stale.cursor = 100;

        merge_presence(&mut local, &record(&stale), None, false);
        assert_eq!(local.progress, 60.0);
        assert_eq!(local.cursor, 150);
    }

    #[test]
    fn test_finished_is_latched() {
        let mut local = Member::new("p1", "alice");
        local.finished = true;
        local.wpm = 90.0;
        local.time = 30.0;

        let mut stale = Member::new("p1", "alice");
        stale.finished = false;
        stale.wpm = 70.0;

        merge_presence(&mut local, &record(&stale), None, false);
        assert!(local.finished);
        assert_eq!(local.wpm, 90.0);
        assert_eq!(local.time, 30.0);
    }

    #[test]
    fn test_reset_window_lets_telemetry_return_to_zero() {
        let mut local = Member::new("p1", "alice");
        local.finished = true;
        local.progress = 100.0;
        local.wpm = 90.0;

        let fresh = Member::new("p1", "alice");
        merge_presence(&mut local, &record(&fresh), None, true);
        assert!(!local.finished);
        assert_eq!(local.progress, 0.0);
        assert_eq!(local.wpm, 0.0);
    }

    #[test]
    fn test_host_copy_acts_as_floor() {
        let mut local = Member::new("p1", "alice");
        local.progress = 10.0;

        let mut seen = Member::new("p1", "alice");
        seen.progress = 20.0;

        let mut authoritative = Member::new("p1", "alice");
        authoritative.progress = 75.0;
        authoritative.finished = true;
        authoritative.wpm = 95.0;

        merge_presence(&mut local, &record(&seen), Some(&authoritative), false);
        assert_eq!(local.progress, 75.0);
        assert!(local.finished);
        assert_eq!(local.wpm, 95.0);
    }

    #[test]
    fn test_live_wpm_follows_snapshot_both_ways() {
        let mut local = Member::new("p1", "alice");
        local.wpm = 80.0;

        let mut seen = Member::new("p1", "alice");
        seen.wpm = 65.0;

        merge_presence(&mut local, &record(&seen), None, false);
        assert_eq!(local.wpm, 65.0);
    }

    #[test]
    fn test_role_flags_follow_snapshot() {
        let mut local = Member::new("p1", "alice");
        local.disconnected = true;

        let mut seen = Member::new("p1", "alice");
        seen.is_host = true;
        seen.ready = true;

        merge_presence(&mut local, &record(&seen), None, false);
        assert!(local.is_host);
        assert!(local.ready);
        assert!(!local.disconnected);
    }
}
