//! Progressive results aggregation.
//!
//! Standings are recomputed from the full finished set every time a finish
//! event lands, never patched incrementally, so the ranking is insensitive
//! to the order finish events arrive in.

use protocol::{Member, RankedResult};
use serde::Serialize;
use std::cmp::Ordering;

/// Aggregate statistics over a (possibly partial) result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceSummary {
    pub mean_wpm: f32,
    pub min_wpm: f32,
    pub max_wpm: f32,
    pub mean_accuracy: f32,
    pub min_accuracy: f32,
    pub max_accuracy: f32,
    /// Fastest minus slowest wpm.
    pub wpm_spread: f32,
    /// First place's lead over second, when there are at least two rows.
    pub winning_margin: Option<f32>,
}

/// Ranks all currently-finished racers by descending wpm, 1-based.
///
/// Ties break on peer id so every peer derives the identical order.
pub fn standings<'a, I>(members: I) -> Vec<RankedResult>
where
    I: IntoIterator<Item = &'a Member>,
{
    let mut finished: Vec<&Member> = members
        .into_iter()
        .filter(|m| m.finished && !m.is_spectator)
        .collect();

    finished.sort_by(|a, b| {
        b.wpm
            .partial_cmp(&a.wpm)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    finished
        .iter()
        .enumerate()
        .map(|(i, m)| RankedResult {
            position: i as u32 + 1,
            id: m.id.clone(),
            name: m.name.clone(),
            wpm: m.wpm,
            accuracy: m.accuracy,
            time: m.time,
        })
        .collect()
}

/// Aggregates a ranked result set; `None` when nobody has finished yet.
pub fn summarize(results: &[RankedResult]) -> Option<RaceSummary> {
    if results.is_empty() {
        return None;
    }

    let n = results.len() as f32;
    let mean_wpm = results.iter().map(|r| r.wpm).sum::<f32>() / n;
    let mean_accuracy = results.iter().map(|r| r.accuracy).sum::<f32>() / n;
    let min_wpm = results.iter().map(|r| r.wpm).fold(f32::INFINITY, f32::min);
    let max_wpm = results
        .iter()
        .map(|r| r.wpm)
        .fold(f32::NEG_INFINITY, f32::max);
    let min_accuracy = results
        .iter()
        .map(|r| r.accuracy)
        .fold(f32::INFINITY, f32::min);
    let max_accuracy = results
        .iter()
        .map(|r| r.accuracy)
        .fold(f32::NEG_INFINITY, f32::max);

    let winning_margin = if results.len() >= 2 {
        Some(results[0].wpm - results[1].wpm)
    } else {
        None
    };

    Some(RaceSummary {
        mean_wpm,
        min_wpm,
        max_wpm,
        mean_accuracy,
        min_accuracy,
        max_accuracy,
        wpm_spread: max_wpm - min_wpm,
        winning_margin,
    })
}
