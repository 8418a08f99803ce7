//! Shareable result encoding.
//!
//! A compact, reversible text form of a finished race suitable for a URL
//! query parameter: version tag, paragraph metadata, then one record per
//! racer. The delimiters are percent-escaped inside names so that
//! `decode(encode(x)) == x` holds for every valid result set. Floats use
//! Rust's shortest round-trip formatting, which parses back exactly.

use protocol::RankedResult;
use serde::Serialize;

const VERSION: &str = "r1";

/// Decoded share payload: the result set plus which paragraph was typed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareCode {
    pub paragraph_index: u32,
    pub round: u32,
    pub results: Vec<RankedResult>,
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            ';' => out.push_str("%3B"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let hi = chars.next()?;
        let lo = chars.next()?;
        match (hi, lo) {
            ('2', '5') => out.push('%'),
            ('7', 'C') => out.push('|'),
            ('3', 'B') => out.push(';'),
            _ => return None,
        }
    }
    Some(out)
}

/// Encodes a share code as a single query-parameter-safe-ish string.
pub fn encode(code: &ShareCode) -> String {
    let mut parts = vec![
        VERSION.to_string(),
        code.paragraph_index.to_string(),
        code.round.to_string(),
    ];
    for r in &code.results {
        parts.push(format!(
            "{}|{}|{}|{}|{}|{}",
            r.position,
            escape(&r.id),
            escape(&r.name),
            r.wpm,
            r.accuracy,
            r.time
        ));
    }
    parts.join(";")
}

/// Decodes a share string; `None` for anything malformed.
pub fn decode(text: &str) -> Option<ShareCode> {
    let mut parts = text.split(';');
    if parts.next()? != VERSION {
        return None;
    }
    let paragraph_index = parts.next()?.parse().ok()?;
    let round = parts.next()?.parse().ok()?;

    let mut results = Vec::new();
    for record in parts {
        let fields: Vec<&str> = record.split('|').collect();
        if fields.len() != 6 {
            return None;
        }
        results.push(RankedResult {
            position: fields[0].parse().ok()?,
            id: unescape(fields[1])?,
            name: unescape(fields[2])?,
            wpm: fields[3].parse().ok()?,
            accuracy: fields[4].parse().ok()?,
            time: fields[5].parse().ok()?,
        });
    }

    Some(ShareCode {
        paragraph_index,
        round,
        results,
    })
}
