//! Built-in paragraph pool for race rounds.
//!
//! The host picks one paragraph per round by index; the index travels with
//! the countdown and new-round broadcasts so every peer renders the same
//! text even if pools ever diverge between client builds.

const POOL: &[&str] = &[
    "The quick brown fox jumps over the lazy dog while the farmer watches \
     from the porch, wondering whether the fence needs mending before the \
     first frost arrives.",
    "Pack my box with five dozen liquor jugs, said the clerk, sliding the \
     crate across the counter with a practiced shove that rattled every \
     bottle inside.",
    "A river does not argue with the stones in its bed; it simply finds a \
     way around them, and in a hundred years the stones are sand.",
    "Typing fast is mostly a matter of typing slowly for long enough that \
     your fingers stop asking the keyboard where the letters went.",
    "The lighthouse keeper counted the waves between flashes, certain that \
     one evening the sea would lose count first and forget to come back.",
    "Nobody remembers who installed the vending machine on the fourth \
     floor, but it accepts exact change only and dispenses advice along \
     with the coffee.",
    "In the workshop the printer hummed through the night, layer after \
     layer, building a small plastic boat for a puddle it would never see.",
    "She kept a list of words that sound like what they mean and read it \
     aloud whenever the afternoon turned too quiet to bear.",
];

/// Number of paragraphs in the pool.
pub fn count() -> usize {
    POOL.len()
}

/// Paragraph text for an index; wraps so any index is valid.
pub fn get(index: u32) -> &'static str {
    POOL[index as usize % POOL.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_nonempty_and_wraps() {
        assert!(count() >= 2);
        assert_eq!(get(0), POOL[0]);
        assert_eq!(get(count() as u32), POOL[0]);
    }
}
