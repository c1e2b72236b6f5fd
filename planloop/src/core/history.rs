//! Bounded fix history carried between rounds.

/// Maximum number of fix descriptions retained in the run state.
pub const FIX_HISTORY_LIMIT: usize = 80;

/// Append `fixes` and keep only the most recent [`FIX_HISTORY_LIMIT`] entries.
pub fn append_fixes<I>(history: &mut Vec<String>, fixes: I)
where
    I: IntoIterator<Item = String>,
{
    history.extend(fixes);
    if history.len() > FIX_HISTORY_LIMIT {
        let excess = history.len() - FIX_HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// The last `max_items` entries, oldest first.
pub fn recent(history: &[String], max_items: usize) -> &[String] {
    let start = history.len().saturating_sub(max_items);
    &history[start..]
}
