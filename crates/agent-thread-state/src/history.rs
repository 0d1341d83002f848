//! Append-or-replace merging and tail truncation for ordered log fields.

/// Merges an incoming batch into an ordered history.
///
/// When `incoming` starts with the whole of `current` the producer re-sent its
/// backlog and `incoming` is taken verbatim. Any other non-empty batch is treated
/// as new items and appended.
#[must_use]
pub fn merge_append_or_replace<T: Clone + PartialEq>(current: &[T], incoming: &[T]) -> Vec<T> {
    if incoming.is_empty() || std::ptr::eq(current, incoming) {
        return current.to_vec();
    }
    if incoming.len() >= current.len() && incoming.starts_with(current) {
        return incoming.to_vec();
    }
    let mut merged = Vec::with_capacity(current.len() + incoming.len());
    merged.extend_from_slice(current);
    merged.extend_from_slice(incoming);
    merged
}

/// Keeps the newest `limit` entries. A limit of zero leaves the history unbounded.
pub fn limit_history<T>(history: &mut Vec<T>, limit: usize) {
    if limit == 0 || history.len() <= limit {
        return;
    }
    let excess = history.len() - limit;
    history.drain(..excess);
}

/// Append-or-replace followed by truncation.
#[must_use]
pub fn merge_bounded<T: Clone + PartialEq>(
    current: &[T],
    incoming: Option<&[T]>,
    limit: usize,
) -> Vec<T> {
    let mut merged = match incoming {
        Some(incoming) => merge_append_or_replace(current, incoming),
        None => current.to_vec(),
    };
    limit_history(&mut merged, limit);
    merged
}
