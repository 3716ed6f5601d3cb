//! Dotted-segment glob matching for event type subscriptions
//!
//! `*` matches any single segment; `*` alone matches everything. Segment
//! counts must agree — there is no `**` and a glob never spans a dot.

/// Match a subscription pattern against a concrete event type name.
pub fn matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == event_type {
        return true;
    }
    let pattern_segs: Vec<&str> = pattern.split('.').collect();
    let type_segs: Vec<&str> = event_type.split('.').collect();
    if pattern_segs.len() != type_segs.len() {
        return false;
    }
    pattern_segs
        .iter()
        .zip(type_segs.iter())
        .all(|(p, t)| *p == "*" || p == t)
}

/// Whether any pattern in the list matches the event type.
pub fn any_matches<S: AsRef<str>>(patterns: &[S], event_type: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), event_type))
}
