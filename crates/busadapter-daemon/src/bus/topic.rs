//! MQTT topic filter validation and matching.

use super::BusError;

/// Check that a filter is well formed: non-empty, `#` only as the whole
/// last level, `+` only as a whole level.
pub fn validate_filter(filter: &str) -> Result<(), BusError> {
    let invalid = || BusError::InvalidTopic(filter.to_string());
    if filter.is_empty() || filter.contains('\0') {
        return Err(invalid());
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(invalid());
        }
        if level.contains('+') && level != "+" {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validate a whole subscription request.
pub fn validate_filters(filters: &[String]) -> Result<(), BusError> {
    if filters.is_empty() {
        return Err(BusError::NoTopics);
    }
    filters.iter().try_for_each(|f| validate_filter(f))
}

/// Whether `topic` is selected by `filter`.
///
/// Topics starting with `$` are never matched by a leading wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) | (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

/// Whether any of `filters` selects `topic`.
pub fn matches_any(filters: &[String], topic: &str) -> bool {
    filters.iter().any(|f| matches(f, topic))
}
