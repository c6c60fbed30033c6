//! Topic filter matching
//!
//! Filters are compared level by level on `/`. `+` matches exactly one level and
//! `#` matches the remaining levels including the parent (`a/#` matches `a`).
//! Topics starting with `$` are never matched by a leading wildcard, but an
//! explicit `$SYS/#` does match them.
//!
//! `rumqttc::matches` rejects every `$` topic outright, so a `$SYS/#` debug
//! subscription would never route. Matching lives here for that reason.

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";
const MAX_TOPIC_LEN: usize = 65_535;

/// Returns true when `topic` is delivered to a subscription on `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True when the filter contains `+` or `#`
pub fn has_wildcards(filter: &str) -> bool {
    filter
        .split(SEPARATOR)
        .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
}

/// Checks that `filter` is a well-formed subscription filter
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("Topic must not be empty".to_string());
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(format!("Topic exceeds {} bytes", MAX_TOPIC_LEN));
    }
    if filter.contains('\0') {
        return Err("Topic must not contain NUL characters".to_string());
    }

    let levels: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL || index != last) {
            return Err(format!(
                "'#' must occupy the last level on its own in '{}'",
                filter
            ));
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(format!("'+' must occupy a whole level in '{}'", filter));
        }
    }
    Ok(())
}

/// Checks that `topic` is a concrete topic suitable for publishing
pub fn validate_topic(topic: &str) -> Result<(), String> {
    validate_filter(topic)?;
    if has_wildcards(topic) {
        return Err(format!("Cannot publish to wildcard topic '{}'", topic));
    }
    Ok(())
}
