//! Topic filter matching
//!
//! Routes an incoming PUBLISH topic to the subscriptions whose filter it
//! matches, following the MQTT wildcard rules (`+`, `#`, `$` topics).

/// Check whether a topic name matches a subscription filter
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // Topics starting with $ don't match filters starting with + or #
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
