//! Topic name and topic filter rules.
//!
//! Topic names are what a PUBLISH carries and must be concrete. Topic filters
//! are what a SUBSCRIBE carries and may use `+` (exactly one level) and `#`
//! (every remaining level, only as the final level).

use crate::error::{HarnessError, Result};

const MAX_TOPIC_LEN: usize = 65_535;

/// # Errors
/// Returns `InvalidTopicName` for empty names, wildcards or NUL characters.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(HarnessError::InvalidTopicName(
            "topic must not be empty".to_string(),
        ));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(HarnessError::InvalidTopicName(format!(
            "topic is {} bytes, maximum is {MAX_TOPIC_LEN}",
            topic.len()
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(HarnessError::InvalidTopicName(topic.to_string()));
    }
    if topic.contains('\0') {
        return Err(HarnessError::InvalidTopicName(topic.replace('\0', "\\0")));
    }
    Ok(())
}

/// # Errors
/// Returns `InvalidTopicFilter` when a wildcard is misplaced.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(HarnessError::InvalidTopicFilter(filter.replace('\0', "\\0")));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(HarnessError::InvalidTopicFilter(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(HarnessError::InvalidTopicFilter(filter.to_string()));
        }
    }
    Ok(())
}

#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    validate_topic_filter(filter).is_ok()
}

/// Hierarchical match of a concrete topic against a filter.
///
/// Filters starting with a wildcard never match `$`-prefixed topics.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("home/light").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("home/+").is_err());
        assert!(validate_topic_name("home/#").is_err());
        assert!(validate_topic_name("bad\0topic").is_err());
    }

    #[test]
    fn test_topic_filter_validation() {
        assert!(validate_topic_filter("home/+").is_ok());
        assert!(validate_topic_filter("home/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+/+/status").is_ok());
        assert!(validate_topic_filter("home/#/light").is_err());
        assert!(validate_topic_filter("home/li#").is_err());
        assert!(validate_topic_filter("home/li+ght").is_err());
        assert!(validate_topic_filter("").is_err());
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches_filter("sport/tennis/player1", "sport/tennis/player1"));
        assert!(!topic_matches_filter("sport/tennis/player1", "sport/tennis/player2"));
        assert!(!topic_matches_filter("sport/tennis", "sport/tennis/player1"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches_filter("home/light", "home/+"));
        assert!(!topic_matches_filter("home/light/kitchen", "home/+"));
        assert!(!topic_matches_filter("home", "home/+"));
        assert!(topic_matches_filter("home/", "home/+"));
        assert!(topic_matches_filter("sensors/temperature/room1", "+/temperature/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches_filter("sensors/data/publisher-00001", "sensors/data/#"));
        assert!(topic_matches_filter("sensors/data", "sensors/data/#"));
        assert!(topic_matches_filter("a/b/c/d", "#"));
        assert!(!topic_matches_filter("sensors", "sensors/data/#"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches_filter("$SYS/broker/load", "#"));
        assert!(!topic_matches_filter("$SYS/broker", "+/broker"));
        assert!(topic_matches_filter("$SYS/broker/load", "$SYS/#"));
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(topic_matches_filter(&topic, &topic));
            prop_assert!(topic_matches_filter(&topic, "#"));
        }

        #[test]
        fn prop_plus_replaces_any_single_level(
            levels in prop::collection::vec("[a-z0-9]{1,8}", 1..6),
            idx in 0usize..6,
        ) {
            let topic = levels.join("/");
            let idx = idx % levels.len();
            let mut filter_levels: Vec<String> = levels.clone();
            filter_levels[idx] = "+".to_string();
            let filter = filter_levels.join("/");
            prop_assert!(is_valid_topic_filter(&filter));
            prop_assert!(topic_matches_filter(&topic, &filter));
        }
    }
}
