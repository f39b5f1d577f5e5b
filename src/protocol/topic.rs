/// Checks if a topic or topic filter has wildcards
pub fn has_wildcards(s: &str) -> bool {
    s.contains('+') || s.contains('#')
}

/// Checks if the topic is a valid publish topic: non-empty and free of
/// wildcard characters
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !has_wildcards(topic)
}

/// Checks if the subscription filter is well formed: non-empty, `+`
/// occupies a whole level, `#` occupies a whole level and only the last
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels = filter.split('/').collect::<Vec<&str>>();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return false;
        }

        if level.contains('+') && *level != "+" {
            return false;
        }
    }

    true
}

/// Checks if a topic matches a filter. Topic and filter validation isn't
/// done here; validate a topic during publish and a filter during
/// subscribe.
///
/// Topics starting with '$' are matched only by filters whose first level
/// is the same literal, never by a leading wildcard.
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') {
        let first_topic_level = topic.split('/').next().unwrap_or("");
        let first_filter_level = filter.split('/').next().unwrap_or("");
        if first_filter_level != first_topic_level {
            return false;
        }
    }

    let mut topics = topic.split('/');
    let filters = filter.split('/');

    for f in filters {
        // "#" being the last element is validated by 'valid_filter'.
        // filter a/b/# matches topic a/b as well as deeper levels
        if f == "#" {
            return true;
        }

        match topics.next() {
            Some(_) if f == "+" => continue,
            Some(t) if f != t => return false,
            Some(_) => continue,
            None => return false,
        }
    }

    // topic has remaining levels and filter's last element isn't "#"
    topics.next().is_none()
}

#[cfg(test)]
mod test {
    #[test]
    fn wildcards_are_detected_correctly() {
        assert!(!super::has_wildcards("a/b/c"));
        assert!(super::has_wildcards("a/+/c"));
        assert!(super::has_wildcards("a/b/#"));
    }

    #[test]
    fn filters_are_validated_correctly() {
        assert!(super::valid_filter("a/b/c"));
        assert!(super::valid_filter("+/+/c"));
        assert!(super::valid_filter("a/b/#"));
        assert!(super::valid_filter("#"));
        assert!(super::valid_filter("+"));
        assert!(super::valid_filter("a//b"));

        assert!(!super::valid_filter(""));
        assert!(!super::valid_filter("a/#/c"));
        assert!(!super::valid_filter("a/b#"));
        assert!(!super::valid_filter("a/b+/c"));
    }

    #[test]
    fn topics_are_validated_correctly() {
        assert!(super::valid_topic("a/b/c"));
        assert!(super::valid_topic("$SYS/uptime"));
        assert!(!super::valid_topic(""));
        assert!(!super::valid_topic("a/+/c"));
        assert!(!super::valid_topic("a/b/#"));
    }

    #[test]
    fn topics_match_with_filters_as_expected() {
        assert!(super::matches("a/b/c", "a/b/c"));
        assert!(!super::matches("a/b/c", "d/b/c"));
        assert!(!super::matches("a/b/c", "a/b/e"));
        assert!(!super::matches("a/b/c", "a/b/c/d"));

        assert!(super::matches("a/b/c", "#"));
        assert!(super::matches("a/b/c", "a/b/c/#"));
        assert!(super::matches("a/b/c/d", "a/b/c/#"));
        assert!(super::matches("a/b/c/d/e/f", "a/b/c/#"));
        assert!(!super::matches("a/b/c/d", "a/b/c"));

        assert!(super::matches("a/b/c", "a/+/c"));
        assert!(super::matches("a/b/c/d/e", "a/+/c/+/e"));
        assert!(!super::matches("a/b", "a/b/+"));

        // '+' matches an empty level
        assert!(super::matches("a//c", "a/+/c"));
    }

    #[test]
    fn wildcard_scenarios_from_single_level_subscription() {
        assert!(super::matches("sensors/cpu/temp", "sensors/+/temp"));
        assert!(!super::matches("sensors/cpu", "sensors/+/temp"));
        assert!(!super::matches("sensors/cpu/temp/fine", "sensors/+/temp"));

        assert!(super::matches("sensors/cpu/temp", "sensors/#"));
        assert!(super::matches("sensors/cpu", "sensors/#"));
        assert!(super::matches("sensors/cpu/temp/fine", "sensors/#"));
    }

    #[test]
    fn dollar_topics_are_not_matched_by_leading_wildcards() {
        assert!(!super::matches("$SYS/metrics", "#"));
        assert!(!super::matches("$SYS/metrics", "+/metrics"));
        assert!(!super::matches("$SYS/metrics", "+/+"));

        // same literal first level is fine
        assert!(super::matches("$SYS/metrics", "$SYS/metrics"));
        assert!(super::matches("$SYS/metrics", "$SYS/+"));
        assert!(super::matches("$SYS/metrics", "$SYS/#"));

        // '$' not at the first character doesn't trigger the rule
        assert!(super::matches("sy$tem/metrics", "sy$tem/+"));
    }
}
