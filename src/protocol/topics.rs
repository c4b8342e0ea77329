//! Topic matching for event listener fan-out
//!
//! This is a prefix-wildcard match, not a full glob. A listener's pattern set
//! matches an incoming topic when any of the following holds:
//!
//! 1. the set contains the literal `"*"`, or
//! 2. a pattern contains `*` and the incoming topic starts with the
//!    pattern's prefix up to and including its last `/`, or
//! 3. a pattern equals the incoming topic, compared case-insensitively.
//!
//! A `*` inside a pattern therefore only ever acts on whole trailing
//! segments: `bundle/*` matches `bundle/INSTALLED` and `bundle/a/b`, while
//! `bund*` (no slash) matches nothing but the literal text.

/// Decide whether any of the listener's patterns matches the incoming topic
pub fn matches_topic(incoming: &str, patterns: &[String]) -> bool {
    for pattern in patterns {
        if pattern == "*" {
            return true;
        }
        if pattern.contains('*') {
            if let Some(slash) = pattern.rfind('/') {
                let prefix = &pattern[..=slash];
                if incoming.starts_with(prefix) {
                    return true;
                }
            }
        }
        if incoming.eq_ignore_ascii_case(pattern) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_literal_wildcard_matches_everything() {
        assert!(matches_topic("a/b/c", &patterns(&["*"])));
        assert!(matches_topic("", &patterns(&["*"])));
        assert!(matches_topic("anything", &patterns(&["x/y", "*"])));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(matches_topic("a/b/c", &patterns(&["a/b/*"])));
        assert!(!matches_topic("a/b/c", &patterns(&["x/y/*"])));
        assert!(matches_topic("bundle/INSTALLED", &patterns(&["bundle/*"])));
        assert!(!matches_topic("service/REGISTERED", &patterns(&["bundle/*"])));
        // deeper topics still share the prefix
        assert!(matches_topic("bundle/a/b", &patterns(&["bundle/*"])));
    }

    #[test]
    fn test_case_insensitive_exact_match() {
        assert!(matches_topic("A/B", &patterns(&["a/b"])));
        assert!(matches_topic("a/b", &patterns(&["A/B"])));
        assert!(!matches_topic("a/b/c", &patterns(&["a/b"])));
    }

    #[test]
    fn test_starred_pattern_without_slash_only_matches_literally() {
        // no `/` in the pattern means there is no prefix to match on
        assert!(!matches_topic("bundles", &patterns(&["bund*"])));
        assert!(matches_topic("bund*", &patterns(&["bund*"])));
    }

    #[test]
    fn test_empty_pattern_set_matches_nothing() {
        assert!(!matches_topic("a/b", &[]));
    }

    #[test]
    fn test_prefix_is_taken_from_last_slash() {
        // prefix of "a/*/c*" is "a/*/" -- the wildcard position does not
        // shorten it
        assert!(matches_topic("a/*/cd", &patterns(&["a/*/c*"])));
        assert!(!matches_topic("a/b/cd", &patterns(&["a/*/c*"])));
    }

    proptest! {
        #[test]
        fn literal_wildcard_always_matches(topic in "[a-zA-Z0-9/]{0,40}") {
            prop_assert!(matches_topic(&topic, &["*".to_string()]));
        }

        #[test]
        fn exact_pattern_matches_itself(topic in "[a-zA-Z0-9/]{1,40}") {
            prop_assert!(matches_topic(&topic, &[topic.clone()]));
        }

        #[test]
        fn slash_wildcard_requires_prefix(
            head in "[a-z0-9]{1,10}",
            tail in "[a-z0-9]{1,10}",
            other in "[A-Z]{1,10}",
        ) {
            let pattern = format!("{head}/*");
            let matching = format!("{head}/{tail}");
            let unrelated = format!("x{other}/{tail}");
            prop_assert!(matches_topic(&matching, &[pattern.clone()]));
            prop_assert!(!matches_topic(&unrelated, &[pattern]));
        }
    }
}
