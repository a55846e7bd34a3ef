// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic pattern matching with `#` / `+` wildcards.

/// Matches any trailing suffix (must be the last level of a pattern).
pub const TOPIC_WILDCARD: &str = "#";
/// Matches exactly one topic level.
pub const TOPIC_SINGLE_LEVEL_WILDCARD: &str = "+";
/// Separator between topic levels.
pub const TOPIC_LEVEL_SEPARATOR: &str = "/";

/// Returns `true` when `incoming_topic` matches any of `patterns`.
///
/// A pattern matches when it is the bare `#` wildcard, equals the incoming
/// topic exactly, or matches level-by-level where `+` consumes exactly one
/// level and `#` consumes the remaining suffix. A pattern with more levels
/// than the incoming topic never matches.
pub fn topic_matches(incoming_topic: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| pattern_matches(incoming_topic, p))
}

fn pattern_matches(incoming: &str, pattern: &str) -> bool {
    if pattern == TOPIC_WILDCARD {
        return true;
    }

    let has_wildcards = pattern
        .split(TOPIC_LEVEL_SEPARATOR)
        .any(|level| level == TOPIC_WILDCARD || level == TOPIC_SINGLE_LEVEL_WILDCARD);
    if !has_wildcards {
        return incoming == pattern;
    }

    let pattern_levels: Vec<&str> = pattern.split(TOPIC_LEVEL_SEPARATOR).collect();
    let incoming_levels: Vec<&str> = incoming.split(TOPIC_LEVEL_SEPARATOR).collect();

    if pattern_levels.len() > incoming_levels.len() {
        return false;
    }

    for (i, pattern_level) in pattern_levels.iter().enumerate() {
        match *pattern_level {
            TOPIC_WILDCARD => return true,
            TOPIC_SINGLE_LEVEL_WILDCARD => continue,
            literal => {
                if incoming_levels[i] != literal {
                    return false;
                }
            }
        }
    }

    // All pattern levels consumed; only a full-length match qualifies.
    pattern_levels.len() == incoming_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert!(topic_matches("a/b/c", &pats(&["#"])));
        assert!(topic_matches("", &pats(&["#"])));
    }

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", &pats(&["a/b/c"])));
        assert!(!topic_matches("a/b", &pats(&["a/b/c"])));
        assert!(!topic_matches("a/b/c/d", &pats(&["a/b/c"])));
    }

    #[test]
    fn single_level_wildcard_consumes_one_level() {
        assert!(topic_matches("a/b/c", &pats(&["a/+/c"])));
        assert!(!topic_matches("a/b/x", &pats(&["a/+/c"])));
        assert!(!topic_matches("a/b/b/c", &pats(&["a/+/c"])));
    }

    #[test]
    fn trailing_wildcard_consumes_suffix() {
        assert!(topic_matches("sensors/room1/temp", &pats(&["sensors/#"])));
        assert!(topic_matches("sensors/room1/temp/raw", &pats(&["sensors/#"])));
        assert!(!topic_matches("actuators/room1", &pats(&["sensors/#"])));
    }

    #[test]
    fn wildcards_combine() {
        assert!(topic_matches("a/b/c/d", &pats(&["a/+/#"])));
        assert!(!topic_matches("x/b/c/d", &pats(&["a/+/#"])));
    }

    #[test]
    fn longer_pattern_never_matches() {
        assert!(!topic_matches("a/b", &pats(&["a/+/c"])));
        assert!(!topic_matches("a", &pats(&["a/#"])));
    }

    #[test]
    fn first_matching_pattern_wins() {
        assert!(topic_matches("a/b", &pats(&["x/y", "a/+", "never"])));
    }

    #[test]
    fn empty_pattern_list_matches_nothing() {
        assert!(!topic_matches("a/b", &pats(&[])));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn topic_level() -> impl Strategy<Value = String> {
            "[a-z0-9]{1,6}"
        }

        fn topic() -> impl Strategy<Value = String> {
            proptest::collection::vec(topic_level(), 1..5).prop_map(|v| v.join("/"))
        }

        proptest! {
            #[test]
            fn identity_always_matches(t in topic()) {
                prop_assert!(topic_matches(&t, &[t.clone()]));
            }

            #[test]
            fn bare_wildcard_always_matches(t in topic()) {
                prop_assert!(topic_matches(&t, &["#".to_string()]));
            }

            #[test]
            fn single_level_substitution_matches(t in topic()) {
                let levels: Vec<&str> = t.split('/').collect();
                for i in 0..levels.len() {
                    let mut p = levels.clone();
                    p[i] = "+";
                    prop_assert!(topic_matches(&t, &[p.join("/")]));
                }
            }

            #[test]
            fn appending_level_breaks_exact_match(t in topic(), extra in topic_level()) {
                let longer = format!("{t}/{extra}");
                prop_assert!(!topic_matches(&longer, &[t.clone()]));
            }
        }
    }
}
