//! Topic filter parsing and matching
//!
//! Filters support `+` (exactly one level) and `#` (all remaining levels,
//! last position only). Tokens are split and cached once per subscription;
//! matching is a linear walk over the cached tokens.

use crate::error::{MqttError, MqttResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated, tokenized subscription filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    tokens: Vec<Token>,
}

impl TopicFilter {
    /// Parse and validate a filter string.
    pub fn parse(raw: &str) -> MqttResult<Self> {
        if raw.is_empty() {
            return Err(MqttError::violation("empty topic filter"));
        }
        if raw.contains('\0') {
            return Err(MqttError::violation("topic filter contains NUL"));
        }

        let levels: Vec<&str> = raw.split('/').collect();
        let mut tokens = Vec::with_capacity(levels.len());
        for (index, level) in levels.iter().enumerate() {
            let token = match *level {
                "#" => {
                    if index != levels.len() - 1 {
                        return Err(MqttError::violation(format!(
                            "'#' must be the last level in filter {raw:?}"
                        )));
                    }
                    Token::MultiLevel
                }
                "+" => Token::SingleLevel,
                literal => {
                    if literal.contains('#') || literal.contains('+') {
                        return Err(MqttError::violation(format!(
                            "wildcard must occupy a whole level in filter {raw:?}"
                        )));
                    }
                    Token::Literal(literal.to_string())
                }
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete topic name matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        // Topics beginning with '$' are not matched by filters that start
        // with a wildcard.
        if topic.starts_with('$')
            && matches!(
                self.tokens.first(),
                Some(Token::SingleLevel) | Some(Token::MultiLevel)
            )
        {
            return false;
        }

        let mut levels = topic.split('/');
        for (index, token) in self.tokens.iter().enumerate() {
            match token {
                Token::MultiLevel => {
                    // '#' also matches the parent level itself, so whatever
                    // remains (including nothing) matches.
                    let _ = index;
                    return true;
                }
                Token::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Token::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }
}

/// Validate a concrete topic name for publishing: non-empty, no wildcard
/// characters, no NUL.
pub fn validate_topic_name(topic: &str) -> MqttResult<()> {
    if topic.is_empty() {
        return Err(MqttError::violation("empty topic name"));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(MqttError::violation(format!(
            "topic name {topic:?} must not contain wildcards"
        )));
    }
    if topic.contains('\0') {
        return Err(MqttError::violation("topic name contains NUL"));
    }
    Ok(())
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(raw: &str) -> TopicFilter {
        TopicFilter::parse(raw).unwrap()
    }

    #[test]
    fn test_exact_match() {
        assert!(filter("a/b/c").matches("a/b/c"));
        assert!(!filter("a/b/c").matches("a/b"));
        assert!(!filter("a/b/c").matches("a/b/c/d"));
        assert!(!filter("a/b/c").matches("a/b/x"));
    }

    #[test]
    fn test_single_level_wildcard() {
        // The scenario from the delivery contract: a/+/c matches a/b/c
        // but not a/b/b/c.
        assert!(filter("a/+/c").matches("a/b/c"));
        assert!(!filter("a/+/c").matches("a/b/b/c"));
        assert!(!filter("a/+/c").matches("a/c"));
        assert!(filter("+").matches("x"));
        assert!(!filter("+").matches("x/y"));
        // '+' matches an empty level too.
        assert!(filter("a/+/c").matches("a//c"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(filter("a/#").matches("a/b"));
        assert!(filter("a/#").matches("a/b/c/d"));
        assert!(filter("a/#").matches("a"), "'#' matches the parent level");
        assert!(!filter("a/#").matches("b/a"));
        assert!(filter("#").matches("anything/at/all"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_wildcards() {
        assert!(!filter("#").matches("$SYS/broker/uptime"));
        assert!(!filter("+/broker/uptime").matches("$SYS/broker/uptime"));
        assert!(filter("$SYS/#").matches("$SYS/broker/uptime"));
    }

    #[test]
    fn test_invalid_filters_rejected() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("a/#/c").is_err());
        assert!(TopicFilter::parse("a/b#").is_err());
        assert!(TopicFilter::parse("a/+b/c").is_err());
        assert!(TopicFilter::parse("a\0b").is_err());
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_combined_wildcards() {
        assert!(filter("+/+/#").matches("a/b/c/d"));
        assert!(filter("+/+/#").matches("a/b"));
        assert!(!filter("+/+/#").matches("a"));
    }

    proptest! {
        #[test]
        fn exact_filter_matches_itself(topic in "[a-z]{1,6}(/[a-z]{1,6}){0,4}") {
            let parsed = TopicFilter::parse(&topic).unwrap();
            prop_assert!(parsed.matches(&topic));
        }

        #[test]
        fn hash_matches_every_extension(
            base in "[a-z]{1,6}(/[a-z]{1,6}){0,2}",
            rest in "[a-z]{1,6}(/[a-z]{1,6}){0,3}",
        ) {
            let parsed = TopicFilter::parse(&format!("{base}/#")).unwrap();
            let extended = format!("{base}/{rest}");
            prop_assert!(parsed.matches(&extended));
            prop_assert!(parsed.matches(&base));
        }
    }
}
