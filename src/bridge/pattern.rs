//! Subscription patterns
//!
//! Forms understood by the bridge:
//!
//! | pattern    | matches                                              |
//! |------------|------------------------------------------------------|
//! | `*`        | every topic                                          |
//! | `user.*`   | `user.` followed by at least one more character       |
//! | `*.created`| `.created` preceded by at least one character         |
//! | `chat`     | exactly `chat`                                       |
//!
//! Any other use of `*` (`a.*.b`, `*.*`) is taken literally.

/// The catch-all pattern
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern<'a> {
    Any,
    Exact(&'a str),
    /// Trailing wildcard; holds the prefix including its final `.`
    Prefix(&'a str),
    /// Leading wildcard; holds the suffix including its leading `.`
    Suffix(&'a str),
}

impl<'a> Pattern<'a> {
    pub fn parse(pattern: &'a str) -> Self {
        if pattern == WILDCARD {
            return Self::Any;
        }
        if let Some(prefix) = pattern
            .strip_suffix('*')
            .filter(|p| p.ends_with('.') && !p.contains('*'))
        {
            return Self::Prefix(prefix);
        }
        if let Some(suffix) = pattern
            .strip_prefix('*')
            .filter(|s| s.starts_with('.') && !s.contains('*'))
        {
            return Self::Suffix(suffix);
        }
        Self::Exact(pattern)
    }

    /// Whether this names a single topic rather than a family of them
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(exact) => exact == topic,
            Self::Prefix(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix),
            Self::Suffix(suffix) => topic.len() > suffix.len() && topic.ends_with(suffix),
        }
    }
}

/// Whether `pattern` matches `topic`
pub fn matches(pattern: &str, topic: &str) -> bool {
    Pattern::parse(pattern).matches(topic)
}
