//! Key/value filters for cursors.
//!
//! A filter is a byte regex compiled once when the iterator options are
//! built. A leading `(?i)` in the pattern (or `Filter::case_insensitive`)
//! makes the match case-insensitive.

use regex::bytes::{Regex, RegexBuilder};

use crate::error::{Error, Result};

const CASE_INSENSITIVE_MARKER: &str = "(?i)";

#[derive(Clone, Debug)]
pub struct Filter {
    pattern: String,
    case_insensitive: bool,
    regex: Regex,
}

impl Filter {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        match pattern.strip_prefix(CASE_INSENSITIVE_MARKER) {
            Some(rest) => {
                let rest = rest.to_string();
                Self::build(rest, true)
            }
            None => Self::build(pattern, false),
        }
    }

    pub fn case_insensitive(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let body = pattern
            .strip_prefix(CASE_INSENSITIVE_MARKER)
            .map(str::to_string)
            .unwrap_or(pattern);
        Self::build(body, true)
    }

    fn build(pattern: String, case_insensitive: bool) -> Result<Self> {
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|cause| Error::InvalidFilter {
                pattern: pattern.clone(),
                cause,
            })?;
        Ok(Self {
            pattern,
            case_insensitive,
            regex,
        })
    }

    /// Pattern without the case-insensitive marker.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    #[inline]
    pub fn is_match(&self, bytes: &[u8]) -> bool {
        self.regex.is_match(bytes)
    }
}

/// Key and value predicates applied to a row after range scanning.
#[derive(Clone, Debug, Default)]
pub struct RowFilter {
    pub key: Option<Filter>,
    pub value: Option<Filter>,
}

impl RowFilter {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }

    #[inline]
    pub fn matches(&self, key: &[u8], value: &[u8]) -> bool {
        self.key.as_ref().map_or(true, |f| f.is_match(key))
            && self.value.as_ref().map_or(true, |f| f.is_match(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_enables_case_insensitive_match() {
        let f = Filter::new("(?i)^USER:").unwrap();
        assert!(f.is_case_insensitive());
        assert_eq!(f.pattern(), "^USER:");
        assert!(f.is_match(b"user:1"));
        assert!(!f.is_match(b"post:1"));

        let strict = Filter::new("^USER:").unwrap();
        assert!(!strict.is_match(b"user:1"));
    }

    #[test]
    fn row_filter_requires_both_predicates() {
        let rf = RowFilter {
            key: Some(Filter::new("^log:").unwrap()),
            value: Some(Filter::new("^error:").unwrap()),
        };
        assert!(rf.matches(b"log:error:1", b"error: disk full"));
        assert!(!rf.matches(b"log:info:1", b"info: started"));
        assert!(!rf.matches(b"user:1", b"error: nope"));
        assert!(RowFilter::default().matches(b"anything", b""));
    }

    #[test]
    fn bad_pattern_is_reported_with_code() {
        let err = Filter::new("(unclosed").unwrap_err();
        assert_eq!(err.code(), "LEVEL_INVALID_FILTER");
    }
}
