// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Include/exclude topic filter.
//!
//! Applied to topic names before a registration reaches matching or any
//! observer. Precedence:
//!
//! 1. exclude matches -> reject
//! 2. include non-empty and does not match -> reject
//! 3. otherwise accept
//!
//! Empty patterns are "not set", so two empty patterns accept everything.

use regex::Regex;
use std::fmt;

/// Compiled include/exclude pair.
#[derive(Clone, Default)]
pub struct TopicFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl TopicFilter {
    /// Compile a filter. Empty strings disable the corresponding pattern.
    pub fn new(include: &str, exclude: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Filter that accepts every topic.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Decide whether `topic` is surfaced.
    pub fn accepts(&self, topic: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(topic) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(topic),
            None => true,
        }
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.is_empty() {
        Ok(None)
    } else {
        Regex::new(pattern).map(Some)
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicFilter")
            .field("include", &self.include.as_ref().map(Regex::as_str))
            .field("exclude", &self.exclude.as_ref().map(Regex::as_str))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPICS: [&str; 4] = ["topic_1", "topic_2", "apple", "__internal"];

    fn verdicts(filter: &TopicFilter) -> Vec<bool> {
        TOPICS.iter().map(|t| filter.accepts(t)).collect()
    }

    #[test]
    fn test_both_empty_accepts_all() {
        assert_eq!(
            verdicts(&TopicFilter::accept_all()),
            vec![true, true, true, true]
        );
    }

    #[test]
    fn test_exclude_only() {
        let filter = TopicFilter::new("", "^__.*$").expect("valid");
        assert_eq!(verdicts(&filter), vec![true, true, true, false]);
    }

    #[test]
    fn test_include_only() {
        let filter = TopicFilter::new("^topic_", "").expect("valid");
        assert_eq!(verdicts(&filter), vec![true, true, false, false]);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = TopicFilter::new("^topic_", "_2$").expect("valid");
        assert_eq!(verdicts(&filter), vec![true, false, false, false]);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(TopicFilter::new("(", "").is_err());
        assert!(TopicFilter::new("", "[").is_err());
    }
}
