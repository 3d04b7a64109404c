//! Path matching implementation.

use super::{MatchResult, MatcherError};
use crate::config::{LocationPattern, PatternType};
use glob::Pattern as GlobPattern;
use regex::Regex;
use std::collections::HashMap;

/// Compiled location matcher.
#[derive(Debug)]
pub enum LocationMatcher {
    /// Exact string match
    Exact(String),
    /// Path prefix match
    Prefix(String),
    /// Glob pattern match
    Glob(GlobPattern),
    /// Regex pattern match
    Regex(Regex),
}

impl LocationMatcher {
    /// Compile a location matcher from configuration.
    pub fn compile(config: &LocationPattern) -> Result<Self, MatcherError> {
        match config.pattern_type {
            PatternType::Exact => Ok(Self::Exact(config.pattern.clone())),
            PatternType::Prefix => Ok(Self::Prefix(config.pattern.clone())),
            PatternType::Glob => {
                let pattern = GlobPattern::new(&config.pattern)?;
                Ok(Self::Glob(pattern))
            }
            PatternType::Regex => {
                let regex = Regex::new(&config.pattern)?;
                Ok(Self::Regex(regex))
            }
        }
    }

    /// Match a request path.
    pub fn matches(&self, path: &str) -> MatchResult {
        let matched = match self {
            Self::Exact(pattern) => path == pattern,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches(path),
            Self::Regex(regex) => {
                return match regex.captures(path) {
                    Some(caps) => {
                        MatchResult::matched_with_captures(Self::extract_captures(regex, &caps))
                    }
                    None => MatchResult::not_matched(),
                };
            }
        };

        if matched {
            MatchResult::matched()
        } else {
            MatchResult::not_matched()
        }
    }

    /// Collect numbered and named captures.
    fn extract_captures(regex: &Regex, caps: &regex::Captures<'_>) -> HashMap<String, String> {
        let mut captures = HashMap::new();

        for (i, m) in caps.iter().enumerate() {
            if let Some(m) = m {
                captures.insert(i.to_string(), m.as_str().to_string());
            }
        }

        for name in regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                captures.insert(name.to_string(), m.as_str().to_string());
            }
        }

        captures
    }
}
