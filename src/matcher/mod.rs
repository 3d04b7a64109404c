//! Location matchers used to route a request to its scope.

mod path;

pub use path::LocationMatcher;

use std::collections::HashMap;

/// Result of a match operation.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Whether the match succeeded
    pub matched: bool,
    /// Captured groups (from regex matching)
    pub captures: HashMap<String, String>,
}

impl MatchResult {
    /// Create a successful match result.
    pub fn matched() -> Self {
        Self {
            matched: true,
            captures: HashMap::new(),
        }
    }

    /// Create a successful match result with captures.
    pub fn matched_with_captures(captures: HashMap<String, String>) -> Self {
        Self {
            matched: true,
            captures,
        }
    }

    /// Create a failed match result.
    pub fn not_matched() -> Self {
        Self {
            matched: false,
            captures: HashMap::new(),
        }
    }
}

/// Errors that can occur during matcher compilation.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(#[from] glob::PatternError),
}
