//! Configuration types for the Last-Modified filter.

use crate::expression::ExpressionError;
use crate::matcher::MatcherError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Configuration version
    pub version: String,
    /// Global settings
    pub settings: Settings,
    /// Top-level scopes (virtual hosts). Each may nest `locations`.
    pub scopes: Vec<ScopeDirectives>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: Settings::default(),
            scopes: vec![],
        }
    }
}

impl FilterConfig {
    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a configuration file, picking the format from its extension.
    ///
    /// `.yaml` and `.yml` are read as YAML, everything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            Self::from_yaml(&content)
        } else {
            Self::from_json(&content)
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Shared file-metadata cache
    pub open_file_cache: OpenFileCacheSettings,
}

/// Sizing of the shared file-metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFileCacheSettings {
    /// Maximum number of cached paths
    pub max_entries: usize,
}

impl Default for OpenFileCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
        }
    }
}

/// Directives attached to one scope.
///
/// Every directive is optional; unset values are inherited from the
/// enclosing scope when the scope tree is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeDirectives {
    /// Scope name (for logging/debugging)
    #[serde(default)]
    pub name: String,
    /// Location pattern. Top-level scopes may omit it and match everything.
    #[serde(default, rename = "match")]
    pub location: Option<LocationPattern>,
    /// Turns the rewrite on or off
    #[serde(default)]
    pub last_modified_override: Option<bool>,
    /// Source path expression, relative to `root`
    #[serde(default)]
    pub last_modified_source: Option<String>,
    /// Drop the ETag instead of refreshing it
    #[serde(default)]
    pub last_modified_clear_etag: Option<bool>,
    /// Document root the source path is appended to
    #[serde(default)]
    pub root: Option<String>,
    /// How long a cached lookup stays valid (seconds)
    #[serde(default)]
    pub open_file_cache_valid_secs: Option<u64>,
    /// Whether failed lookups are cached too
    #[serde(default)]
    pub open_file_cache_errors: Option<bool>,
    /// Symlink policy applied to source paths
    #[serde(default)]
    pub disable_symlinks: Option<SymlinkPolicy>,
    /// Nested scopes
    #[serde(default)]
    pub locations: Vec<ScopeDirectives>,
}

/// Location pattern configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPattern {
    /// The pattern to match against the request path
    pub pattern: String,
    /// Match type: exact, prefix, glob, regex
    #[serde(default, rename = "type")]
    pub pattern_type: PatternType,
}

/// Pattern matching type.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact string match
    Exact,
    /// Path prefix match
    #[default]
    Prefix,
    /// Glob pattern (*, ?)
    Glob,
    /// Regular expression
    Regex,
}

/// Symlink handling for source file lookups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Follow symlinks
    #[default]
    Off,
    /// Refuse any path with a symlink component
    On,
    /// Refuse symlinks whose owner differs from the target's owner
    IfNotOwner,
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scope '{scope}': invalid last_modified_source: {source}")]
    Expression {
        scope: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Scope '{scope}': invalid location pattern: {source}")]
    Location {
        scope: String,
        #[source]
        source: MatcherError,
    },
}
