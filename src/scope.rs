//! Scope settings, inheritance, and request routing.
//!
//! Directives are tri-state while the configuration is being built: a scope
//! either sets a value or leaves it to its parent. [`ScopeSettings::merge`]
//! runs once per scope, parent first, and [`ScopeSettings::resolve`] turns
//! the merged settings into the plain [`ScopeConfig`] read at request time.

use crate::config::{ConfigError, FilterConfig, ScopeDirectives, SymlinkPolicy};
use crate::expression::SourceExpression;
use crate::file_cache::LookupHints;
use crate::matcher::LocationMatcher;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_ROOT: &str = "html";
const DEFAULT_CACHE_VALID: Duration = Duration::from_secs(60);

/// Unmerged settings of one scope. `None` means "not set here".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSettings {
    pub enabled: Option<bool>,
    pub source: Option<Arc<SourceExpression>>,
    pub clear_etag: Option<bool>,
    pub root: Option<PathBuf>,
    pub cache_valid: Option<Duration>,
    pub cache_errors: Option<bool>,
    pub symlinks: Option<SymlinkPolicy>,
}

impl ScopeSettings {
    /// Settings with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the directives of one scope, compiling its source expression.
    pub fn from_directives(directives: &ScopeDirectives) -> Result<Self, ConfigError> {
        let source = directives
            .last_modified_source
            .as_deref()
            .map(SourceExpression::compile)
            .transpose()
            .map_err(|source| ConfigError::Expression {
                scope: directives.name.clone(),
                source,
            })?
            .map(Arc::new);

        Ok(Self {
            enabled: directives.last_modified_override,
            source,
            clear_etag: directives.last_modified_clear_etag,
            root: directives.root.as_ref().map(PathBuf::from),
            cache_valid: directives
                .open_file_cache_valid_secs
                .map(Duration::from_secs),
            cache_errors: directives.open_file_cache_errors,
            symlinks: directives.disable_symlinks,
        })
    }

    /// Fill unset fields from `parent`, falling back to the defaults.
    ///
    /// `enabled` defaults to false and `clear_etag` to true. A source set on
    /// this scope is never replaced by the parent's.
    pub fn merge(&mut self, parent: &ScopeSettings) {
        self.enabled = Some(self.enabled.or(parent.enabled).unwrap_or(false));
        if self.source.is_none() {
            self.source = parent.source.clone();
        }
        self.clear_etag = Some(self.clear_etag.or(parent.clear_etag).unwrap_or(true));

        self.root = Some(
            self.root
                .take()
                .or_else(|| parent.root.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)),
        );
        self.cache_valid = Some(
            self.cache_valid
                .or(parent.cache_valid)
                .unwrap_or(DEFAULT_CACHE_VALID),
        );
        self.cache_errors = Some(self.cache_errors.or(parent.cache_errors).unwrap_or(false));
        self.symlinks = Some(self.symlinks.or(parent.symlinks).unwrap_or_default());
    }

    /// Produce the request-time view of these settings.
    pub fn resolve(&self, name: impl Into<String>) -> ScopeConfig {
        ScopeConfig {
            name: name.into(),
            enabled: self.enabled.unwrap_or(false),
            source: self.source.clone(),
            clear_etag: self.clear_etag.unwrap_or(true),
            root: self
                .root
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)),
            hints: LookupHints {
                valid: self.cache_valid.unwrap_or(DEFAULT_CACHE_VALID),
                cache_errors: self.cache_errors.unwrap_or(false),
                symlinks: self.symlinks.unwrap_or_default(),
            },
        }
    }
}

/// Resolved settings of one scope, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeConfig {
    /// Scope name (for logging/debugging)
    pub name: String,
    /// Whether the rewrite is on
    pub enabled: bool,
    /// Source path expression
    pub source: Option<Arc<SourceExpression>>,
    /// Drop the ETag instead of refreshing it
    pub clear_etag: bool,
    /// Document root the evaluated source is appended to
    pub root: PathBuf,
    /// Parameters passed to the file metadata cache
    pub hints: LookupHints,
}

impl ScopeConfig {
    /// A scope with every setting at its default.
    pub fn disabled(name: impl Into<String>) -> Self {
        let mut settings = ScopeSettings::new();
        settings.merge(&ScopeSettings::new());
        settings.resolve(name)
    }
}

/// The scope a request was routed to.
#[derive(Debug, Clone)]
pub struct ScopeMatch {
    pub scope: Arc<ScopeConfig>,
    /// Captures collected from every matched location
    pub captures: HashMap<String, String>,
}

fn is_numbered(name: &str) -> bool {
    name.bytes().all(|b| b.is_ascii_digit())
}

/// Built scope hierarchy.
#[derive(Debug)]
pub struct ScopeTree {
    root: ScopeNode,
}

#[derive(Debug)]
struct ScopeNode {
    config: Arc<ScopeConfig>,
    matcher: Option<LocationMatcher>,
    children: Vec<ScopeNode>,
}

impl ScopeTree {
    /// Merge and compile every scope in the configuration.
    ///
    /// The configured top-level scopes hang off an implicit `main` scope with
    /// every directive unset.
    pub fn build(config: &FilterConfig) -> Result<Self, ConfigError> {
        let mut main = ScopeSettings::new();
        main.merge(&ScopeSettings::new());

        let children = config
            .scopes
            .iter()
            .map(|d| ScopeNode::build(d, &main))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: ScopeNode {
                config: Arc::new(main.resolve("main")),
                matcher: None,
                children,
            },
        })
    }

    /// Route a request path to the deepest matching scope.
    ///
    /// At each level the first matching child wins; a child without a
    /// location pattern matches everything. Named captures accumulate down
    /// the tree, numbered captures come from the innermost regex match only.
    pub fn select(&self, path: &str) -> ScopeMatch {
        let mut node = &self.root;
        let mut captures = HashMap::new();

        'descend: loop {
            for child in &node.children {
                let result = match &child.matcher {
                    Some(matcher) => matcher.matches(path),
                    None => crate::matcher::MatchResult::matched(),
                };
                if result.matched {
                    if matches!(child.matcher, Some(LocationMatcher::Regex(_))) {
                        captures.retain(|name: &String, _| !is_numbered(name));
                    }
                    captures.extend(result.captures);
                    node = child;
                    continue 'descend;
                }
            }
            break;
        }

        debug!(path, scope = %node.config.name, "selected scope");

        ScopeMatch {
            scope: Arc::clone(&node.config),
            captures,
        }
    }

    /// Every scope in depth-first order, with its nesting depth.
    pub fn scopes(&self) -> Vec<(usize, Arc<ScopeConfig>)> {
        let mut out = Vec::new();
        self.root.collect(0, &mut out);
        out
    }
}

impl ScopeNode {
    fn build(directives: &ScopeDirectives, parent: &ScopeSettings) -> Result<Self, ConfigError> {
        let mut settings = ScopeSettings::from_directives(directives)?;
        settings.merge(parent);

        let matcher = directives
            .location
            .as_ref()
            .map(LocationMatcher::compile)
            .transpose()
            .map_err(|source| ConfigError::Location {
                scope: directives.name.clone(),
                source,
            })?;

        let children = directives
            .locations
            .iter()
            .map(|d| Self::build(d, &settings))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config: Arc::new(settings.resolve(directives.name.clone())),
            matcher,
            children,
        })
    }

    fn collect(&self, depth: usize, out: &mut Vec<(usize, Arc<ScopeConfig>)>) {
        out.push((depth, Arc::clone(&self.config)));
        for child in &self.children {
            child.collect(depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(text: &str) -> Option<Arc<SourceExpression>> {
        Some(Arc::new(SourceExpression::compile(text).unwrap()))
    }

    #[test]
    fn test_new_settings_are_unset() {
        let settings = ScopeSettings::new();
        assert_eq!(settings.enabled, None);
        assert_eq!(settings.source, None);
        assert_eq!(settings.clear_etag, None);
    }

    #[test]
    fn test_merge_defaults() {
        let mut child = ScopeSettings::new();
        child.merge(&ScopeSettings::new());

        assert_eq!(child.enabled, Some(false));
        assert_eq!(child.clear_etag, Some(true));
        assert_eq!(child.source, None);
        assert_eq!(child.root, Some(PathBuf::from("html")));
        assert_eq!(child.symlinks, Some(SymlinkPolicy::Off));
    }

    #[test]
    fn test_merge_inherits_unset_fields() {
        let parent = ScopeSettings {
            enabled: Some(true),
            source: expr("/parent.json"),
            clear_etag: Some(false),
            root: Some(PathBuf::from("/srv")),
            ..ScopeSettings::new()
        };

        let mut child = ScopeSettings::new();
        child.merge(&parent);

        assert_eq!(child.enabled, Some(true));
        assert_eq!(child.clear_etag, Some(false));
        assert_eq!(child.source, expr("/parent.json"));
        assert_eq!(child.root, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_merge_keeps_explicit_child_values() {
        let parent = ScopeSettings {
            enabled: Some(true),
            source: expr("/parent.json"),
            clear_etag: Some(false),
            ..ScopeSettings::new()
        };

        let mut child = ScopeSettings {
            enabled: Some(false),
            source: expr("/child.json"),
            clear_etag: Some(true),
            ..ScopeSettings::new()
        };
        child.merge(&parent);

        assert_eq!(child.enabled, Some(false));
        assert_eq!(child.clear_etag, Some(true));
        assert_eq!(child.source, expr("/child.json"));
    }

    #[test]
    fn test_resolve() {
        let mut settings = ScopeSettings {
            enabled: Some(true),
            source: expr("/a"),
            cache_valid: Some(Duration::from_secs(5)),
            cache_errors: Some(true),
            ..ScopeSettings::new()
        };
        settings.merge(&ScopeSettings::new());

        let config = settings.resolve("site");
        assert_eq!(config.name, "site");
        assert!(config.enabled);
        assert!(config.clear_etag);
        assert_eq!(config.hints.valid, Duration::from_secs(5));
        assert!(config.hints.cache_errors);
    }

    #[test]
    fn test_disabled_scope() {
        let config = ScopeConfig::disabled("none");
        assert!(!config.enabled);
        assert!(config.source.is_none());
        assert!(config.clear_etag);
    }

    fn tree(yaml: &str) -> ScopeTree {
        ScopeTree::build(&FilterConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_select_deepest_scope() {
        let tree = tree(
            r#"
scopes:
  - name: "site"
    root: "/var/www"
    last_modified_override: true
    last_modified_source: "/manifest.json"
    locations:
      - name: "docs"
        match: { pattern: "^/docs/(?P<version>v\\d+)/", type: regex }
        last_modified_source: "/docs/${version}/index.json"
        locations:
          - name: "docs-legacy"
            match: { pattern: "/docs/v1/legacy/", type: prefix }
            last_modified_override: false
      - name: "static"
        match: { pattern: "/static/" }
"#,
        );

        let selected = tree.select("/index.html");
        assert_eq!(selected.scope.name, "site");

        let selected = tree.select("/docs/v2/intro");
        assert_eq!(selected.scope.name, "docs");
        assert!(selected.scope.enabled);
        assert_eq!(selected.scope.root, PathBuf::from("/var/www"));
        assert_eq!(selected.captures.get("version"), Some(&"v2".to_string()));
        assert_eq!(
            selected.scope.source.as_ref().unwrap().as_str(),
            "/docs/${version}/index.json"
        );

        let selected = tree.select("/docs/v1/legacy/page");
        assert_eq!(selected.scope.name, "docs-legacy");
        assert!(!selected.scope.enabled);
        // Captures from the enclosing regex location are kept.
        assert_eq!(selected.captures.get("version"), Some(&"v1".to_string()));
        assert_eq!(
            selected.scope.source.as_ref().unwrap().as_str(),
            "/docs/${version}/index.json"
        );

        let selected = tree.select("/static/app.js");
        assert_eq!(selected.scope.name, "static");
        assert_eq!(
            selected.scope.source.as_ref().unwrap().as_str(),
            "/manifest.json"
        );
    }

    #[test]
    fn test_nested_regex_resets_numbered_captures() {
        let tree = tree(
            r#"
scopes:
  - name: "assets"
    match: { pattern: '^/assets/(?P<bundle>\w+)/(\w+)/', type: regex }
    last_modified_source: "/${bundle}/${2}.json"
    locations:
      - name: "images"
        match: { pattern: '/(\w+)\.png$', type: regex }
      - name: "fonts"
        match: { pattern: "/fonts/", type: prefix }
"#,
        );

        let selected = tree.select("/assets/app/v3/");
        assert_eq!(selected.scope.name, "assets");
        assert_eq!(selected.captures.get("2"), Some(&"v3".to_string()));

        let selected = tree.select("/assets/app/v3/logo.png");
        assert_eq!(selected.scope.name, "images");
        assert_eq!(selected.captures.get("1"), Some(&"logo".to_string()));
        assert_eq!(selected.captures.get("2"), None);
        assert_eq!(selected.captures.get("bundle"), Some(&"app".to_string()));

        // A non-regex location keeps the enclosing numbered captures.
        let selected = tree.select("/assets/app/v3/fonts/a.woff");
        assert_eq!(selected.scope.name, "fonts");
        assert_eq!(selected.captures.get("2"), Some(&"v3".to_string()));
    }

    #[test]
    fn test_select_without_scopes_falls_back_to_main() {
        let tree = ScopeTree::build(&FilterConfig::default()).unwrap();
        let selected = tree.select("/anything");
        assert_eq!(selected.scope.name, "main");
        assert!(!selected.scope.enabled);
    }

    #[test]
    fn test_first_matching_top_level_scope_wins() {
        let tree = tree(
            r#"
scopes:
  - name: "api"
    match: { pattern: "/api/" }
    last_modified_override: true
  - name: "default"
"#,
        );
        assert_eq!(tree.select("/api/users").scope.name, "api");
        assert_eq!(tree.select("/home").scope.name, "default");
    }

    #[test]
    fn test_scopes_listing() {
        let tree = tree(
            r#"
scopes:
  - name: "site"
    locations:
      - name: "a"
        match: { pattern: "/a" }
"#,
        );
        let names: Vec<_> = tree
            .scopes()
            .into_iter()
            .map(|(depth, s)| (depth, s.name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                (0, "main".to_string()),
                (1, "site".to_string()),
                (2, "a".to_string())
            ]
        );
    }

    #[test]
    fn test_build_rejects_bad_expression() {
        let config = FilterConfig::from_yaml(
            r#"
scopes:
  - name: "broken"
    last_modified_source: "/x/${request.body}"
"#,
        )
        .unwrap();
        let err = ScopeTree::build(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Expression { ref scope, .. } if scope == "broken"));
    }

    #[test]
    fn test_build_rejects_bad_location() {
        let config = FilterConfig::from_yaml(
            r#"
scopes:
  - name: "broken"
    match: { pattern: "(", type: regex }
"#,
        )
        .unwrap();
        assert!(matches!(
            ScopeTree::build(&config),
            Err(ConfigError::Location { .. })
        ));
    }
}
