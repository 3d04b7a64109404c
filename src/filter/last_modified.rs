//! Last-Modified override filter.
//!
//! For eligible responses, backs `Last-Modified` (and optionally `ETag`) with
//! the metadata of a source file resolved from the scope's expression. The
//! timestamp only ever moves forward, and no failure here stops the chain.

use super::{compute_etag, FilterStatus, HeaderFilter};
use crate::context::{RequestContext, ResponseHeaders};
use crate::expression::{ExpressionError, SourceExpression};
use crate::file_cache::{FileMetadataCache, LookupError};
use crate::scope::ScopeConfig;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Header filter that overrides validators from a source file.
pub struct LastModifiedFilter {
    /// Shared file metadata cache
    cache: Arc<dyn FileMetadataCache>,
    /// Next stage in the chain
    next: Arc<dyn HeaderFilter>,
    /// Metrics: responses seen.
    requests_total: AtomicU64,
    /// Metrics: responses that passed the eligibility checks.
    requests_eligible: AtomicU64,
    /// Metrics: responses whose Last-Modified moved forward.
    headers_updated: AtomicU64,
    /// Metrics: ETags dropped because of `clear_etag`.
    etags_cleared: AtomicU64,
    /// Metrics: expression, lookup and not-a-file failures.
    failures: AtomicU64,
}

/// Snapshot of the filter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub requests_total: u64,
    pub requests_eligible: u64,
    pub headers_updated: u64,
    pub etags_cleared: u64,
    pub failures: u64,
}

/// Why a source lookup produced no update.
#[derive(Debug, thiserror::Error)]
enum SourceError {
    #[error("could not evaluate source expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("{} is not a file", .0.display())]
    NotAFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Updated,
    Stale,
}

impl LastModifiedFilter {
    /// Create the filter in front of `next`.
    pub fn new(cache: Arc<dyn FileMetadataCache>, next: Arc<dyn HeaderFilter>) -> Self {
        Self {
            cache,
            next,
            requests_total: AtomicU64::new(0),
            requests_eligible: AtomicU64::new(0),
            headers_updated: AtomicU64::new(0),
            etags_cleared: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_eligible: self.requests_eligible.load(Ordering::Relaxed),
            headers_updated: self.headers_updated.load(Ordering::Relaxed),
            etags_cleared: self.etags_cleared.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Return the source expression if this response should be processed.
    fn eligible<'a>(
        ctx: &RequestContext,
        scope: &'a ScopeConfig,
    ) -> Option<&'a SourceExpression> {
        if !scope.enabled {
            return None;
        }
        let source = scope.source.as_deref()?;
        if !ctx.main || !ctx.request.is_get_or_head() {
            return None;
        }
        Some(source)
    }

    /// Resolve the source file and move the validators forward if it is newer.
    fn update_headers(
        &self,
        ctx: &RequestContext,
        scope: &ScopeConfig,
        source: &SourceExpression,
        response: &mut ResponseHeaders,
    ) -> Result<Outcome, SourceError> {
        let relative = source.evaluate(ctx)?;

        let mut path = OsString::from(scope.root.as_os_str());
        path.push(&relative);
        let path = PathBuf::from(path);

        let attrs = self.cache.lookup(&path, &scope.hints)?;
        if !attrs.is_file {
            return Err(SourceError::NotAFile(path));
        }

        if !response.is_older_than(attrs.mtime) {
            trace!(
                correlation_id = %ctx.correlation_id,
                path = %path.display(),
                source_mtime = attrs.mtime,
                current = ?response.last_modified_time,
                "source is not newer than response"
            );
            return Ok(Outcome::Stale);
        }

        response.last_modified_time = Some(attrs.mtime);

        if !scope.clear_etag {
            if let Some(size) = attrs.size {
                response.etag = Some(compute_etag(size, attrs.mtime));
            }
        }

        debug!(
            correlation_id = %ctx.correlation_id,
            path = %path.display(),
            last_modified = attrs.mtime,
            etag = ?response.etag,
            "overrode validators from source file"
        );

        Ok(Outcome::Updated)
    }
}

impl HeaderFilter for LastModifiedFilter {
    fn on_response_headers(
        &self,
        ctx: &RequestContext,
        scope: &ScopeConfig,
        response: &mut ResponseHeaders,
    ) -> FilterStatus {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let Some(source) = Self::eligible(ctx, scope) else {
            trace!(
                correlation_id = %ctx.correlation_id,
                scope = %scope.name,
                "last_modified: passing response through"
            );
            return self.next.on_response_headers(ctx, scope, response);
        };

        self.requests_eligible.fetch_add(1, Ordering::Relaxed);

        if scope.clear_etag && response.etag.is_some() {
            response.clear_etag();
            self.etags_cleared.fetch_add(1, Ordering::Relaxed);
        }

        match self.update_headers(ctx, scope, source, response) {
            Ok(Outcome::Updated) => {
                self.headers_updated.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Outcome::Stale) => {}
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    correlation_id = %ctx.correlation_id,
                    scope = %scope.name,
                    source = %source,
                    error = %e,
                    "last_modified: source lookup failed"
                );
            }
        }

        self.next.on_response_headers(ctx, scope, response)
    }

    fn name(&self) -> &'static str {
        "last_modified"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestInfo;
    use crate::file_cache::{LookupHints, SourceFileAttributes};
    use crate::filter::Terminal;
    use crate::scope::ScopeSettings;
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    /// Cache answering from a fixed table and recording every lookup.
    #[derive(Default)]
    struct ScriptedCache {
        entries: HashMap<PathBuf, SourceFileAttributes>,
        lookups: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedCache {
        fn with(mut self, path: &str, attrs: SourceFileAttributes) -> Self {
            self.entries.insert(PathBuf::from(path), attrs);
            self
        }

        fn lookups(&self) -> Vec<PathBuf> {
            self.lookups.lock().unwrap().clone()
        }
    }

    impl FileMetadataCache for ScriptedCache {
        fn lookup(
            &self,
            path: &Path,
            _hints: &LookupHints,
        ) -> Result<SourceFileAttributes, LookupError> {
            self.lookups.lock().unwrap().push(path.to_path_buf());
            self.entries
                .get(path)
                .copied()
                .ok_or_else(|| LookupError::Open {
                    path: path.to_path_buf(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                })
        }
    }

    /// Next stage that records what it was handed.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ResponseHeaders>>,
    }

    impl HeaderFilter for Recorder {
        fn on_response_headers(
            &self,
            _ctx: &RequestContext,
            _scope: &ScopeConfig,
            response: &mut ResponseHeaders,
        ) -> FilterStatus {
            self.seen.lock().unwrap().push(response.clone());
            FilterStatus::Ok
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn file(mtime: i64, size: u64) -> SourceFileAttributes {
        SourceFileAttributes {
            is_file: true,
            mtime,
            size: Some(size),
        }
    }

    fn scope(
        enabled: Option<bool>,
        source: Option<&str>,
        clear_etag: Option<bool>,
    ) -> ScopeConfig {
        let mut settings = ScopeSettings {
            enabled,
            source: source.map(|s| Arc::new(SourceExpression::compile(s).unwrap())),
            clear_etag,
            root: Some(PathBuf::from("/var/www")),
            ..ScopeSettings::new()
        };
        settings.merge(&ScopeSettings::new());
        settings.resolve("test")
    }

    fn get(path: &str) -> RequestContext {
        RequestContext::new(RequestInfo::new("GET", path), "test")
    }

    fn served() -> ResponseHeaders {
        ResponseHeaders::new(200)
            .with_last_modified(500)
            .with_etag("\"abc\"")
            .with_content_length(1234)
    }

    fn setup(cache: ScriptedCache) -> (Arc<ScriptedCache>, Arc<Recorder>, LastModifiedFilter) {
        let cache = Arc::new(cache);
        let recorder = Arc::new(Recorder::default());
        let filter = LastModifiedFilter::new(cache.clone(), recorder.clone());
        (cache, recorder, filter)
    }

    #[test]
    fn test_refreshes_etag_from_source() {
        let (_, recorder, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(false));
        let mut response = served();

        let status = filter.on_response_headers(&get("/app"), &scope, &mut response);

        assert_eq!(status, FilterStatus::Ok);
        assert_eq!(response.last_modified_time, Some(1000));
        assert_eq!(response.etag.as_deref(), Some(compute_etag(42, 1000).as_str()));
        assert_eq!(response.content_length, Some(1234));
        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[response.clone()]);
        assert_eq!(filter.stats().headers_updated, 1);
    }

    #[test]
    fn test_clears_etag_by_default() {
        let (_, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), None);
        let mut response = served();

        filter.on_response_headers(&get("/app"), &scope, &mut response);

        assert_eq!(response.last_modified_time, Some(1000));
        assert_eq!(response.etag, None);
        assert_eq!(filter.stats().etags_cleared, 1);
    }

    #[test]
    fn test_clearing_is_idempotent() {
        let (_, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(true));

        let mut once = served();
        filter.on_response_headers(&get("/"), &scope, &mut once);
        let mut twice = once.clone();
        filter.on_response_headers(&get("/"), &scope, &mut twice);

        assert_eq!(once, twice);
        assert_eq!(twice.etag, None);
    }

    #[test]
    fn test_stale_source_leaves_headers() {
        let (_, recorder, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(false));
        let mut response = served().with_last_modified(2000);
        let before = response.clone();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response, before);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(filter.stats().headers_updated, 0);
    }

    #[test]
    fn test_equal_mtime_is_not_an_update() {
        let (_, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(500, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(false));
        let mut response = served();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response.etag.as_deref(), Some("\"abc\""));
    }

    #[test]
    fn test_unset_last_modified_is_updated() {
        let (_, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(0, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(false));
        let mut response = ResponseHeaders::new(200);

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response.last_modified_time, Some(0));
        assert_eq!(response.etag, Some(compute_etag(42, 0)));
    }

    #[test]
    fn test_not_a_file() {
        let cache = ScriptedCache::default().with(
            "/var/www/assets",
            SourceFileAttributes {
                is_file: false,
                mtime: 9000,
                size: None,
            },
        );
        let (_, recorder, filter) = setup(cache);
        let scope = scope(Some(true), Some("/assets"), Some(true));
        let mut response = served();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response.last_modified_time, Some(500));
        assert_eq!(response.etag, None);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(filter.stats().failures, 1);
    }

    #[test]
    fn test_lookup_failure_keeps_etag_when_refreshing() {
        let (cache, recorder, filter) = setup(ScriptedCache::default());
        let scope = scope(Some(true), Some("/missing.json"), Some(false));
        let mut response = served();
        let before = response.clone();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response, before);
        assert_eq!(cache.lookups(), vec![PathBuf::from("/var/www/missing.json")]);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(filter.stats().failures, 1);
    }

    #[test]
    fn test_expression_failure_skips_lookup() {
        let (cache, recorder, filter) = setup(ScriptedCache::default());
        let scope = scope(Some(true), Some("/${request.header.x-source}"), Some(true));
        let mut response = served();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert!(cache.lookups().is_empty());
        // Clearing happens before the expression is evaluated.
        assert_eq!(response.etag, None);
        assert_eq!(response.last_modified_time, Some(500));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_passes_through() {
        let (cache, recorder, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(false), Some("/manifest.json"), Some(true));
        let mut response = served();
        let before = response.clone();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response, before);
        assert!(cache.lookups().is_empty());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(filter.stats().requests_eligible, 0);
    }

    #[test]
    fn test_enabled_without_source_passes_through() {
        let (cache, _, filter) = setup(ScriptedCache::default());
        let scope = scope(Some(true), None, Some(true));
        let mut response = served();
        let before = response.clone();

        filter.on_response_headers(&get("/"), &scope, &mut response);

        assert_eq!(response, before);
        assert!(cache.lookups().is_empty());
    }

    #[test]
    fn test_subrequest_passes_through() {
        let (cache, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(true));
        let mut response = served();
        let before = response.clone();

        filter.on_response_headers(&get("/").into_subrequest(), &scope, &mut response);

        assert_eq!(response, before);
        assert!(cache.lookups().is_empty());
    }

    #[test]
    fn test_method_filter() {
        let (cache, _, filter) =
            setup(ScriptedCache::default().with("/var/www/manifest.json", file(1000, 42)));
        let scope = scope(Some(true), Some("/manifest.json"), Some(false));

        for method in ["POST", "PUT", "DELETE", "OPTIONS"] {
            let ctx = RequestContext::new(RequestInfo::new(method, "/"), "test");
            let mut response = served();
            let before = response.clone();
            filter.on_response_headers(&ctx, &scope, &mut response);
            assert_eq!(response, before, "{method} must not be modified");
        }
        assert!(cache.lookups().is_empty());

        let ctx = RequestContext::new(RequestInfo::new("HEAD", "/"), "test");
        let mut response = served();
        filter.on_response_headers(&ctx, &scope, &mut response);
        assert_eq!(response.last_modified_time, Some(1000));
        assert_eq!(response.etag, Some(compute_etag(42, 1000)));
    }

    #[test]
    fn test_path_is_concatenated_not_joined() {
        let (cache, _, filter) = setup(ScriptedCache::default());
        let scope = scope(Some(true), Some("${request.path}.meta"), Some(true));
        let mut response = served();

        filter.on_response_headers(&get("/reports/q3"), &scope, &mut response);

        assert_eq!(cache.lookups(), vec![PathBuf::from("/var/www/reports/q3.meta")]);
    }

    #[test]
    fn test_returns_next_stage_status() {
        struct Failing;
        impl HeaderFilter for Failing {
            fn on_response_headers(
                &self,
                _ctx: &RequestContext,
                _scope: &ScopeConfig,
                _response: &mut ResponseHeaders,
            ) -> FilterStatus {
                FilterStatus::Error
            }
            fn name(&self) -> &'static str {
                "failing"
            }
        }

        let filter = LastModifiedFilter::new(Arc::new(ScriptedCache::default()), Arc::new(Failing));
        let scope = scope(Some(true), Some("/x"), None);
        let mut response = served();
        assert_eq!(
            filter.on_response_headers(&get("/"), &scope, &mut response),
            FilterStatus::Error
        );

        let filter =
            LastModifiedFilter::new(Arc::new(ScriptedCache::default()), Arc::new(Terminal));
        assert_eq!(
            filter.on_response_headers(&get("/"), &scope, &mut response),
            FilterStatus::Ok
        );
    }
}
