//! Scope routing plus the header filter chain.

use crate::config::{ConfigError, FilterConfig};
use crate::context::{RequestContext, ResponseHeaders};
use crate::file_cache::{CacheStats, FileMetadataCache, OpenFileCache};
use crate::filter::{FilterStats, FilterStatus, HeaderFilter, LastModifiedFilter, Terminal};
use crate::scope::ScopeTree;
use std::sync::Arc;
use tracing::info;

/// Routes each response to its scope and runs it through the filter chain.
pub struct HeaderPipeline {
    /// Built scope hierarchy
    scopes: ScopeTree,
    /// Head of the chain
    filter: Arc<LastModifiedFilter>,
    /// Shared cache, when owned by this pipeline
    open_file_cache: Option<Arc<OpenFileCache>>,
}

impl HeaderPipeline {
    /// Build a pipeline with an [`OpenFileCache`] and a terminal next stage.
    pub fn new(config: &FilterConfig) -> Result<Self, ConfigError> {
        let cache = Arc::new(OpenFileCache::new(
            config.settings.open_file_cache.max_entries,
        ));
        let mut pipeline = Self::with_stages(config, cache.clone(), Arc::new(Terminal))?;
        pipeline.open_file_cache = Some(cache);
        Ok(pipeline)
    }

    /// Build a pipeline around caller-provided collaborators.
    pub fn with_stages(
        config: &FilterConfig,
        cache: Arc<dyn FileMetadataCache>,
        next: Arc<dyn HeaderFilter>,
    ) -> Result<Self, ConfigError> {
        let scopes = ScopeTree::build(config)?;

        info!(
            scopes = scopes.scopes().len(),
            next = next.name(),
            "Last-Modified filter initialized"
        );

        Ok(Self {
            scopes,
            filter: Arc::new(LastModifiedFilter::new(cache, next)),
            open_file_cache: None,
        })
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::new(&FilterConfig::from_yaml(yaml)?)
    }

    /// Create from a JSON configuration string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::new(&FilterConfig::from_json(json)?)
    }

    /// The built scope hierarchy.
    pub fn scopes(&self) -> &ScopeTree {
        &self.scopes
    }

    /// Run one response through the chain.
    pub fn process(&self, ctx: RequestContext, response: &mut ResponseHeaders) -> FilterStatus {
        let selected = self.scopes.select(&ctx.request.path);
        let ctx = ctx.with_captures(selected.captures);
        self.filter
            .on_response_headers(&ctx, &selected.scope, response)
    }

    /// Filter counters.
    pub fn stats(&self) -> FilterStats {
        self.filter.stats()
    }

    /// Cache counters, if the pipeline owns its cache.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.open_file_cache.as_ref().map(|c| c.stats())
    }
}
