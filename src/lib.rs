//! Last-Modified override filter.
//!
//! A response header filter that backs the `Last-Modified` and `ETag`
//! validators of a response with the metadata of a *different* file, the
//! "source" file, resolved per request from a configured expression:
//!
//! - Per-scope settings with parent inheritance (enable, source, clear-etag)
//! - Location routing with regex captures usable in the source expression
//! - Cached, symlink-aware file metadata lookups
//! - Forward-only `Last-Modified` updates, ETag clearing or regeneration
//! - Never breaks the filter chain: every failure degrades to pass-through
//!
//! ## Configuration Example
//!
//! ```yaml
//! scopes:
//!   - name: "site"
//!     root: "/var/www"
//!     last_modified_override: true
//!     last_modified_source: "/build/manifest.json"
//!     locations:
//!       - name: "docs"
//!         match: { pattern: "^/docs/(?P<version>v\\d+)/", type: regex }
//!         last_modified_source: "/docs/${version}/index.json"
//!         last_modified_clear_etag: false
//! ```

pub mod config;
pub mod context;
pub mod expression;
pub mod file_cache;
pub mod filter;
pub mod matcher;
pub mod pipeline;
pub mod scope;

pub use config::{ConfigError, FilterConfig};
pub use context::{RequestContext, RequestInfo, ResponseHeaders};
pub use expression::SourceExpression;
pub use file_cache::{FileMetadataCache, LookupError, LookupHints, OpenFileCache};
pub use filter::{compute_etag, FilterStatus, HeaderFilter, LastModifiedFilter};
pub use pipeline::HeaderPipeline;
pub use scope::{ScopeConfig, ScopeSettings, ScopeTree};
