//! Response header filters.
//!
//! Filters form a chain: each stage holds the next one and must hand the
//! (possibly modified) headers on exactly once.

mod last_modified;

pub use last_modified::{FilterStats, LastModifiedFilter};

use crate::context::{RequestContext, ResponseHeaders};
use crate::scope::ScopeConfig;

/// Outcome reported back through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Ok,
    Error,
}

/// A stage in the response header filter chain.
pub trait HeaderFilter: Send + Sync {
    /// Called once per response, after upstream stages finalized the headers.
    fn on_response_headers(
        &self,
        ctx: &RequestContext,
        scope: &ScopeConfig,
        response: &mut ResponseHeaders,
    ) -> FilterStatus;

    /// Get the filter name for debugging.
    fn name(&self) -> &'static str;
}

/// Last stage of a chain. Accepts the headers as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct Terminal;

impl HeaderFilter for Terminal {
    fn on_response_headers(
        &self,
        _ctx: &RequestContext,
        _scope: &ScopeConfig,
        _response: &mut ResponseHeaders,
    ) -> FilterStatus {
        FilterStatus::Ok
    }

    fn name(&self) -> &'static str {
        "terminal"
    }
}

/// Strong validator for an entity of `size` bytes modified at `mtime`.
///
/// Same shape as the validators static file handlers emit: lowercase hex
/// mtime and size joined by a dash, quoted.
pub fn compute_etag(size: u64, mtime: i64) -> String {
    format!("\"{:x}-{:x}\"", mtime, size)
}
