//! Request and response state seen by header filters.

use std::collections::HashMap;

/// Request information for a filter invocation.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// HTTP method
    pub method: String,
    /// Request path (without query string)
    pub path: String,
    /// Query string (without leading ?)
    pub query_string: Option<String>,
    /// Parsed query parameters
    pub query_params: HashMap<String, Vec<String>>,
    /// Request headers, keyed by lowercase name
    pub headers: HashMap<String, Vec<String>>,
}

impl RequestInfo {
    /// Build request info from a method and a request URI (path plus optional query).
    pub fn new(method: impl Into<String>, uri: &str) -> Self {
        let (path, query_string) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri.to_string(), None),
        };
        let query_params = parse_query_string(query_string.as_deref());

        Self {
            method: method.into(),
            path,
            query_string,
            query_params,
            headers: HashMap::new(),
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Get a single header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Whether the method is one whose validators this filter may rewrite.
    pub fn is_get_or_head(&self) -> bool {
        self.method == "GET" || self.method == "HEAD"
    }
}

/// Context available to a header filter for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Original request information
    pub request: RequestInfo,
    /// Captured groups from location matching
    pub captures: HashMap<String, String>,
    /// Whether this is the top-level request of the transaction
    pub main: bool,
    /// Correlation ID
    pub correlation_id: String,
}

impl RequestContext {
    /// Create a context for a top-level request.
    pub fn new(request: RequestInfo, correlation_id: impl Into<String>) -> Self {
        Self {
            request,
            captures: HashMap::new(),
            main: true,
            correlation_id: correlation_id.into(),
        }
    }

    /// Mark the request as an internal subrequest.
    pub fn into_subrequest(mut self) -> Self {
        self.main = false;
        self
    }

    /// Add location captures to the context.
    pub fn with_captures(mut self, captures: HashMap<String, String>) -> Self {
        self.captures = captures;
        self
    }
}

/// Response header state owned by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// HTTP status code
    pub status: u16,
    /// Last-Modified as unix seconds; `None` sorts before any real timestamp
    pub last_modified_time: Option<i64>,
    /// ETag validator, quoted
    pub etag: Option<String>,
    /// Content-Length of the served entity, if known
    pub content_length: Option<u64>,
    /// Remaining response headers, keyed by lowercase name
    pub headers: HashMap<String, Vec<String>>,
}

impl ResponseHeaders {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            last_modified_time: None,
            etag: None,
            content_length: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_last_modified(mut self, secs: i64) -> Self {
        self.last_modified_time = Some(secs);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Drop the ETag validator.
    pub fn clear_etag(&mut self) {
        self.etag = None;
    }

    /// Whether `mtime` would move Last-Modified forward.
    pub fn is_older_than(&self, mtime: i64) -> bool {
        self.last_modified_time.map_or(true, |current| current < mtime)
    }

    /// Render `last_modified_time` as an IMF-fixdate header value.
    pub fn last_modified_header(&self) -> Option<String> {
        let secs = self.last_modified_time?;
        let time = chrono::DateTime::from_timestamp(secs, 0)?;
        Some(time.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    }
}

/// Parse query string into parameter map.
fn parse_query_string(query: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();

    if let Some(qs) = query {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let key = urlencoding::decode(k)
                    .unwrap_or_else(|_| k.into())
                    .to_string();
                let value = urlencoding::decode(v)
                    .unwrap_or_else(|_| v.into())
                    .to_string();
                params.entry(key).or_default().push(value);
            } else if !part.is_empty() {
                let key = urlencoding::decode(part)
                    .unwrap_or_else(|_| part.into())
                    .to_string();
                params.entry(key).or_default().push(String::new());
            }
        }
    }

    params
}

/// Get status text for a status code.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
