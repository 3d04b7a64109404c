//! Source path expressions.
//!
//! An expression is literal text with `${...}` variable references, compiled
//! once when the configuration is loaded and evaluated per request:
//!
//! - `${request.path}` or `${uri}` - Request path
//! - `${request.method}` - HTTP method
//! - `${request.query}` - Query string
//! - `${request.header.X-Custom}` - Request header value
//! - `${request.query_param.name}` - Query parameter value
//! - `${host}` - Host header, lowercased, without port
//! - `${captures.name}`, `${name}`, `${1}` - Location captures

use crate::context::RequestContext;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Regex for matching variable expressions like ${...}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

/// A compiled source expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceExpression {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Variable {
    Path,
    Method,
    Query,
    Host,
    Header(String),
    QueryParam(String),
    Capture(String),
}

impl SourceExpression {
    /// Compile an expression.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in VAR_REGEX.captures_iter(source) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            push_literal(&mut segments, &source[last..whole.start()], last)?;
            segments.push(Segment::Variable(Variable::parse(&caps[1])?));
            last = whole.end();
        }
        push_literal(&mut segments, &source[last..], last)?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Whether the expression references any request variable.
    pub fn is_complex(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Variable(_)))
    }

    /// The expression text as configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate the expression for one request.
    pub fn evaluate(&self, ctx: &RequestContext) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(var) => {
                    let value = var
                        .resolve(ctx)
                        .ok_or_else(|| ExpressionError::Unresolved(var.to_string()))?;
                    out.push_str(&value);
                }
            }
        }

        Ok(out)
    }
}

impl fmt::Display for SourceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn push_literal(
    segments: &mut Vec<Segment>,
    text: &str,
    offset: usize,
) -> Result<(), ExpressionError> {
    if let Some(pos) = text.find("${") {
        return Err(ExpressionError::Unterminated {
            position: offset + pos,
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

impl Variable {
    fn parse(name: &str) -> Result<Self, ExpressionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ExpressionError::EmptyVariable);
        }

        let var = match name {
            "request.path" | "uri" => Self::Path,
            "request.method" => Self::Method,
            "request.query" => Self::Query,
            "host" => Self::Host,
            _ => {
                if let Some(header) = name.strip_prefix("request.header.") {
                    non_empty(header, name)?;
                    Self::Header(header.to_lowercase())
                } else if let Some(param) = name.strip_prefix("request.query_param.") {
                    non_empty(param, name)?;
                    Self::QueryParam(param.to_string())
                } else if let Some(capture) = name.strip_prefix("captures.") {
                    non_empty(capture, name)?;
                    Self::Capture(capture.to_string())
                } else if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    Self::Capture(name.to_string())
                } else {
                    return Err(ExpressionError::UnknownVariable(name.to_string()));
                }
            }
        };

        Ok(var)
    }

    fn resolve(&self, ctx: &RequestContext) -> Option<String> {
        let request = &ctx.request;
        match self {
            Self::Path => Some(request.path.clone()),
            Self::Method => Some(request.method.clone()),
            Self::Query => request.query_string.clone(),
            Self::Host => {
                let host = request.header("host")?;
                let host = match host.rsplit_once(':') {
                    Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
                    _ => host,
                };
                Some(host.to_lowercase())
            }
            Self::Header(name) => request.header(name).map(str::to_string),
            Self::QueryParam(name) => request.query_params.get(name)?.first().cloned(),
            Self::Capture(name) => ctx.captures.get(name).cloned(),
        }
    }
}

fn non_empty(part: &str, name: &str) -> Result<(), ExpressionError> {
    if part.is_empty() {
        Err(ExpressionError::UnknownVariable(name.to_string()))
    } else {
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path => f.write_str("request.path"),
            Self::Method => f.write_str("request.method"),
            Self::Query => f.write_str("request.query"),
            Self::Host => f.write_str("host"),
            Self::Header(name) => write!(f, "request.header.{}", name),
            Self::QueryParam(name) => write!(f, "request.query_param.{}", name),
            Self::Capture(name) => write!(f, "captures.{}", name),
        }
    }
}

/// Errors from compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Unterminated variable reference at byte {position}")]
    Unterminated { position: usize },

    #[error("Empty variable reference")]
    EmptyVariable,

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable has no value for this request: {0}")]
    Unresolved(String),
}
