//! Last-Modified filter CLI entry point.
//!
//! Validates configuration and probes single responses through the filter chain.

use anyhow::{bail, Context, Result};
use clap::Parser;
use last_modified_filter::context::status_text;
use last_modified_filter::{
    FilterConfig, HeaderPipeline, RequestContext, RequestInfo, ResponseHeaders,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "last-modified-filter")]
#[command(
    author,
    version,
    about = "Back Last-Modified/ETag with the modification time of a source file"
)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, env = "LAST_MODIFIED_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration, print the resolved scopes and exit.
    #[arg(long)]
    validate: bool,

    /// Run one synthetic response for this request URI through the chain.
    #[arg(long, value_name = "URI")]
    probe: Option<String>,

    /// Request method for --probe
    #[arg(long, default_value = "GET")]
    method: String,

    /// Request header for --probe, as Name:Value (repeatable)
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Treat the probe as an internal subrequest
    #[arg(long)]
    subrequest: bool,

    /// Response Last-Modified (unix seconds) for --probe
    #[arg(long, allow_negative_numbers = true)]
    last_modified: Option<i64>,

    /// Response ETag for --probe
    #[arg(long)]
    etag: Option<String>,

    /// Response Content-Length for --probe
    #[arg(long)]
    content_length: Option<u64>,
}

const EXAMPLE_CONFIG: &str = r#"# Last-Modified Filter Configuration Example
version: "1"

settings:
  open_file_cache:
    # Maximum number of cached source paths
    max_entries: 10000

scopes:
  - name: "site"
    # Document root the source path is appended to
    root: "/var/www"
    # Enable the override for this scope and everything below it
    last_modified_override: true
    # Source file backing the validators (relative to root)
    last_modified_source: "/build/manifest.json"
    # true: drop ETag; false: regenerate it from the source file
    last_modified_clear_etag: true
    # Cached lookups stay valid this long (seconds, 0 disables caching)
    open_file_cache_valid_secs: 60
    # Cache failed lookups too
    open_file_cache_errors: false
    # off | on | if_not_owner
    disable_symlinks: "off"
    locations:
      # Versioned docs use their own index file
      - name: "docs"
        match:
          pattern: "^/docs/(?P<version>v\\d+)/"
          type: regex
        last_modified_source: "/docs/${version}/index.json"
        last_modified_clear_etag: false

      # Never touch API responses
      - name: "api"
        match:
          pattern: "/api/"
          type: prefix
        last_modified_override: false
"#;

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("Invalid header (expected Name:Value): {raw}"),
    }
}

fn print_response(response: &ResponseHeaders) {
    println!("HTTP/1.1 {} {}", response.status, status_text(response.status));
    if let Some(length) = response.content_length {
        println!("Content-Length: {}", length);
    }
    if let Some(last_modified) = response.last_modified_header() {
        println!("Last-Modified: {}", last_modified);
    }
    if let Some(etag) = &response.etag {
        println!("ETag: {}", etag);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if args.example_config {
        println!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => FilterConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => FilterConfig::default(),
    };

    let pipeline = HeaderPipeline::new(&config).context("Invalid configuration")?;

    if args.validate {
        for (depth, scope) in pipeline.scopes().scopes() {
            println!(
                "{:indent$}{} enabled={} source={} clear_etag={} root={}",
                "",
                scope.name,
                scope.enabled,
                scope
                    .source
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |s| s.to_string()),
                scope.clear_etag,
                scope.root.display(),
                indent = depth * 2
            );
        }
        info!("Configuration is valid");
        return Ok(());
    }

    let Some(uri) = &args.probe else {
        bail!("Nothing to do: pass --validate, --example-config or --probe <URI>");
    };

    let mut request = RequestInfo::new(args.method.clone(), uri);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    let mut ctx = RequestContext::new(request, "probe");
    if args.subrequest {
        ctx = ctx.into_subrequest();
    }

    let mut response = ResponseHeaders::new(200);
    response.last_modified_time = args.last_modified;
    response.etag = args.etag.clone();
    response.content_length = args.content_length;

    let status = pipeline.process(ctx, &mut response);

    print_response(&response);

    info!(
        status = ?status,
        stats = ?pipeline.stats(),
        cache = ?pipeline.cache_stats(),
        "Probe finished"
    );

    Ok(())
}
