//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilient HTTP client: circuit breaker, retries and refreshing credentials
#[derive(Parser, Debug)]
#[command(name = "sentinel-http")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SENTINEL_HTTP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured base URL
    #[arg(long, env = "SENTINEL_HTTP_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SENTINEL_HTTP_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, env = "SENTINEL_HTTP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request through the full pipeline
    Request {
        /// HTTP method (GET, POST, ...)
        #[arg(required = true)]
        method: String,

        /// Endpoint, relative to the base URL or absolute
        #[arg(required = true)]
        endpoint: String,

        /// Query parameter as `key=value` (repeatable)
        #[arg(short, long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,

        /// Header as `name: value` (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        header: Vec<String>,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Probe an endpoint without going through retries
    Health {
        /// Endpoint to probe
        #[arg(default_value = "/health")]
        endpoint: String,
    },

    /// Print the resolved configuration with secrets redacted
    ShowConfig,
}

/// Split `key=value`
#[must_use]
pub fn parse_query_pair(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// Split `name: value`
#[must_use]
pub fn parse_header_pair(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
