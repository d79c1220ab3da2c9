//! sentinel-http - run requests through the resilient client pipeline

use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use sentinel_http::{
    cli::{Cli, Command, parse_header_pair, parse_query_pair},
    client::ApiClient,
    config::Config,
    request::{Method, RequestSpec},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Apply CLI overrides
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if cli.log_format.is_some() {
        config.logging.format.clone_from(&cli.log_format);
    }
    if let Some(base_url) = &cli.base_url {
        config.client.base_url.clone_from(base_url);
    }

    if let Err(e) = setup_tracing(&config.logging.level, config.logging.format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Request {
            method,
            endpoint,
            query,
            header,
            data,
        } => run_request(&config, &method, &endpoint, &query, &header, data.as_deref()).await,
        Command::Health { endpoint } => run_health(&config, &endpoint).await,
        Command::ShowConfig => show_config(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Build the request from CLI arguments
fn build_request(
    method: &str,
    endpoint: &str,
    query: &[String],
    header: &[String],
    data: Option<&str>,
) -> anyhow::Result<RequestSpec> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method '{method}'"))?;
    let mut request = RequestSpec::new(method, endpoint);

    for raw in query {
        let Some((key, value)) = parse_query_pair(raw) else {
            bail!("Invalid query parameter '{raw}', expected KEY=VALUE");
        };
        request = request.query(key, value);
    }
    for raw in header {
        let Some((name, value)) = parse_header_pair(raw) else {
            bail!("Invalid header '{raw}', expected 'NAME: VALUE'");
        };
        request = request.header(name, value);
    }
    if let Some(data) = data {
        let body: serde_json::Value = serde_json::from_str(data).context("Invalid JSON body")?;
        request = request.json_body(body);
    }
    Ok(request)
}

/// Run one request and print the outcome
async fn run_request(
    config: &Config,
    method: &str,
    endpoint: &str,
    query: &[String],
    header: &[String],
    data: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let request = build_request(method, endpoint, query, header, data)?;
    let client = ApiClient::from_config(&config.client).context("Failed to build client")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        client = client.name(),
        request = %request,
        "Executing request"
    );

    let outcome = client.execute(request).await;

    let code = match &outcome {
        Ok(response) => {
            println!("HTTP {}", response.status());
            let text = response.text();
            if !text.is_empty() {
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap_or(text)),
                    Err(_) => println!("{text}"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Request failed: {e}");
            ExitCode::FAILURE
        }
    };

    if let Some(breaker) = client.circuit_breaker() {
        eprintln!("\n{}", breaker.status_message());
        eprintln!("{}", serde_json::to_string_pretty(&breaker.metrics())?);
    }
    Ok(code)
}

/// Probe an endpoint
async fn run_health(config: &Config, endpoint: &str) -> anyhow::Result<ExitCode> {
    let client = ApiClient::from_config(&config.client).context("Failed to build client")?;

    if client.perform_health_check(RequestSpec::get(endpoint)).await {
        println!("healthy: {} {endpoint}", config.client.base_url);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("unhealthy: {} {endpoint}", config.client.base_url);
        Ok(ExitCode::FAILURE)
    }
}

/// Print the resolved configuration
fn show_config(config: &Config) -> anyhow::Result<ExitCode> {
    let yaml = serde_yaml::to_string(&config.redacted()).context("Failed to render configuration")?;
    print!("{yaml}");
    Ok(ExitCode::SUCCESS)
}
