//! reqwest-backed HTTP transport
//!
//! Resolves endpoints against a base URL, applies query/headers/body and maps
//! the outcome into the pipeline's error taxonomy:
//! - non-2xx status → `Error::Transport { status: Some(code) }`
//! - connect/timeout/IO failures → `Error::Transport { status: None }`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, ClientBuilder, header};
use tracing::{debug, info, trace};
use url::Url;

use super::{TlsContext, Transport};
use crate::request::{RequestBody, RequestSpec, Response};
use crate::{Error, Result};

/// Longest error body excerpt kept in a transport error message
const MAX_ERROR_BODY: usize = 512;

/// HTTP transport for API endpoints
pub struct HttpTransport {
    /// HTTP client (rebuilt by `configure_ssl`)
    client: RwLock<Client>,
    /// Base URL endpoints are joined onto
    base_url: RwLock<Url>,
    /// Headers sent with every request
    default_headers: HashMap<String, String>,
    /// Per-attempt timeout
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        base_url: &str,
        default_headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let base_url = parse_base_url(base_url)?;
        let client = client_builder(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            client: RwLock::new(client),
            base_url: RwLock::new(base_url),
            default_headers,
            timeout,
        }))
    }

    /// Current base URL
    #[must_use]
    pub fn base_url(&self) -> Url {
        self.base_url.read().clone()
    }

    /// Resolve an endpoint against the base URL. Absolute URLs pass through.
    fn resolve(&self, endpoint: &str) -> Result<Url> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Url::parse(endpoint)
                .map_err(|e| Error::Config(format!("Invalid endpoint URL '{endpoint}': {e}")));
        }
        self.base_url
            .read()
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("Invalid endpoint '{endpoint}': {e}")))
    }
}

fn client_builder(timeout: Duration) -> ClientBuilder {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(5))
}

/// Parse a base URL, ensuring a trailing slash so `join` keeps the path prefix
fn parse_base_url(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|e| Error::Config(format!("Invalid base URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "Unsupported base URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &RequestSpec) -> Result<Response> {
        let url = self.resolve(request.endpoint())?;
        let client = self.client.read().clone();

        let mut builder = client.request(request.method().clone(), url.clone());
        if !request.query_params().is_empty() {
            builder = builder.query(request.query_params());
        }
        for (name, value) in &self.default_headers {
            if request.header_value(name).is_none() {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        builder = match request.body() {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Text(text)) => builder
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(text.clone()),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
            None => builder,
        };

        trace!(method = %request.method(), url = %url, "Sending request");
        let response = builder.send().await.map_err(|e| {
            debug!(url = %url, error = %e, "Request failed before a response");
            Error::connection(e.to_string())
        })?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::connection(format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            let excerpt: String = String::from_utf8_lossy(&body)
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(Error::http_status(
                status.as_u16(),
                format!("{} {url}: {excerpt}", request.method()),
            ));
        }

        let mut resp = Response::new(status.as_u16(), request.response_kind(), body);
        for (name, value) in headers {
            resp = resp.with_header(name, value);
        }
        Ok(resp)
    }

    fn configure_ssl(&self, tls: TlsContext) -> Result<()> {
        let client = client_builder(self.timeout)
            .use_preconfigured_tls(tls.client_config().clone())
            .build()
            .map_err(|e| Error::Config(format!("Failed to apply TLS configuration: {e}")))?;
        *self.client.write() = client;
        info!("TLS configuration replaced");
        Ok(())
    }

    fn set_base_url(&self, url: &str) -> Result<()> {
        let parsed = parse_base_url(url)?;
        debug!(base_url = %parsed, "Base URL updated");
        *self.base_url.write() = parsed;
        Ok(())
    }
}
