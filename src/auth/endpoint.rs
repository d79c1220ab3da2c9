//! Token and assertion endpoints

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// OAuth token response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Issued access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

/// Assertion issuer response
#[derive(Debug, Deserialize)]
struct AssertionResponse {
    assertion: String,
}

/// Remote side of the token lifecycle
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// POST form `params` to the token endpoint
    async fn request_token(&self, token_url: &str, params: &[(String, String)]) -> Result<TokenResponse>;

    /// POST form `params` to an assertion issuer and return the signed assertion
    async fn request_assertion(&self, assertion_url: &str, params: &[(String, String)]) -> Result<String>;
}

/// reqwest-backed token endpoint.
///
/// Token calls deliberately bypass the request pipeline: a breaker tripped by
/// API failures must not block credential acquisition.
pub struct HttpTokenEndpoint {
    http_client: Client,
}

impl HttpTokenEndpoint {
    /// Create an endpoint client with the given timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build token client: {e}")))?;
        Ok(Self { http_client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }

    async fn post_form(&self, url: &str, params: &[(String, String)], what: &str) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| Error::Credential(format!("{what} request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Credential(format!(
                "{what} failed: HTTP {status} - {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self, token_url: &str, params: &[(String, String)]) -> Result<TokenResponse> {
        debug!(url = %token_url, "Requesting access token");
        let response = self.post_form(token_url, params, "Token exchange").await?;
        response
            .json()
            .await
            .map_err(|e| Error::Credential(format!("Failed to parse token response: {e}")))
    }

    async fn request_assertion(&self, assertion_url: &str, params: &[(String, String)]) -> Result<String> {
        debug!(url = %assertion_url, "Requesting signed assertion");
        let response = self.post_form(assertion_url, params, "Assertion request").await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::Credential(format!("Failed to read assertion response: {e}")))?;
        parse_assertion(&body)
    }
}

/// Accept either `{"assertion": "..."}` or the bare assertion as the body
fn parse_assertion(body: &str) -> Result<String> {
    let trimmed = body.trim();
    let assertion = if trimmed.starts_with('{') {
        serde_json::from_str::<AssertionResponse>(trimmed)
            .map_err(|e| Error::Credential(format!("Failed to parse assertion response: {e}")))?
            .assertion
    } else {
        trimmed.to_string()
    };

    if assertion.is_empty() {
        return Err(Error::Credential("Assertion issuer returned an empty assertion".to_string()));
    }
    Ok(assertion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_minimal_fields() {
        let resp: TokenResponse = serde_json::from_str(r#"{"access_token": "abc"}"#).unwrap();
        assert_eq!(resp.access_token, "abc");
        assert!(resp.expires_in.is_none());
        assert!(resp.refresh_token.is_none());
    }

    #[test]
    fn assertion_json_and_plain_forms() {
        assert_eq!(parse_assertion(r#"{"assertion": "eyJ.x.y"}"#).unwrap(), "eyJ.x.y");
        assert_eq!(parse_assertion("  eyJ.a.b\n").unwrap(), "eyJ.a.b");
    }

    #[test]
    fn empty_assertion_is_credential_error() {
        assert!(matches!(parse_assertion("   "), Err(Error::Credential(_))));
        assert!(matches!(parse_assertion(r#"{"assertion": ""}"#), Err(Error::Credential(_))));
        assert!(matches!(parse_assertion(r#"{"nope": 1}"#), Err(Error::Credential(_))));
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_credential_error() {
        let endpoint = HttpTokenEndpoint::new(Duration::from_millis(500)).unwrap();
        let err = endpoint
            .request_token("http://127.0.0.1:9/token", &[("grant_type".to_string(), "client_credentials".to_string())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }
}
