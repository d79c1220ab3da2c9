//! Credential providers
//!
//! A provider signs each logical request before it enters the interceptor
//! chain. Static strategies only attach a header; OAuth2 strategies also own
//! the token lifecycle and refresh single-flight when the token goes stale.

mod endpoint;
mod oauth;
mod token;

pub use endpoint::{HttpTokenEndpoint, TokenEndpoint, TokenResponse};
pub use oauth::{GrantStrategy, OAuth2Provider, OAuth2Settings};
pub use token::{REFRESH_MARGIN, TokenState};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

use crate::Result;
use crate::request::RequestSpec;

/// Header carrying credentials
pub const AUTHORIZATION: &str = "Authorization";

/// Produces the auth header for outgoing requests
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Attach credentials to `request`, refreshing first if needed
    async fn sign(&self, request: RequestSpec) -> Result<RequestSpec>;

    /// True when the held token is missing, of unknown lifetime, or close to expiry
    fn needs_refresh(&self) -> bool {
        false
    }

    /// Acquire a new token. Returns `false` when a concurrent refresh
    /// completed while waiting and its result was reused.
    async fn refresh(&self) -> Result<bool> {
        Ok(false)
    }

    /// Current access token, if any
    fn access_token(&self) -> Option<String> {
        None
    }

    /// Expiry of the current access token, if known
    fn token_expiry(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Unauthenticated requests
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl CredentialProvider for NoAuth {
    async fn sign(&self, request: RequestSpec) -> Result<RequestSpec> {
        Ok(request)
    }
}

/// HTTP basic authentication
#[derive(Clone)]
pub struct BasicAuth {
    header: String,
}

impl BasicAuth {
    /// Create from user name and password
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            header: format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
        }
    }
}

#[async_trait]
impl CredentialProvider for BasicAuth {
    async fn sign(&self, mut request: RequestSpec) -> Result<RequestSpec> {
        request.set_header(AUTHORIZATION, self.header.clone());
        Ok(request)
    }
}

/// Static bearer token
#[derive(Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    /// Create from a token managed elsewhere
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for BearerAuth {
    async fn sign(&self, mut request: RequestSpec) -> Result<RequestSpec> {
        request.set_header(AUTHORIZATION, format!("Bearer {}", self.token));
        Ok(request)
    }

    fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}
