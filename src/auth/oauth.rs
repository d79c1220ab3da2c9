//! OAuth2 token lifecycle
//!
//! One engine owns the token snapshot, the expiry decision, and the
//! single-flight refresh. The grant strategy only decides which parameters
//! are posted to the token endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::endpoint::{TokenEndpoint, TokenResponse};
use super::token::{REFRESH_MARGIN, TokenState};
use super::{AUTHORIZATION, CredentialProvider};
use crate::request::RequestSpec;
use crate::{Error, Result};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Client registration shared by every grant
#[derive(Debug, Clone, Default)]
pub struct OAuth2Settings {
    /// Token endpoint URL
    pub token_url: String,
    /// Client identifier
    pub client_id: String,
    /// Client secret, for confidential clients
    pub client_secret: Option<String>,
    /// Requested scopes
    pub scopes: Vec<String>,
}

impl OAuth2Settings {
    fn validate(&self) -> Result<()> {
        if self.token_url.trim().is_empty() {
            return Err(Error::Credential("OAuth2 token_url is required".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::Credential("OAuth2 client_id is required".to_string()));
        }
        Ok(())
    }

    fn client_params(&self, params: &mut Vec<(String, String)>) {
        params.push(("client_id".to_string(), self.client_id.clone()));
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret".to_string(), secret.clone()));
        }
    }

    fn scope_param(&self, params: &mut Vec<(String, String)>) {
        if !self.scopes.is_empty() {
            params.push(("scope".to_string(), self.scopes.join(" ")));
        }
    }
}

/// How a token is obtained
#[derive(Debug, Clone)]
pub enum GrantStrategy {
    /// `grant_type=client_credentials`
    ClientCredentials,
    /// Resource owner password, then `refresh_token` once one is held
    Password {
        /// Resource owner user name
        username: String,
        /// Resource owner password
        password: String,
    },
    /// Fetch a signed assertion from a second endpoint, then exchange it
    Assertion {
        /// Endpoint issuing the assertion
        assertion_url: String,
        /// Subject the assertion is requested for
        subject: Option<String>,
        /// Audience of the assertion
        audience: Option<String>,
    },
}

impl GrantStrategy {
    /// Grant name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::Password { .. } => "password",
            Self::Assertion { .. } => "assertion",
        }
    }

    /// Check the inputs this grant needs before any network call
    fn validate(&self) -> Result<()> {
        match self {
            Self::ClientCredentials => Ok(()),
            Self::Password { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(Error::Credential(
                        "Password grant requires username and password".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Assertion { assertion_url, .. } => {
                if assertion_url.trim().is_empty() {
                    return Err(Error::Credential(
                        "Assertion grant requires assertion_url".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Parameters for the token request. `assertion` is only used by the assertion grant.
    fn token_params(
        &self,
        settings: &OAuth2Settings,
        assertion: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = Vec::new();
        match self {
            Self::ClientCredentials => {
                params.push(("grant_type".to_string(), "client_credentials".to_string()));
            }
            Self::Password { username, password } => {
                params.push(("grant_type".to_string(), "password".to_string()));
                params.push(("username".to_string(), username.clone()));
                params.push(("password".to_string(), password.clone()));
            }
            Self::Assertion { .. } => {
                params.push(("grant_type".to_string(), JWT_BEARER_GRANT.to_string()));
                params.push(("assertion".to_string(), assertion.unwrap_or_default().to_string()));
            }
        }
        settings.client_params(&mut params);
        settings.scope_param(&mut params);
        params
    }

    fn assertion_params(&self, settings: &OAuth2Settings) -> Vec<(String, String)> {
        let mut params = Vec::new();
        settings.client_params(&mut params);
        if let Self::Assertion {
            subject, audience, ..
        } = self
        {
            if let Some(subject) = subject {
                params.push(("subject".to_string(), subject.clone()));
            }
            if let Some(audience) = audience {
                params.push(("audience".to_string(), audience.clone()));
            }
        }
        settings.scope_param(&mut params);
        params
    }
}

/// Refreshing OAuth2 credential provider
pub struct OAuth2Provider {
    settings: OAuth2Settings,
    grant: GrantStrategy,
    endpoint: Arc<dyn TokenEndpoint>,
    margin: Duration,
    /// Current token, readable without waiting on a refresh
    token: RwLock<TokenState>,
    /// Held for the whole exchange so at most one runs at a time
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped after every exchange attempt, successful or not
    generation: AtomicU64,
    /// Failure message of the latest attempt, handed to callers that waited on it
    last_failure: parking_lot::Mutex<Option<String>>,
}

impl OAuth2Provider {
    /// Create a provider with no token yet
    pub fn new(settings: OAuth2Settings, grant: GrantStrategy, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            settings,
            grant,
            endpoint,
            margin: REFRESH_MARGIN,
            token: RwLock::new(TokenState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            last_failure: parking_lot::Mutex::new(None),
        }
    }

    /// Seed the provider with a previously obtained token
    #[must_use]
    pub fn with_token(self, token: TokenState) -> Self {
        *self.token.write() = token;
        self
    }

    /// Override the refresh safety margin
    #[must_use]
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Snapshot of the current token
    #[must_use]
    pub fn token_state(&self) -> TokenState {
        self.token.read().clone()
    }

    /// Run one exchange unless another caller finished one after `observed`
    async fn refresh_after(&self, observed: u64) -> Result<bool> {
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(message) = self.last_failure.lock().clone() {
                debug!(grant = self.grant.name(), "Concurrent refresh failed, sharing its error");
                return Err(Error::Credential(message));
            }
            debug!(grant = self.grant.name(), "Reusing concurrently refreshed token");
            return Ok(false);
        }

        // Outcome is published before the generation moves
        match self.exchange().await {
            Ok(response) => {
                *self.last_failure.lock() = None;
                let mut token = self.token.write();
                let next = TokenState::from_response(response, &token, Utc::now());
                *token = next;
                self.generation.fetch_add(1, Ordering::AcqRel);
                info!(
                    grant = self.grant.name(),
                    expires_at = ?token.expires_at,
                    "Access token refreshed"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(grant = self.grant.name(), error = %e, "Token refresh failed");
                let message = match &e {
                    Error::Credential(message) => message.clone(),
                    other => other.to_string(),
                };
                *self.last_failure.lock() = Some(message);
                self.generation.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<TokenResponse> {
        self.settings.validate()?;
        self.grant.validate()?;

        match &self.grant {
            GrantStrategy::Password { .. } => {
                let refresh_token = self.token.read().refresh_token.clone();
                if let Some(refresh_token) = refresh_token {
                    let mut params = vec![
                        ("grant_type".to_string(), "refresh_token".to_string()),
                        ("refresh_token".to_string(), refresh_token),
                    ];
                    self.settings.client_params(&mut params);
                    match self.endpoint.request_token(&self.settings.token_url, &params).await {
                        Ok(response) => return Ok(response),
                        Err(e) => {
                            debug!(error = %e, "Refresh token rejected, falling back to password grant");
                        }
                    }
                }
                let params = self.grant.token_params(&self.settings, None);
                self.endpoint.request_token(&self.settings.token_url, &params).await
            }
            GrantStrategy::Assertion { assertion_url, .. } => {
                // A failed assertion call ends the refresh here
                let assertion = self
                    .endpoint
                    .request_assertion(assertion_url, &self.grant.assertion_params(&self.settings))
                    .await?;
                let params = self.grant.token_params(&self.settings, Some(&assertion));
                self.endpoint.request_token(&self.settings.token_url, &params).await
            }
            GrantStrategy::ClientCredentials => {
                let params = self.grant.token_params(&self.settings, None);
                self.endpoint.request_token(&self.settings.token_url, &params).await
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuth2Provider {
    async fn sign(&self, mut request: RequestSpec) -> Result<RequestSpec> {
        let observed = self.generation.load(Ordering::Acquire);
        if self.needs_refresh() {
            self.refresh_after(observed).await?;
        }

        let header = self
            .token
            .read()
            .authorization()
            .ok_or_else(|| Error::Credential("No access token available".to_string()))?;
        request.set_header(AUTHORIZATION, header);
        Ok(request)
    }

    fn needs_refresh(&self) -> bool {
        self.token.read().needs_refresh(self.margin, Utc::now())
    }

    async fn refresh(&self) -> Result<bool> {
        let observed = self.generation.load(Ordering::Acquire);
        self.refresh_after(observed).await
    }

    fn access_token(&self) -> Option<String> {
        self.token.read().access_token.clone()
    }

    fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token.read().expires_at
    }
}
