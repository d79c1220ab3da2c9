//! Token state held by refreshing providers

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::endpoint::TokenResponse;

/// Tokens are refreshed this long before they actually expire
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Snapshot of an access token and its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Access token
    #[serde(default)]
    pub access_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Absolute expiry, `None` when the issuer did not say
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Default for TokenState {
    fn default() -> Self {
        Self {
            access_token: None,
            token_type: default_token_type(),
            expires_at: None,
            refresh_token: None,
            scope: None,
        }
    }
}

impl TokenState {
    /// Build the next state from a token response received at `now`.
    /// A response without a refresh token keeps the previous one.
    #[must_use]
    pub fn from_response(response: TokenResponse, previous: &Self, now: DateTime<Utc>) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + chrono::Duration::seconds(secs));

        Self {
            access_token: Some(response.access_token),
            token_type: response
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_token_type),
            expires_at,
            refresh_token: response.refresh_token.or_else(|| previous.refresh_token.clone()),
            scope: response.scope,
        }
    }

    /// True if the token is absent, has unknown expiry, or expires within `margin`
    #[must_use]
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        let Some(expires_at) = self.expires_at else {
            return true;
        };
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now + margin >= expires_at
    }

    /// Time until expiration
    #[must_use]
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .and_then(|expires_at| (expires_at - now).to_std().ok())
    }

    /// `Authorization` header value for the current token
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        // RFC 6750 scheme is case-insensitive; normalize the common spelling
        let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        self.access_token
            .as_ref()
            .map(|token| format!("{scheme} {token}"))
    }
}
