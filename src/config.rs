//! Configuration management

use std::{collections::HashMap, env, path::Path, sync::Arc, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::{
    BasicAuth, BearerAuth, CredentialProvider, GrantStrategy, NoAuth, OAuth2Provider,
    OAuth2Settings, TokenEndpoint,
};
use crate::{Error, Result};

/// Environment variable prefix (nested keys use `__`)
pub const ENV_PREFIX: &str = "SENTINEL_HTTP_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Client pipeline configuration
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.client.circuit_breaker.validate()?;
        self.client.retry.validate()
    }

    /// Copy safe to print: credential secrets and auth-like headers replaced by `***`
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.client.credentials = self.client.credentials.redacted();
        for (name, value) in &mut copy.client.headers {
            let lower = name.to_ascii_lowercase();
            if lower.contains("authorization") || lower.contains("token") || lower.contains("key") {
                *value = REDACTED.to_string();
            }
        }
        copy
    }

    /// Expand `${VAR}` and `${VAR:-default}` in headers and credential secrets
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in self.client.headers.values_mut() {
            *value = expand_string(&re, value);
        }
        self.client.credentials.expand_with(|s| expand_string(&re, s));
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (overridden by `RUST_LOG`)
    pub level: String,
    /// Output format: `text` or `json`
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Client pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used for the breaker and in logs
    pub name: String,
    /// Base URL endpoints are resolved against
    pub base_url: String,
    /// Per-attempt timeout enforced by the transport
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Headers sent with every request
    pub headers: HashMap<String, String>,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Credential strategy
    pub credentials: CredentialConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_url: "http://localhost".to_string(),
            timeout: Duration::from_secs(30),
            headers: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

/// Which failures trip the breaker (closure-based policies are code-only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    /// Any failure counts
    #[default]
    AllExceptions,
    /// Only 5xx responses count
    ServerErrorsOnly,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failures inside the decay window before opening
    pub failure_threshold: u32,
    /// Time to wait before half-open
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Age after which a failure stops counting
    #[serde(with = "humantime_serde")]
    pub failure_decay: Duration,
    /// Which failures count
    pub failure_policy: FailurePolicyKind,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            failure_decay: Duration::from_secs(60),
            failure_policy: FailurePolicyKind::AllExceptions,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject thresholds that could never trip and empty decay windows
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.failure_decay.is_zero() {
            return Err(Error::Config(
                "circuit_breaker.failure_decay must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum retries after the first attempt
    pub max_retries: i64,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Same checks the retry interceptor applies at construction
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 0 {
            return Err(Error::Config(format!(
                "retry.max_retries must not be negative (got {})",
                self.max_retries
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be finite and >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Credential strategy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialConfig {
    /// Unauthenticated
    #[default]
    None,
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// Static bearer token
    Bearer {
        /// Token value
        token: String,
    },
    /// OAuth2 client-credentials grant
    ClientCredentials {
        /// Token endpoint
        token_url: String,
        /// Client identifier
        client_id: String,
        /// Client secret
        #[serde(default)]
        client_secret: Option<String>,
        /// Requested scopes
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// OAuth2 password grant (refresh-token grant once a refresh token is held)
    Password {
        /// Token endpoint
        token_url: String,
        /// Client identifier
        client_id: String,
        /// Client secret
        #[serde(default)]
        client_secret: Option<String>,
        /// Resource owner user name
        username: String,
        /// Resource owner password
        password: String,
        /// Requested scopes
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// Assertion obtained from a second endpoint, then exchanged for a token
    Assertion {
        /// Token endpoint
        token_url: String,
        /// Endpoint issuing the signed assertion
        assertion_url: String,
        /// Client identifier
        client_id: String,
        /// Client secret
        #[serde(default)]
        client_secret: Option<String>,
        /// Subject the assertion is requested for
        #[serde(default)]
        subject: Option<String>,
        /// Audience of the assertion
        #[serde(default)]
        audience: Option<String>,
        /// Requested scopes
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl CredentialConfig {
    /// Build a provider; OAuth2 strategies exchange tokens through `endpoint`
    pub fn build(&self, endpoint: Arc<dyn TokenEndpoint>) -> Arc<dyn CredentialProvider> {
        match self {
            Self::None => Arc::new(NoAuth),
            Self::Basic { username, password } => Arc::new(BasicAuth::new(username, password)),
            Self::Bearer { token } => Arc::new(BearerAuth::new(token)),
            Self::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
            } => Arc::new(OAuth2Provider::new(
                OAuth2Settings {
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scopes: scopes.clone(),
                },
                GrantStrategy::ClientCredentials,
                endpoint,
            )),
            Self::Password {
                token_url,
                client_id,
                client_secret,
                username,
                password,
                scopes,
            } => Arc::new(OAuth2Provider::new(
                OAuth2Settings {
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scopes: scopes.clone(),
                },
                GrantStrategy::Password {
                    username: username.clone(),
                    password: password.clone(),
                },
                endpoint,
            )),
            Self::Assertion {
                token_url,
                assertion_url,
                client_id,
                client_secret,
                subject,
                audience,
                scopes,
            } => Arc::new(OAuth2Provider::new(
                OAuth2Settings {
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scopes: scopes.clone(),
                },
                GrantStrategy::Assertion {
                    assertion_url: assertion_url.clone(),
                    subject: subject.clone(),
                    audience: audience.clone(),
                },
                endpoint,
            )),
        }
    }

    /// Strategy name for display
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
            Self::ClientCredentials { .. } => "client_credentials",
            Self::Password { .. } => "password",
            Self::Assertion { .. } => "assertion",
        }
    }

    /// Copy with every secret replaced by `***`
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            Self::None => {}
            Self::Basic { password, .. } => *password = REDACTED.to_string(),
            Self::Bearer { token } => *token = REDACTED.to_string(),
            Self::ClientCredentials { client_secret, .. }
            | Self::Assertion { client_secret, .. } => redact_opt(client_secret),
            Self::Password {
                client_secret,
                password,
                ..
            } => {
                redact_opt(client_secret);
                *password = REDACTED.to_string();
            }
        }
        copy
    }

    fn expand_with(&mut self, f: impl Fn(&str) -> String) {
        let expand_opt = |v: &mut Option<String>| {
            if let Some(s) = v.as_mut() {
                *s = f(s);
            }
        };
        match self {
            Self::None => {}
            Self::Basic { username, password } => {
                *username = f(username);
                *password = f(password);
            }
            Self::Bearer { token } => *token = f(token),
            Self::ClientCredentials {
                client_id,
                client_secret,
                ..
            }
            | Self::Assertion {
                client_id,
                client_secret,
                ..
            } => {
                *client_id = f(client_id);
                expand_opt(client_secret);
            }
            Self::Password {
                client_id,
                client_secret,
                username,
                password,
                ..
            } => {
                *client_id = f(client_id);
                expand_opt(client_secret);
                *username = f(username);
                *password = f(password);
            }
        }
    }
}

const REDACTED: &str = "***";

fn redact_opt(value: &mut Option<String>) {
    if value.is_some() {
        *value = Some(REDACTED.to_string());
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (`"30s"`, or `"250ms"`
    /// when not a whole number of seconds)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"`; bare numbers are seconds
    pub fn parse(s: &str) -> Result<Duration, String> {
        let parse_num = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        if let Some(ms) = s.strip_suffix("ms") {
            parse_num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse_num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(parse_num(mins)?, 60, s)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(parse_num(hours)?, 3600, s)
        } else {
            parse_num(s).map(Duration::from_secs)
        }
    }

    fn scaled(value: u64, unit_secs: u64, s: &str) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration '{s}': out of range"))
    }
}
