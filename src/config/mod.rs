//! Runtime configuration read from `QBO_*` environment variables.
//!
//! Built once at startup and handed to the [`Authenticator`](crate::auth::Authenticator);
//! nothing here is global.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::error::AuthError;
use crate::auth::storage::CredentialOverrides;
use crate::consts::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_REDIRECT_URI, DEFAULT_SCOPE, PRODUCTION_API_URL,
    SANDBOX_API_URL, default_token_path,
};

/// QuickBooks deployment a set of credentials belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }

    /// Base URL of the accounting REST API for this environment.
    pub fn api_base_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => SANDBOX_API_URL,
            Environment::Production => PRODUCTION_API_URL,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            other => Err(format!(
                "QBO_ENVIRONMENT must be 'sandbox' or 'production', got '{other}'"
            )),
        }
    }
}

/// Where the local callback listener binds, derived from the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CallbackAddress {
    /// `host:port` suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `http://host[:port][/path][?query]` into a bindable address.
///
/// Only plain `http` is accepted: the listener does not terminate TLS.
pub fn parse_redirect_uri(uri: &str) -> Result<CallbackAddress, AuthError> {
    let invalid = |why: &str| AuthError::Configuration(format!("invalid redirect URI '{uri}': {why}"));

    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| invalid("must start with http://"))?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/callback"),
    };
    if authority.is_empty() {
        return Err(invalid("missing host"));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
            (host, port)
        }
        None => (authority, 80),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let path = if path == "/" { "/callback" } else { path };

    Ok(CallbackAddress {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Settings for the QuickBooks OAuth client and token storage.
#[derive(Debug, Clone)]
pub struct QboConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub environment: Environment,
    pub scopes: Vec<String>,
    pub token_file: PathBuf,
    pub auth_timeout: Duration,
    /// Direct credential overrides consulted when the token file has none.
    pub overrides: CredentialOverrides,
    /// Problems found while parsing, reported by [`QboConfig::validate`].
    parse_errors: Vec<String>,
}

impl QboConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut parse_errors = Vec::new();

        let environment = match get("QBO_ENVIRONMENT") {
            Some(raw) => raw.parse::<Environment>().unwrap_or_else(|e| {
                parse_errors.push(e);
                Environment::default()
            }),
            None => Environment::default(),
        };

        let auth_timeout = match get("QBO_AUTH_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    parse_errors.push(format!(
                        "QBO_AUTH_TIMEOUT_SECS must be a positive integer, got '{raw}'"
                    ));
                    DEFAULT_AUTH_TIMEOUT
                }
            },
            None => DEFAULT_AUTH_TIMEOUT,
        };

        let scopes = get("QBO_SCOPE")
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let overrides = CredentialOverrides {
            access_token: get("QBO_ACCESS_TOKEN"),
            refresh_token: get("QBO_REFRESH_TOKEN"),
            realm_id: get("QBO_REALM_ID").or_else(|| get("QBO_COMPANY_ID")),
            environment,
        };

        Self {
            client_id: get("QBO_CLIENT_ID").unwrap_or_default(),
            client_secret: get("QBO_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: get("QBO_REDIRECT_URI").unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            environment,
            scopes,
            token_file: get("QBO_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_token_path),
            auth_timeout,
            overrides,
            parse_errors,
        }
    }

    /// List every configuration problem. Empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.parse_errors.clone();
        if self.client_id.is_empty() {
            errors.push("QBO_CLIENT_ID is required".to_string());
        }
        if self.client_secret.is_empty() {
            errors.push("QBO_CLIENT_SECRET is required".to_string());
        }
        if let Err(e) = parse_redirect_uri(&self.redirect_uri) {
            errors.push(e.to_string());
        }
        errors
    }

    /// Fail with [`AuthError::Configuration`] unless both client id and
    /// secret are set.
    pub fn require_client_credentials(&self) -> Result<(), AuthError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AuthError::Configuration(
                "QBO_CLIENT_ID and QBO_CLIENT_SECRET must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn api_base_url(&self) -> &'static str {
        self.environment.api_base_url()
    }

    pub fn callback_address(&self) -> Result<CallbackAddress, AuthError> {
        parse_redirect_uri(&self.redirect_uri)
    }
}
