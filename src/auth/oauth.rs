use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use tracing::{debug, info};

use super::error::AuthError;
use super::storage::CredentialRecord;
use crate::config::{Environment, QboConfig};
use crate::consts::{AUTHORIZE_URL, EXPIRY_MARGIN_MS, REVOKE_URL, TOKEN_URL, now_ms};

/// The three OAuth2 operations the authenticator needs from the provider.
///
/// [`TokenClient`] talks to Intuit; [`MockEndpoint`](super::mock::MockEndpoint)
/// scripts answers for tests.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// URL the user's browser must visit to grant access.
    fn authorization_url(&self, scopes: &[String], state: &str) -> String;

    /// Trade an authorization code for a fresh credential record.
    async fn exchange_code(&self, code: &str, realm_id: &str)
    -> Result<CredentialRecord, AuthError>;

    /// Mint a new access token. The returned record carries whatever refresh
    /// token the provider handed back; persist that one, not the old one.
    async fn refresh(&self, record: &CredentialRecord) -> Result<CredentialRecord, AuthError>;

    /// Revoke the record's refresh token.
    async fn revoke(&self, record: &CredentialRecord) -> Result<(), AuthError>;
}

/// Provider endpoint URLs. Defaults point at Intuit production OAuth.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: AUTHORIZE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }
}

/// OAuth2 client for Intuit's token endpoints.
pub struct TokenClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    environment: Environment,
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
}

impl TokenClient {
    pub fn new(config: &QboConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            environment: config.environment,
            endpoints: OAuthEndpoints::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", STANDARD.encode(raw))
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .header("Authorization", self.basic_auth())
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl TokenEndpoint for TokenClient {
    fn authorization_url(&self, scopes: &[String], state: &str) -> String {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("state", state),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoded(v)))
            .collect::<Vec<_>>()
            .join("&");

        format!("{}?{}", self.endpoints.authorize_url, query)
    }

    async fn exchange_code(
        &self,
        code: &str,
        realm_id: &str,
    ) -> Result<CredentialRecord, AuthError> {
        debug!(token_url = %self.endpoints.token_url, "exchanging authorization code");
        let data = self
            .post_token_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;

        info!(realm_id, "authorization code exchanged");
        Ok(CredentialRecord {
            access_token: Some(data.access_token),
            refresh_token: data.refresh_token,
            realm_id: Some(realm_id.to_string()),
            environment: self.environment,
            expires_at: data.expires_in.map(expiry_from_now),
            saved_at: None,
        })
    }

    async fn refresh(&self, record: &CredentialRecord) -> Result<CredentialRecord, AuthError> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NotAuthenticated)?;

        debug!(token_url = %self.endpoints.token_url, "refreshing access token");
        let data = self
            .post_token_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        let rotated = data
            .refresh_token
            .as_deref()
            .is_some_and(|new| new != refresh_token);
        info!(rotated, "access token refreshed");

        Ok(CredentialRecord {
            access_token: Some(data.access_token),
            refresh_token: data.refresh_token.or_else(|| record.refresh_token.clone()),
            realm_id: record.realm_id.clone(),
            environment: record.environment,
            expires_at: data.expires_in.map(expiry_from_now),
            saved_at: None,
        })
    }

    async fn revoke(&self, record: &CredentialRecord) -> Result<(), AuthError> {
        let token = record
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NotAuthenticated)?;

        debug!(revoke_url = %self.endpoints.revoke_url, "revoking refresh token");
        let resp = self
            .http
            .post(&self.endpoints.revoke_url)
            .header("Authorization", self.basic_auth())
            .header("Accept", "application/json")
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        check_status(resp).await?;
        info!("refresh token revoked");
        Ok(())
    }
}

/// Map a non-2xx answer to [`AuthError::Protocol`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AuthError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AuthError::Protocol {
        status: status.as_u16(),
        body,
    })
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn expiry_from_now(expires_in_secs: u64) -> u64 {
    now_ms()
        .saturating_add(expires_in_secs.saturating_mul(1000))
        .saturating_sub(EXPIRY_MARGIN_MS)
}

/// Random, URL-safe `state` value for the authorization request.
pub fn generate_state() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 24] = rng.random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Minimal URL encoding for query parameters.
pub(crate) fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }
    out
}
