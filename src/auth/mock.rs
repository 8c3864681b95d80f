//! Scripted stand-ins for the provider and the browser.
//!
//! Used by the test suite to drive the authenticator through refresh,
//! interactive grant and revocation without touching Intuit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Browser;
use super::error::AuthError;
use super::oauth::TokenEndpoint;
use super::storage::CredentialRecord;
use crate::consts::now_ms;

/// Canned answer for one kind of token call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Tokens {
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: Option<u64>,
    },
    Fail {
        status: u16,
        body: String,
    },
}

impl MockReply {
    pub fn tokens(access: &str, refresh: &str) -> Self {
        MockReply::Tokens {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in_secs: Some(3600),
        }
    }

    pub fn fail(status: u16, body: &str) -> Self {
        MockReply::Fail {
            status,
            body: body.to_string(),
        }
    }
}

/// A [`TokenEndpoint`] that returns scripted replies and counts calls.
pub struct MockEndpoint {
    exchange_reply: MockReply,
    refresh_reply: MockReply,
    revoke_failure: Option<(u16, String)>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
    last_code: Mutex<Option<String>>,
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEndpoint {
    /// Every call succeeds.
    pub fn new() -> Self {
        Self {
            exchange_reply: MockReply::tokens("mock-access", "mock-refresh"),
            refresh_reply: MockReply::tokens("mock-refreshed-access", "mock-rotated-refresh"),
            revoke_failure: None,
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            last_code: Mutex::new(None),
        }
    }

    pub fn with_exchange(mut self, reply: MockReply) -> Self {
        self.exchange_reply = reply;
        self
    }

    pub fn with_refresh(mut self, reply: MockReply) -> Self {
        self.refresh_reply = reply;
        self
    }

    pub fn with_revoke_failure(mut self, status: u16, body: &str) -> Self {
        self.revoke_failure = Some((status, body.to_string()));
        self
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    /// Code passed to the most recent exchange.
    pub fn last_code(&self) -> Option<String> {
        self.last_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn answer(
        reply: &MockReply,
        base: &CredentialRecord,
    ) -> Result<CredentialRecord, AuthError> {
        match reply {
            MockReply::Tokens {
                access_token,
                refresh_token,
                expires_in_secs,
            } => Ok(CredentialRecord {
                access_token: Some(access_token.clone()),
                refresh_token: refresh_token.clone().or_else(|| base.refresh_token.clone()),
                realm_id: base.realm_id.clone(),
                environment: base.environment,
                expires_at: expires_in_secs.map(|secs| now_ms() + secs * 1000),
                saved_at: None,
            }),
            MockReply::Fail { status, body } => Err(AuthError::Protocol {
                status: *status,
                body: body.clone(),
            }),
        }
    }
}

#[async_trait]
impl TokenEndpoint for MockEndpoint {
    fn authorization_url(&self, _scopes: &[String], state: &str) -> String {
        format!("https://mock.invalid/authorize?state={state}")
    }

    async fn exchange_code(
        &self,
        code: &str,
        realm_id: &str,
    ) -> Result<CredentialRecord, AuthError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code.to_string());
        let base = CredentialRecord {
            realm_id: Some(realm_id.to_string()),
            ..CredentialRecord::default()
        };
        Self::answer(&self.exchange_reply, &base)
    }

    async fn refresh(&self, record: &CredentialRecord) -> Result<CredentialRecord, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Self::answer(&self.refresh_reply, record)
    }

    async fn revoke(&self, _record: &CredentialRecord) -> Result<(), AuthError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        match &self.revoke_failure {
            Some((status, body)) => Err(AuthError::Protocol {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// A [`Browser`] that, instead of showing a page, plays the provider's
/// redirect against the local callback listener.
pub struct SimulatedBrowser {
    redirect: Option<String>,
    delay: Duration,
    opened: AtomicUsize,
    last_url: Mutex<Option<String>>,
}

impl SimulatedBrowser {
    /// Request `redirect` (a full callback URL, query included) shortly
    /// after the authorization page is opened.
    pub fn redirecting_to(redirect: impl Into<String>) -> Self {
        Self {
            redirect: Some(redirect.into()),
            delay: Duration::from_millis(50),
            opened: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    /// Never redirects, as if the user walked away.
    pub fn idle() -> Self {
        Self {
            redirect: None,
            delay: Duration::ZERO,
            opened: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Authorization URL from the most recent open.
    pub fn last_url(&self) -> Option<String> {
        self.last_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Browser for SimulatedBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.to_string());

        if let Some(redirect) = self.redirect.clone() {
            let redirect = echo_state(&redirect, url);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match reqwest::get(&redirect).await {
                    Ok(resp) => debug!(status = %resp.status(), "simulated redirect delivered"),
                    Err(e) => debug!(error = %e, "simulated redirect failed"),
                }
            });
        }
        Ok(())
    }
}

/// Append the authorization URL's `state` to the redirect, as the provider
/// does.
fn echo_state(redirect: &str, authorization_url: &str) -> String {
    let state = authorization_url
        .split_once('?')
        .map(|(_, query)| query)
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| pair.strip_prefix("state="));

    match state {
        Some(state) if !redirect.contains("state=") => {
            let sep = if redirect.contains('?') { '&' } else { '?' };
            format!("{redirect}{sep}state={state}")
        }
        _ => redirect.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_state_appends_authorization_state() {
        assert_eq!(
            echo_state(
                "http://127.0.0.1:8000/callback?code=abc123&realmId=999",
                "https://mock.invalid/authorize?client_id=x&state=s1"
            ),
            "http://127.0.0.1:8000/callback?code=abc123&realmId=999&state=s1"
        );
    }

    #[test]
    fn echo_state_keeps_explicit_state() {
        let redirect = "http://127.0.0.1:8000/callback?code=c&realmId=r&state=forged";
        assert_eq!(
            echo_state(redirect, "https://mock.invalid/authorize?state=s1"),
            redirect
        );
    }
}
