//! Thin authenticated client for the QuickBooks Online accounting API.
//!
//! Only built by the [`Authenticator`](crate::auth::Authenticator) or from a
//! usable [`CredentialRecord`]. Responses are returned as raw JSON.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

use crate::auth::error::AuthError;
use crate::auth::storage::CredentialRecord;
use crate::consts::MINOR_VERSION;

pub struct QboClient {
    access_token: String,
    realm_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for QboClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QboClient")
            .field("realm_id", &self.realm_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl QboClient {
    /// Refuses records without an access token or realm.
    pub fn from_record(record: &CredentialRecord) -> Result<Self, AuthError> {
        let access_token = record
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NotAuthenticated)?;
        let realm_id = record
            .realm_id
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(AuthError::NotAuthenticated)?;

        Ok(Self {
            access_token: access_token.to_string(),
            realm_id: realm_id.to_string(),
            base_url: record.environment.api_base_url().to_string(),
            http: reqwest::Client::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn realm_id(&self) -> &str {
        &self.realm_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a QBO SQL-like query, e.g. `SELECT * FROM Customer`.
    pub async fn query(&self, sql: &str) -> Result<Value> {
        self.get("query", &[("query", sql)]).await
    }

    /// Fetch a named report (`ProfitAndLoss`, `BalanceSheet`, `CashFlow`, ...).
    pub async fn report(&self, name: &str, params: &[(String, String)]) -> Result<Value> {
        let params: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.get(&format!("reports/{name}"), &params).await
    }

    pub async fn company_info(&self) -> Result<Value> {
        self.get(&format!("companyinfo/{}", self.realm_id), &[]).await
    }

    pub async fn accounts(&self) -> Result<Value> {
        self.query("SELECT * FROM Account").await
    }

    pub async fn customers(&self) -> Result<Value> {
        self.query("SELECT * FROM Customer").await
    }

    pub async fn recent_invoices(&self, limit: u32) -> Result<Value> {
        self.query(&format!(
            "SELECT * FROM Invoice ORDERBY TxnDate DESC STARTPOSITION 1 MAXRESULTS {limit}"
        ))
        .await
    }

    async fn get(&self, resource: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!(
            "{}/v3/company/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.realm_id,
            resource
        );
        debug!(%url, "QBO request");

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .query(params)
            .query(&[("minorversion", MINOR_VERSION)])
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("QBO API error ({}): {}", status.as_u16(), body);
        }

        resp.json().await.context("failed to parse QBO response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn record() -> CredentialRecord {
        CredentialRecord {
            access_token: Some("access".into()),
            realm_id: Some("4620816365".into()),
            environment: Environment::Production,
            ..CredentialRecord::default()
        }
    }

    #[test]
    fn base_url_follows_environment() {
        let client = QboClient::from_record(&record()).unwrap();
        assert_eq!(client.base_url(), "https://quickbooks.api.intuit.com");
        assert_eq!(client.realm_id(), "4620816365");
    }

    #[test]
    fn refuses_record_without_realm() {
        let mut rec = record();
        rec.realm_id = None;
        assert!(matches!(
            QboClient::from_record(&rec),
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[test]
    fn refuses_record_without_access_token() {
        let mut rec = record();
        rec.access_token = Some(String::new());
        assert!(QboClient::from_record(&rec).is_err());
    }

    #[test]
    fn debug_hides_token() {
        let client = QboClient::from_record(&record()).unwrap();
        assert!(!format!("{client:?}").contains("access"));
    }
}
