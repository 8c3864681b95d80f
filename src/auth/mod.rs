pub mod callback;
pub mod error;
pub mod mock;
pub mod oauth;
pub mod storage;

pub use error::{AuthError, StorageError};
pub use storage::{CredentialRecord, TokenStore};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::QboClient;
use crate::config::{Environment, QboConfig};
use crate::consts::now_ms;
use callback::CallbackServer;
use oauth::{TokenClient, TokenEndpoint};

/// Something that can show the authorization page to the user.
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs in the desktop's default browser.
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Where the authenticator is in the credential lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// Interactive grant in progress.
    Authenticating,
    Authenticated,
    Refreshing,
    /// Tokens were revoked. A new grant starts the cycle over.
    Revoked,
}

/// Read-only view of the current credentials for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyInfo {
    pub realm_id: String,
    pub environment: Environment,
    pub expires_at: Option<u64>,
    pub saved_at: Option<u64>,
    pub state: AuthState,
}

struct Session {
    record: CredentialRecord,
    state: AuthState,
}

/// Owns the QuickBooks credential lifecycle: reuse, refresh, interactive
/// grant and revocation, and hands out authenticated API clients.
///
/// Construct one per process and share it (e.g. behind an `Arc`). Refresh,
/// grant and revocation serialize on a single-flight lock, so at most one
/// interactive grant (and one callback listener) exists at a time. The
/// session itself sits behind a short lock that is never held across an
/// await, so state and company info stay readable while a flow runs.
pub struct Authenticator {
    config: QboConfig,
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    browser: Arc<dyn Browser>,
    flow: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

impl Authenticator {
    /// Wire the Intuit token client, the system browser and the configured
    /// token file.
    pub fn new(config: QboConfig) -> Self {
        let store = TokenStore::new(&config.token_file).with_overrides(config.overrides.clone());
        let endpoint = Arc::new(TokenClient::new(&config));
        Self::with_parts(config, store, endpoint, Arc::new(SystemBrowser))
    }

    pub fn with_parts(
        config: QboConfig,
        store: TokenStore,
        endpoint: Arc<dyn TokenEndpoint>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        let mut record = store.load();
        if !record.is_empty() && record.environment != config.environment {
            warn!(
                stored = %record.environment,
                configured = %config.environment,
                "stored credentials belong to another environment, a new authorization is required"
            );
            record = CredentialRecord::default();
        }

        let state = if record.is_usable() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };

        Self {
            config,
            store,
            endpoint,
            browser,
            flow: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session { record, state }),
        }
    }

    pub fn config(&self) -> &QboConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn state(&self) -> AuthState {
        self.session().state
    }

    /// Whether the in-memory credentials can be used without any network call.
    pub fn is_authenticated(&self) -> bool {
        self.session().record.is_usable()
    }

    /// Make sure usable credentials exist, refreshing or running the
    /// interactive grant as needed.
    pub async fn ensure_authenticated(&self) -> Result<(), AuthError> {
        let _flow = self.flow.lock().await;
        self.ensure_session().await.map(|_| ())
    }

    /// Build a QBO API client from freshly ensured credentials.
    pub async fn get_authenticated_client(&self) -> Result<QboClient, AuthError> {
        let _flow = self.flow.lock().await;
        let record = self.ensure_session().await?;
        QboClient::from_record(&record)
    }

    /// Revoke the refresh token and forget all credentials.
    ///
    /// Returns `Ok(false)` without any network call when there is nothing to
    /// revoke. Local state is cleared when the provider confirms the
    /// revocation or reports the token as already invalid; any other failure
    /// keeps local state and is returned.
    pub async fn revoke_tokens(&self) -> Result<bool, AuthError> {
        let _flow = self.flow.lock().await;
        let current = self.session().record.clone();
        if !current.is_refreshable() {
            debug!("no refresh token held, nothing to revoke");
            return Ok(false);
        }
        self.config.require_client_credentials()?;

        match self.endpoint.revoke(&current).await {
            Ok(()) => {}
            Err(e) if e.indicates_invalid_token() => {
                warn!(error = %e, "refresh token already invalid, clearing local credentials");
            }
            Err(e) => {
                error!(error = %e, "token revocation failed, keeping local credentials");
                return Err(e);
            }
        }

        self.install(CredentialRecord::default(), AuthState::Revoked);
        self.store.clear()?;
        info!("QuickBooks credentials revoked");
        Ok(true)
    }

    /// Current company and token metadata. Never touches the network and
    /// never waits for a running flow.
    pub fn company_info(&self) -> Result<CompanyInfo, AuthError> {
        let session = self.session();
        let record = &session.record;
        match (&record.realm_id, record.is_usable()) {
            (Some(realm_id), true) => Ok(CompanyInfo {
                realm_id: realm_id.clone(),
                environment: record.environment,
                expires_at: record.expires_at,
                saved_at: record.saved_at,
                state: session.state,
            }),
            _ => Err(AuthError::NotAuthenticated),
        }
    }

    /// [`company_info`](Self::company_info) rendered for tool output:
    /// the record, or `{"error": ...}`.
    pub fn company_info_json(&self) -> serde_json::Value {
        match self.company_info() {
            Ok(info) => serde_json::json!({
                "realm_id": info.realm_id,
                "environment": info.environment,
                "expires_at": info.expires_at,
                "saved_at": info.saved_at,
                "state": info.state,
            }),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AuthState) {
        self.session().state = state;
    }

    fn install(&self, record: CredentialRecord, state: AuthState) {
        let mut session = self.session();
        session.record = record;
        session.state = state;
    }

    /// Callers hold the flow lock. Returns the usable record.
    async fn ensure_session(&self) -> Result<CredentialRecord, AuthError> {
        let current = {
            let mut session = self.session();
            if session.record.is_usable() {
                debug!("reusing stored access token");
                session.state = AuthState::Authenticated;
                return Ok(session.record.clone());
            }
            session.record.clone()
        };

        self.config.require_client_credentials()?;

        if current.is_refreshable() {
            self.set_state(AuthState::Refreshing);
            info!("access token missing or expired, refreshing");
            match self.endpoint.refresh(&current).await {
                Ok(fresh) if fresh.is_usable() => {
                    let record = self.persist(fresh);
                    self.install(record.clone(), AuthState::Authenticated);
                    return Ok(record);
                }
                Ok(_) => {
                    warn!("refresh returned incomplete credentials, starting a new authorization");
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed, starting a new authorization");
                }
            }
        }

        self.set_state(AuthState::Authenticating);
        match self.run_grant().await {
            Ok(record) => {
                let record = self.persist(record);
                info!(
                    realm_id = record.realm_id.as_deref().unwrap_or_default(),
                    "authenticated with QuickBooks Online"
                );
                self.install(record.clone(), AuthState::Authenticated);
                Ok(record)
            }
            Err(e) => {
                self.set_state(AuthState::Unauthenticated);
                error!(error = %e, "QuickBooks authorization failed");
                Err(e)
            }
        }
    }

    /// One full interactive authorization-code grant.
    async fn run_grant(&self) -> Result<CredentialRecord, AuthError> {
        let callback = self.config.callback_address()?;
        let state = oauth::generate_state();
        let url = self.endpoint.authorization_url(&self.config.scopes, &state);

        let server = CallbackServer::bind(&callback, Some(state)).await?;

        info!(%url, "QuickBooks authorization required, opening browser");
        if let Err(e) = self.browser.open(&url) {
            warn!(error = %e, %url, "could not open a browser, visit the URL manually");
        }

        let grant = server.wait(self.config.auth_timeout).await?;
        let mut record = self
            .endpoint
            .exchange_code(&grant.code, &grant.realm_id)
            .await?;
        record.realm_id = Some(grant.realm_id);
        record.environment = self.config.environment;
        Ok(record)
    }

    /// Stamp and save. A failed write is logged; the credentials stay valid
    /// in memory for this process.
    fn persist(&self, mut record: CredentialRecord) -> CredentialRecord {
        record.saved_at = Some(now_ms());
        if let Err(e) = self.store.save(&record) {
            warn!(error = %e, "failed to persist tokens, keeping them in memory only");
        }
        record
    }
}
