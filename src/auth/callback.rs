//! One-shot local listener for the OAuth redirect.
//!
//! [`CallbackServer::bind`] starts an HTTP listener on the redirect URI's
//! host and port. The first request to the callback path carrying either
//! `code` + `realmId` or `error` resolves a one-shot channel that
//! [`CallbackServer::wait`] awaits. The listener is torn down on every exit
//! path: normal completion, denial, timeout, or the server being dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::AuthError;
use crate::config::CallbackAddress;

/// How long a graceful shutdown may take before the task is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>QuickBooks Online</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>Authentication successful!</h2>
<p>You can close this window and return to your application.</p>
<script>window.close();</script>
</body>
</html>"#;

const FAILURE_PAGE: &str =
    "<html><body><h1>Authentication failed.</h1><p>You can close this window.</p></body></html>";

const INVALID_PAGE: &str = "<html><body><h1>Invalid request.</h1></body></html>";

/// Code and realm captured from a successful redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub code: String,
    pub realm_id: String,
}

#[derive(Debug)]
enum CallbackOutcome {
    Granted(AuthorizationGrant),
    Denied(String),
}

struct CallbackState {
    path: String,
    expected_state: Option<String>,
    tx: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

impl CallbackState {
    async fn resolve(&self, outcome: CallbackOutcome) {
        match self.tx.lock().await.take() {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => debug!("callback already resolved, ignoring repeat redirect"),
        }
    }
}

/// A bound callback listener waiting for one redirect.
#[derive(Debug)]
pub struct CallbackServer {
    local_addr: SocketAddr,
    outcome: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the listener and start serving in a background task.
    ///
    /// When `expected_state` is set, a redirect without that exact `state`
    /// is rejected as an invalid request.
    pub async fn bind(
        addr: &CallbackAddress,
        expected_state: Option<String>,
    ) -> Result<Self, AuthError> {
        let bind_addr = addr.bind_addr();
        let bind_err = |source| AuthError::CallbackBind {
            addr: bind_addr.clone(),
            source,
        };

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            path: addr.path.clone(),
            expected_state,
            tx: Mutex::new(Some(tx)),
        });

        let app = Router::new().fallback(handle_request).with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "OAuth callback listener failed");
            }
        });

        info!(addr = %local_addr, path = %addr.path, "started OAuth callback listener");

        Ok(Self {
            local_addr,
            outcome: Some(rx),
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the redirect, then stop the listener regardless of outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<AuthorizationGrant, AuthError> {
        let Some(rx) = self.outcome.take() else {
            self.shutdown().await;
            return Err(AuthError::CallbackClosed);
        };
        let result = tokio::time::timeout(timeout, rx).await;
        self.shutdown().await;

        match result {
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "OAuth timeout, no redirect received");
                Err(AuthError::OAuthTimeout(timeout))
            }
            Ok(Err(_)) => Err(AuthError::CallbackClosed),
            Ok(Ok(CallbackOutcome::Granted(grant))) => Ok(grant),
            Ok(Ok(CallbackOutcome::Denied(error))) => {
                warn!(error = %error, "OAuth authorization denied");
                Err(AuthError::OAuthDenied(error))
            }
        }
    }

    /// Stop the listener and wait until its socket is released.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                debug!("graceful shutdown timed out, aborting callback listener");
                task.abort();
                let _ = task.await;
            }
            info!(addr = %self.local_addr, "stopped OAuth callback listener");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_request(
    State(state): State<Arc<CallbackState>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if method != Method::GET || uri.path() != state.path {
        debug!(%method, path = uri.path(), "rejecting request to callback listener");
        return respond(StatusCode::BAD_REQUEST, INVALID_PAGE);
    }

    if let Some(expected) = &state.expected_state
        && params.get("state") != Some(expected)
    {
        warn!("OAuth redirect carried a missing or unexpected state value");
        return respond(StatusCode::BAD_REQUEST, INVALID_PAGE);
    }

    if let Some(error) = params.get("error") {
        let detail = match params.get("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        };
        state.resolve(CallbackOutcome::Denied(detail)).await;
        return respond(StatusCode::BAD_REQUEST, FAILURE_PAGE);
    }

    match (non_empty(&params, "code"), non_empty(&params, "realmId")) {
        (Some(code), Some(realm_id)) => {
            info!(realm_id, "received OAuth redirect");
            state
                .resolve(CallbackOutcome::Granted(AuthorizationGrant {
                    code: code.to_string(),
                    realm_id: realm_id.to_string(),
                }))
                .await;
            respond(StatusCode::OK, SUCCESS_PAGE)
        }
        _ => respond(StatusCode::BAD_REQUEST, INVALID_PAGE),
    }
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

type Page = (
    StatusCode,
    [(header::HeaderName, &'static str); 1],
    Html<&'static str>,
);

fn respond(status: StatusCode, page: &'static str) -> Page {
    (status, [(header::CONNECTION, "close")], Html(page))
}
