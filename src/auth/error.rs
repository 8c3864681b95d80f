use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the token file.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize credentials: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything that can go wrong while acquiring, refreshing or revoking
/// QuickBooks credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Client id/secret or redirect URI missing or invalid. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No redirect reached the callback listener in time.
    #[error("no OAuth redirect received within {}s", .0.as_secs())]
    OAuthTimeout(Duration),

    /// The provider redirected back with an `error` parameter.
    #[error("authorization denied: {0}")]
    OAuthDenied(String),

    /// Non-2xx answer from the token, refresh or revoke endpoint.
    #[error("token endpoint returned {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to bind OAuth callback listener on {addr}: {source}")]
    CallbackBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OAuth callback listener stopped before a redirect arrived")]
    CallbackClosed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("not authenticated with QuickBooks Online")]
    NotAuthenticated,
}

impl AuthError {
    /// Whether the provider rejected the token itself (already revoked,
    /// expired or unknown), as opposed to a transient or server failure.
    pub fn indicates_invalid_token(&self) -> bool {
        match self {
            AuthError::Protocol { status, body } => {
                *status == 400
                    || (*status == 401
                        && (body.contains("invalid_grant") || body.contains("invalid_token")))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(status: u16, body: &str) -> AuthError {
        AuthError::Protocol {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn bad_request_means_invalid_token() {
        assert!(protocol(400, r#"{"error":"invalid_grant"}"#).indicates_invalid_token());
        assert!(protocol(400, "").indicates_invalid_token());
    }

    #[test]
    fn unauthorized_needs_token_error_body() {
        assert!(protocol(401, r#"{"error":"invalid_token"}"#).indicates_invalid_token());
        assert!(!protocol(401, r#"{"error":"invalid_client"}"#).indicates_invalid_token());
    }

    #[test]
    fn server_errors_are_not_invalid_token() {
        assert!(!protocol(500, "invalid_grant").indicates_invalid_token());
        assert!(!protocol(503, "").indicates_invalid_token());
        assert!(!AuthError::NotAuthenticated.indicates_invalid_token());
    }

    #[test]
    fn display_includes_status_and_body() {
        let msg = protocol(401, "nope").to_string();
        assert!(msg.contains("401"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn timeout_display_in_seconds() {
        let msg = AuthError::OAuthTimeout(Duration::from_secs(300)).to_string();
        assert!(msg.contains("300s"));
    }
}
