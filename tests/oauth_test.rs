use httpmock::prelude::*;
use serde_json::json;

use qbo_mcp::auth::AuthError;
use qbo_mcp::auth::oauth::{OAuthEndpoints, TokenClient, TokenEndpoint};
use qbo_mcp::auth::storage::CredentialRecord;
use qbo_mcp::config::{Environment, QboConfig};
use qbo_mcp::consts::now_ms;

// base64("client-id:client-secret")
const BASIC: &str = "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ=";

fn config() -> QboConfig {
    QboConfig::from_lookup(|key| match key {
        "QBO_CLIENT_ID" => Some("client-id".to_string()),
        "QBO_CLIENT_SECRET" => Some("client-secret".to_string()),
        "QBO_REDIRECT_URI" => Some("http://localhost:8000/callback".to_string()),
        "QBO_ENVIRONMENT" => Some("production".to_string()),
        _ => None,
    })
}

fn client(server: &MockServer) -> TokenClient {
    TokenClient::new(&config()).with_endpoints(OAuthEndpoints {
        authorize_url: server.url("/authorize"),
        token_url: server.url("/token"),
        revoke_url: server.url("/revoke"),
    })
}

fn stored(refresh: &str) -> CredentialRecord {
    CredentialRecord {
        access_token: Some("old-access".into()),
        refresh_token: Some(refresh.into()),
        realm_id: Some("999".into()),
        environment: Environment::Production,
        expires_at: Some(0),
        saved_at: None,
    }
}

// ── Authorization URL ─────────────────────────────────────────────

#[test]
fn authorization_url_carries_all_parameters() {
    let client = TokenClient::new(&config());
    let url = client.authorization_url(
        &[
            "com.intuit.quickbooks.accounting".to_string(),
            "openid".to_string(),
        ],
        "xyz",
    );

    assert!(url.starts_with("https://appcenter.intuit.com/connect/oauth2?"));
    assert!(url.contains("client_id=client-id"));
    assert!(url.contains("response_type=code"));
    assert!(url.contains("scope=com.intuit.quickbooks.accounting%20openid"));
    assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8000%2Fcallback"));
    assert!(url.contains("state=xyz"));
}

// ── Code exchange ─────────────────────────────────────────────────

#[tokio::test]
async fn exchange_posts_form_with_basic_auth() {
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", BASIC)
                .body_includes("grant_type=authorization_code")
                .body_includes("code=abc123")
                .body_includes("redirect_uri=http%3A%2F%2Flocalhost%3A8000%2Fcallback");
            then.status(200).json_body(json!({
                "token_type": "bearer",
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "x_refresh_token_expires_in": 8726400
            }));
        })
        .await;

    let before = now_ms();
    let rec = client(&server).exchange_code("abc123", "999").await.unwrap();

    token.assert_async().await;
    assert_eq!(rec.access_token.as_deref(), Some("new-access"));
    assert_eq!(rec.refresh_token.as_deref(), Some("new-refresh"));
    assert_eq!(rec.realm_id.as_deref(), Some("999"));
    assert_eq!(rec.environment, Environment::Production);
    let expires = rec.expires_at.unwrap();
    assert!(expires > before);
    assert!(expires < before + 3600 * 1000);
    assert!(rec.is_usable());
}

#[tokio::test]
async fn exchange_failure_is_protocol_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(400).body(r#"{"error":"invalid_grant"}"#);
        })
        .await;

    let err = client(&server)
        .exchange_code("used-code", "999")
        .await
        .unwrap_err();
    match err {
        AuthError::Protocol { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("expected Protocol, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    let client = TokenClient::new(&config()).with_endpoints(OAuthEndpoints {
        authorize_url: "http://127.0.0.1:1/authorize".to_string(),
        token_url: "http://127.0.0.1:1/token".to_string(),
        revoke_url: "http://127.0.0.1:1/revoke".to_string(),
    });
    let err = client.exchange_code("c", "r").await.unwrap_err();
    assert!(matches!(err, AuthError::Transport(_)));
}

// ── Refresh ───────────────────────────────────────────────────────

#[tokio::test]
async fn refresh_uses_rotated_token() {
    let server = MockServer::start_async().await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", BASIC)
                .body_includes("grant_type=refresh_token")
                .body_includes("refresh_token=refresh-1");
            then.status(200).json_body(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            }));
        })
        .await;

    let rec = client(&server).refresh(&stored("refresh-1")).await.unwrap();

    refresh.assert_async().await;
    assert_eq!(rec.access_token.as_deref(), Some("access-2"));
    assert_eq!(rec.refresh_token.as_deref(), Some("refresh-2"));
    assert_eq!(rec.realm_id.as_deref(), Some("999"));
    assert!(!rec.is_expired());
}

#[tokio::test]
async fn refresh_keeps_old_token_when_not_rotated() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .json_body(json!({ "access_token": "access-2", "expires_in": 3600 }));
        })
        .await;

    let rec = client(&server).refresh(&stored("refresh-1")).await.unwrap();
    assert_eq!(rec.refresh_token.as_deref(), Some("refresh-1"));
}

#[tokio::test]
async fn refresh_without_token_is_rejected_locally() {
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(200);
        })
        .await;

    let err = client(&server)
        .refresh(&CredentialRecord::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));
    token.assert_calls_async(0).await;
}

// ── Revoke ────────────────────────────────────────────────────────

#[tokio::test]
async fn revoke_posts_json_token() {
    let server = MockServer::start_async().await;
    let revoke = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/revoke")
                .header("authorization", BASIC)
                .body_includes(r#""token":"refresh-1""#);
            then.status(200);
        })
        .await;

    client(&server).revoke(&stored("refresh-1")).await.unwrap();
    revoke.assert_async().await;
}

#[tokio::test]
async fn revoke_server_error_is_not_invalid_token() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/revoke");
            then.status(503).body("maintenance");
        })
        .await;

    let err = client(&server).revoke(&stored("r")).await.unwrap_err();
    assert!(!err.indicates_invalid_token());
}
