//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

/// Intuit authorization endpoint (browser redirect target).
pub const AUTHORIZE_URL: &str = "https://appcenter.intuit.com/connect/oauth2";

/// Bearer endpoint, used for both code exchange and refresh.
pub const TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

pub const REVOKE_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";

pub const SANDBOX_API_URL: &str = "https://sandbox-quickbooks.api.intuit.com";
pub const PRODUCTION_API_URL: &str = "https://quickbooks.api.intuit.com";

/// QBO API minor version sent with every request.
pub const MINOR_VERSION: &str = "75";

/// Scope granting access to the accounting API.
pub const DEFAULT_SCOPE: &str = "com.intuit.quickbooks.accounting";

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8000/callback";

/// How long the interactive flow waits for the browser redirect.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Access tokens are treated as expired this long before the provider says so.
pub const EXPIRY_MARGIN_MS: u64 = 5 * 60 * 1000;

/// Default token file path: `~/.qbo-mcp/tokens.json`.
/// Falls back to the working directory when no home directory is known.
pub fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".qbo-mcp")
        .join("tokens.json")
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
