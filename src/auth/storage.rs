use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use super::error::StorageError;
use crate::config::Environment;
use crate::consts::now_ms;

/// The persisted QuickBooks credential set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Company (realm) the tokens were granted for.
    #[serde(default, alias = "company_id")]
    pub realm_id: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    /// Access token expiry in milliseconds since epoch. `None` means unknown.
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expires_at: Option<u64>,
    /// When the record was last written, milliseconds since epoch.
    #[serde(default)]
    pub saved_at: Option<u64>,
}

impl CredentialRecord {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => now_ms() >= expires,
            None => false,
        }
    }

    /// Access token present and unexpired, realm known.
    pub fn is_usable(&self) -> bool {
        has_value(&self.access_token) && !self.is_expired() && has_value(&self.realm_id)
    }

    pub fn is_refreshable(&self) -> bool {
        has_value(&self.refresh_token)
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.realm_id.is_none()
    }
}

fn has_value(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.is_empty())
}

/// Unix milliseconds, or an ISO-8601 timestamp as older token files store it.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawExpiry {
        Millis(u64),
        Text(String),
    }

    Ok(match Option::<RawExpiry>::deserialize(deserializer)? {
        Some(RawExpiry::Millis(ms)) => Some(ms),
        Some(RawExpiry::Text(text)) => Some(parse_iso_expiry(&text)),
        None => None,
    })
}

/// Offset-less timestamps are local time. Unparsable values count as
/// already expired so the token gets refreshed.
fn parse_iso_expiry(text: &str) -> u64 {
    let millis = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
                .map(|dt| dt.timestamp_millis())
        });

    match millis {
        Some(ms) => u64::try_from(ms).unwrap_or(0),
        None => {
            warn!(value = text, "unrecognised expires_at, treating token as expired");
            0
        }
    }
}

/// Credentials supplied directly through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub realm_id: Option<String>,
    /// Environment stamped on a record built purely from overrides.
    pub environment: Environment,
}

impl CredentialOverrides {
    fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.realm_id.is_none()
    }

    /// Fill what the file did not provide. A realm recorded by a grant is
    /// never replaced, and an expired token the file can refresh is never
    /// swapped for the environment's access token.
    fn apply(&self, record: &mut CredentialRecord) {
        if record.is_empty() {
            record.environment = self.environment;
        }
        if !record.is_usable()
            && !record.is_refreshable()
            && let Some(access) = &self.access_token
        {
            record.access_token = Some(access.clone());
            record.expires_at = None;
        }
        if record.refresh_token.is_none() {
            record.refresh_token = self.refresh_token.clone();
        }
        if record.realm_id.is_none() {
            record.realm_id = self.realm_id.clone();
        }
    }
}

/// On-disk shape written by [`TokenStore::save`].
#[derive(Serialize)]
struct TokenFile<'a> {
    access_token: Option<&'a str>,
    refresh_token: Option<&'a str>,
    realm_id: Option<&'a str>,
    environment: Environment,
    expires_at: Option<u64>,
    saved_at: u64,
}

/// Reads and writes the JSON token file.
///
/// The store is the only component touching the file; callers own the
/// in-memory record.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    overrides: CredentialOverrides,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: CredentialOverrides::default(),
        }
    }

    /// Use environment-supplied credentials when the file has no usable
    /// access token.
    pub fn with_overrides(mut self, overrides: CredentialOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored record. Never fails: a missing or malformed file
    /// yields an empty record (with a warning for the malformed case).
    pub fn load(&self) -> CredentialRecord {
        let mut record = self.read_file();
        if !record.is_usable() && !self.overrides.is_empty() {
            debug!("token file has no usable access token, applying environment overrides");
            self.overrides.apply(&mut record);
        }
        record
    }

    fn read_file(&self) -> CredentialRecord {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no token file");
                return CredentialRecord::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read token file");
                return CredentialRecord::default();
            }
        };

        if content.trim().is_empty() {
            return CredentialRecord::default();
        }

        match serde_json::from_str::<CredentialRecord>(&content) {
            Ok(record) => {
                info!(path = %self.path.display(), "loaded tokens");
                record
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring malformed token file");
                CredentialRecord::default()
            }
        }
    }

    /// Write the record, creating parent directories. Not atomic.
    pub fn save(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        let file = TokenFile {
            access_token: record.access_token.as_deref(),
            refresh_token: record.refresh_token.as_deref(),
            realm_id: record.realm_id.as_deref(),
            environment: record.environment,
            expires_at: record.expires_at,
            saved_at: record.saved_at.unwrap_or_else(now_ms),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&self.path).map_err(io_err)?;
        handle.write_all(json.as_bytes()).map_err(io_err)?;

        info!(path = %self.path.display(), "saved tokens");
        Ok(())
    }

    /// Delete the token file. Succeeds when there is nothing to delete.
    pub fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "cleared tokens");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(access: Option<&str>, expires_at: Option<u64>, realm: Option<&str>) -> CredentialRecord {
        CredentialRecord {
            access_token: access.map(String::from),
            realm_id: realm.map(String::from),
            expires_at,
            ..CredentialRecord::default()
        }
    }

    #[test]
    fn usable_requires_token_realm_and_future_expiry() {
        assert!(record(Some("a"), Some(u64::MAX), Some("1")).is_usable());
        assert!(record(Some("a"), None, Some("1")).is_usable());
        assert!(!record(Some("a"), Some(0), Some("1")).is_usable());
        assert!(!record(Some("a"), Some(u64::MAX), None).is_usable());
        assert!(!record(None, Some(u64::MAX), Some("1")).is_usable());
        assert!(!record(Some(""), Some(u64::MAX), Some("1")).is_usable());
    }

    #[test]
    fn refreshable_only_with_refresh_token() {
        let mut rec = CredentialRecord::default();
        assert!(!rec.is_refreshable());
        rec.refresh_token = Some("r".into());
        assert!(rec.is_refreshable());
    }

    #[test]
    fn overrides_fill_missing_fields() {
        let overrides = CredentialOverrides {
            access_token: Some("env-access".into()),
            refresh_token: Some("env-refresh".into()),
            realm_id: Some("env-realm".into()),
            environment: Environment::Production,
        };
        let mut rec = CredentialRecord::default();
        overrides.apply(&mut rec);
        assert_eq!(rec.access_token.as_deref(), Some("env-access"));
        assert_eq!(rec.refresh_token.as_deref(), Some("env-refresh"));
        assert_eq!(rec.realm_id.as_deref(), Some("env-realm"));
        assert_eq!(rec.expires_at, None);
        assert_eq!(rec.environment, Environment::Production);
    }

    #[test]
    fn overrides_never_replace_granted_realm() {
        let overrides = CredentialOverrides {
            realm_id: Some("env-realm".into()),
            refresh_token: Some("env-refresh".into()),
            ..CredentialOverrides::default()
        };
        let mut rec = CredentialRecord {
            refresh_token: Some("file-refresh".into()),
            realm_id: Some("file-realm".into()),
            ..CredentialRecord::default()
        };
        overrides.apply(&mut rec);
        assert_eq!(rec.realm_id.as_deref(), Some("file-realm"));
        assert_eq!(rec.refresh_token.as_deref(), Some("file-refresh"));
    }

    #[test]
    fn overrides_leave_refreshable_record_alone() {
        let overrides = CredentialOverrides {
            access_token: Some("env-access".into()),
            ..CredentialOverrides::default()
        };
        let mut rec = CredentialRecord {
            access_token: Some("expired".into()),
            refresh_token: Some("file-refresh".into()),
            realm_id: Some("1".into()),
            expires_at: Some(1),
            ..CredentialRecord::default()
        };
        overrides.apply(&mut rec);
        assert_eq!(rec.access_token.as_deref(), Some("expired"));
        assert_eq!(rec.expires_at, Some(1));
        assert!(!rec.is_usable());
        assert!(rec.is_refreshable());
    }

    #[test]
    fn legacy_company_id_key_accepted() {
        let rec: CredentialRecord =
            serde_json::from_str(r#"{"access_token":"a","company_id":"42"}"#).unwrap();
        assert_eq!(rec.realm_id.as_deref(), Some("42"));
        assert_eq!(rec.environment, Environment::Sandbox);
    }

    #[test]
    fn legacy_file_with_iso_timestamps_loads() {
        let rec: CredentialRecord = serde_json::from_str(
            r#"{
                "access_token": "a",
                "refresh_token": "r",
                "company_id": "42",
                "expires_at": "2099-01-01T00:00:00.123456",
                "created_at": "2024-05-01T10:00:00.000001"
            }"#,
        )
        .unwrap();
        assert_eq!(rec.refresh_token.as_deref(), Some("r"));
        assert_eq!(rec.realm_id.as_deref(), Some("42"));
        assert!(rec.expires_at.unwrap() > now_ms());
        assert!(rec.is_usable());
    }

    #[test]
    fn iso_expiry_in_the_past_is_expired() {
        let rec: CredentialRecord = serde_json::from_str(
            r#"{"access_token":"a","realm_id":"1","expires_at":"2020-01-01T00:00:00"}"#,
        )
        .unwrap();
        assert!(rec.is_expired());
    }

    #[test]
    fn offset_and_garbage_expiry_values() {
        let rec: CredentialRecord =
            serde_json::from_str(r#"{"expires_at":"2099-01-01T00:00:00+00:00"}"#).unwrap();
        assert_eq!(rec.expires_at, Some(4_070_908_800_000));

        let rec: CredentialRecord =
            serde_json::from_str(r#"{"expires_at":"next tuesday"}"#).unwrap();
        assert_eq!(rec.expires_at, Some(0));

        let rec: CredentialRecord = serde_json::from_str(r#"{"expires_at":null}"#).unwrap();
        assert_eq!(rec.expires_at, None);
    }
}
